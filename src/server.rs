use std::io::prelude::*;
use std::io::{self, BufReader, BufWriter, ErrorKind};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Error};
use threadpool::ThreadPool;

use crate::config::Settings;
use crate::proto::reply::Reply;
use crate::proto::Protocol;
use crate::store::MessageStore;

static ACCEPT_SLEEP_INTERVAL: Duration = Duration::from_millis(10);
static READ_POLL_INTERVAL: Duration = Duration::from_millis(100);
// RFC 5321 allows 512 octets, extensions push real clients past that
static MAX_COMMAND_LINE_LENGTH: usize = 4096;

/// State shared by the accept loop and every session.
struct Shared {
    settings: Settings,
    store: Arc<dyn MessageStore>,
    running: Arc<AtomicBool>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Stops accepting connections. Active sessions close after their
    /// current command.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    pub fn bind(settings: &Settings, store: Arc<dyn MessageStore>) -> Result<Self, Error> {
        let listener = TcpListener::bind(settings.address)
            .with_context(|| format!("can't listen on {}", settings.address))?;
        listener.set_nonblocking(true)?;

        Ok(Server {
            listener,
            shared: Arc::new(Shared {
                settings: settings.clone(),
                store,
                running: Arc::new(AtomicBool::new(true)),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.shared.running.clone(),
        }
    }

    /// Accepts connections until stopped, then waits for active sessions to
    /// finish.
    pub fn run(self) -> Result<(), Error> {
        let pool = ThreadPool::new(self.shared.settings.workers);
        info!("listening on {}", self.local_addr()?);

        while self.shared.is_running() {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => {
                    let shared = self.shared.clone();
                    pool.execute(move || handle_connection(stream, peer_addr, &shared));
                    if pool.queued_count() > 0 {
                        warn!(
                            "{} connections waiting for a free worker, consider raising --workers",
                            pool.queued_count()
                        );
                    }
                }
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_SLEEP_INTERVAL);
                }
                Err(err) => {
                    error!("accept failed: {:?}", err);
                    thread::sleep(ACCEPT_SLEEP_INTERVAL);
                }
            }
        }

        info!(
            "stopped accepting, waiting for {} active sessions",
            pool.active_count()
        );
        drop(self.listener);
        pool.join();

        Ok(())
    }
}

enum LineRead {
    Line,
    TooLong,
    Eof,
    IdleTimeout,
    Stopped,
}

fn write_reply<W>(writer: &mut W, reply: &Reply) -> Result<(), Error>
where
    W: Write,
{
    writer.write_all(format!("{}", reply).as_bytes())?;
    writer.flush()?;

    Ok(())
}

/// Reads one line of at most `limit` bytes into `buffer`, polling so that the
/// idle timeout and the stop signal are noticed while the peer is silent.
/// Bytes read before a poll timeout stay in `buffer`. `TooLong` leaves the
/// first `limit` bytes in `buffer` and the rest of the line unread.
fn read_line<R>(
    reader: &mut R,
    buffer: &mut Vec<u8>,
    limit: usize,
    shared: &Shared,
    interruptible: bool,
) -> io::Result<LineRead>
where
    R: BufRead,
{
    let mut last_activity = Instant::now();

    loop {
        let before = buffer.len();
        let remaining = limit.saturating_sub(before) as u64;
        if remaining == 0 {
            return Ok(LineRead::TooLong);
        }

        match reader.by_ref().take(remaining).read_until(b'\n', buffer) {
            Ok(0) => return Ok(LineRead::Eof),
            Ok(_) if buffer.ends_with(b"\n") => return Ok(LineRead::Line),
            Ok(_) if buffer.len() >= limit => return Ok(LineRead::TooLong),
            Ok(_) => return Ok(LineRead::Eof),
            Err(ref err)
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                if buffer.len() > before {
                    last_activity = Instant::now();
                }
                if interruptible && !shared.is_running() {
                    return Ok(LineRead::Stopped);
                }
                if last_activity.elapsed() >= shared.settings.idle_timeout {
                    return Ok(LineRead::IdleTimeout);
                }
            }
            Err(ref err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

fn handle_connection(stream: TcpStream, peer_addr: SocketAddr, shared: &Shared) {
    debug!("{} connected", peer_addr);

    match serve_session(&stream, peer_addr, shared) {
        Ok(()) => info!("{} closed connection", peer_addr),
        Err(err) => error!("{}: {}", peer_addr, err),
    }
}

fn serve_session(
    stream: &TcpStream,
    peer_addr: SocketAddr,
    shared: &Shared,
) -> Result<(), Error> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_POLL_INTERVAL))?;

    let mut buffer = Vec::with_capacity(1024 * 8);
    let mut reader = BufReader::new(stream);
    let mut writer = BufWriter::new(stream);
    let mut smtp = Protocol::new(&shared.settings.hostname, shared.store.clone());

    smtp.set_max_size(shared.settings.max_size);
    smtp.set_auth_required(shared.settings.auth_required);

    write_reply(&mut writer, &smtp.start())?;

    // set while the remainder of an overlong line is being skipped
    let mut overlong = false;

    loop {
        buffer.clear();

        let limit = if smtp.is_data() {
            shared.settings.max_size.saturating_add(2)
        } else {
            MAX_COMMAND_LINE_LENGTH
        };

        // a message body in flight is allowed to complete before shutdown
        match read_line(&mut reader, &mut buffer, limit, shared, !smtp.is_data())? {
            LineRead::Line if overlong => {
                overlong = false;
                continue;
            }
            LineRead::Line => {}
            LineRead::TooLong => {
                if smtp.is_data() {
                    // longer than the whole message may be, switches to discarding
                    smtp.process_data(&buffer);
                } else if !overlong {
                    warn!("{} sent a command line over {} bytes", peer_addr, limit);
                    write_reply(&mut writer, &Reply::line_too_long())?;
                }
                overlong = true;
                continue;
            }
            LineRead::Eof => break,
            LineRead::IdleTimeout => {
                info!("{} idle for too long, closing", peer_addr);
                write_reply(&mut writer, &Reply::idle_timeout())?;
                break;
            }
            LineRead::Stopped => {
                write_reply(&mut writer, &Reply::shutting_down())?;
                break;
            }
        }

        if smtp.is_data() {
            if let Some(reply) = smtp.process_data(&buffer) {
                write_reply(&mut writer, &reply)?;
            }
            continue;
        }

        let line = String::from_utf8_lossy(&buffer);
        let reply = smtp.process_command(&line);
        write_reply(&mut writer, &reply)?;

        if smtp.is_closing() {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, MessageId};
    use std::collections::HashSet;
    use std::io::{BufRead, Write};
    use std::thread::JoinHandle;

    struct TestServer {
        addr: SocketAddr,
        store: Arc<MemoryStore>,
        stop: StopHandle,
        handle: JoinHandle<()>,
    }

    fn start_test_server(settings: Settings) -> TestServer {
        let store = Arc::new(MemoryStore::new(0));
        let server = Server::bind(&settings, store.clone()).unwrap();
        let addr = server.local_addr().unwrap();
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run().unwrap());

        TestServer {
            addr,
            store,
            stop,
            handle,
        }
    }

    fn test_settings() -> Settings {
        Settings {
            address: "127.0.0.1:0".parse().unwrap(),
            hostname: "test.local".to_string(),
            workers: 8,
            ..Settings::default()
        }
    }

    struct Client {
        reader: BufReader<TcpStream>,
        writer: TcpStream,
    }

    impl Client {
        fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            Client {
                reader: BufReader::new(stream.try_clone().unwrap()),
                writer: stream,
            }
        }

        /// Reads a possibly multi-line reply and returns its status code.
        fn reply(&mut self) -> u16 {
            loop {
                let mut line = String::new();
                self.reader.read_line(&mut line).unwrap();
                assert!(line.len() >= 4, "short reply line {:?}", line);
                if line.as_bytes()[3] == b' ' {
                    return line[..3].parse().unwrap();
                }
            }
        }

        fn send(&mut self, raw: &str) {
            self.writer.write_all(raw.as_bytes()).unwrap();
            self.writer.flush().unwrap();
        }

        fn command(&mut self, command: &str) -> u16 {
            self.send(&format!("{}\r\n", command));
            self.reply()
        }

        fn is_closed(&mut self) -> bool {
            let mut rest = String::new();
            matches!(self.reader.read_line(&mut rest), Ok(0))
        }
    }

    #[test]
    fn complete_session_is_captured() {
        let server = start_test_server(test_settings());
        let mut client = Client::connect(server.addr);

        assert_eq!(client.reply(), 220);
        let codes = vec![
            client.command("EHLO test"),
            client.command("AUTH LOGIN"),
            client.command("MAIL FROM:<a@x.com>"),
            client.command("RCPT TO:<b@x.com>"),
            client.command("DATA"),
            {
                client.send("Hello\r\n.\r\n");
                client.reply()
            },
            client.command("QUIT"),
        ];
        assert_eq!(codes, vec![250, 235, 250, 250, 354, 250, 221]);
        assert!(client.is_closed());

        let ids = server.store.list().unwrap();
        assert_eq!(ids.len(), 1);
        let message = server.store.get(ids[0]).unwrap().unwrap();
        assert_eq!(message.envelope.sender, "a@x.com");
        assert_eq!(message.envelope.recipients, vec!["b@x.com"]);
        assert_eq!(message.body, b"Hello\r\n");

        server.stop.stop();
        server.handle.join().unwrap();
    }

    #[test]
    fn protocol_errors_keep_connection_open() {
        let server = start_test_server(test_settings());
        let mut client = Client::connect(server.addr);

        assert_eq!(client.reply(), 220);
        assert_eq!(client.command("RCPT TO:<b@x.com>"), 503);
        assert_eq!(client.command("BOGUS"), 500);
        assert_eq!(client.command("HELO test"), 250);
        assert_eq!(client.command("AUTH PLAIN AFdvcmRQcmVzcwA="), 235);
        assert_eq!(client.command("MAIL FROM:a@x.com"), 501);
        assert_eq!(client.command("MAIL FROM:<a@x.com>"), 250);
        assert_eq!(client.command("DATA"), 503);
        assert_eq!(client.command("QUIT"), 221);
        assert!(server.store.list().unwrap().is_empty());

        server.stop.stop();
        server.handle.join().unwrap();
    }

    #[test]
    fn idle_connection_is_closed_without_message() {
        let settings = Settings {
            idle_timeout: Duration::from_secs(1),
            ..test_settings()
        };
        let server = start_test_server(settings);
        let mut client = Client::connect(server.addr);

        assert_eq!(client.reply(), 220);
        client.command("EHLO test");
        client.command("AUTH LOGIN");
        client.command("MAIL FROM:<a@x.com>");
        client.command("RCPT TO:<b@x.com>");
        assert_eq!(client.command("DATA"), 354);
        client.send("partial body\r\n");

        assert_eq!(client.reply(), 421);
        assert!(client.is_closed());
        assert!(server.store.list().unwrap().is_empty());

        server.stop.stop();
        server.handle.join().unwrap();
    }

    #[test]
    fn concurrent_sessions_get_distinct_ids() {
        let server = start_test_server(test_settings());
        let addr = server.addr;

        let clients: Vec<_> = (0..8)
            .map(|n| {
                thread::spawn(move || {
                    let mut client = Client::connect(addr);
                    assert_eq!(client.reply(), 220);
                    client.command("EHLO test");
                    client.command("AUTH LOGIN");
                    client.command(&format!("MAIL FROM:<sender{}@x.com>", n));
                    client.command("RCPT TO:<b@x.com>");
                    assert_eq!(client.command("DATA"), 354);
                    client.send(&format!("message {}\r\n.\r\n", n));
                    assert_eq!(client.reply(), 250);
                    assert_eq!(client.command("QUIT"), 221);
                })
            })
            .collect();
        for client in clients {
            client.join().unwrap();
        }

        let ids: HashSet<MessageId> = server.store.list().unwrap().into_iter().collect();
        assert_eq!(ids.len(), 8);
        let senders: HashSet<String> = ids
            .iter()
            .map(|id| server.store.get(*id).unwrap().unwrap().envelope.sender)
            .collect();
        assert_eq!(senders.len(), 8);

        server.stop.stop();
        server.handle.join().unwrap();
    }

    #[test]
    fn stop_closes_idle_sessions() {
        let server = start_test_server(test_settings());
        let mut client = Client::connect(server.addr);
        assert_eq!(client.reply(), 220);
        assert_eq!(client.command("EHLO test"), 250);

        server.stop.stop();
        assert_eq!(client.reply(), 421);
        assert!(client.is_closed());
        server.handle.join().unwrap();
    }

    #[test]
    fn stop_lets_message_in_flight_complete() {
        let server = start_test_server(test_settings());
        let mut client = Client::connect(server.addr);
        assert_eq!(client.reply(), 220);
        client.command("EHLO test");
        client.command("AUTH LOGIN");
        client.command("MAIL FROM:<a@x.com>");
        client.command("RCPT TO:<b@x.com>");
        assert_eq!(client.command("DATA"), 354);
        client.send("first line\r\n");

        server.stop.stop();
        thread::sleep(Duration::from_millis(300));
        client.send("second line\r\n.\r\n");

        assert_eq!(client.reply(), 250);
        assert_eq!(client.reply(), 421);
        assert!(client.is_closed());
        server.handle.join().unwrap();

        let ids = server.store.list().unwrap();
        assert_eq!(ids.len(), 1);
        let message = server.store.get(ids[0]).unwrap().unwrap();
        assert_eq!(message.body, b"first line\r\nsecond line\r\n");
    }

    #[test]
    fn read_line_stops_at_limit() {
        let shared = Shared {
            settings: Settings {
                max_size: 16,
                ..test_settings()
            },
            store: Arc::new(MemoryStore::new(0)),
            running: Arc::new(AtomicBool::new(true)),
        };
        let mut reader = io::Cursor::new(vec![b'x'; 1_000_000]);
        let mut buffer = Vec::new();

        let read = read_line(&mut reader, &mut buffer, 18, &shared, false).unwrap();
        assert!(matches!(read, LineRead::TooLong));
        assert_eq!(buffer.len(), 18);

        let mut reader = io::Cursor::new(b"NOOP\r\nQUIT\r\n".to_vec());
        buffer.clear();
        let read = read_line(&mut reader, &mut buffer, 18, &shared, false).unwrap();
        assert!(matches!(read, LineRead::Line));
        assert_eq!(buffer, b"NOOP\r\n");
    }

    #[test]
    fn overlong_command_line_is_rejected() {
        let server = start_test_server(test_settings());
        let mut client = Client::connect(server.addr);
        assert_eq!(client.reply(), 220);

        let long = format!("HELO {}", "a".repeat(MAX_COMMAND_LINE_LENGTH * 3));
        assert_eq!(client.command(&long), 500);
        assert_eq!(client.command("NOOP"), 250);
        assert_eq!(client.command("HELO test"), 250);
        assert_eq!(client.command("QUIT"), 221);

        server.stop.stop();
        server.handle.join().unwrap();
    }

    #[test]
    fn unterminated_body_line_hits_size_limit() {
        let settings = Settings {
            max_size: 16,
            ..test_settings()
        };
        let server = start_test_server(settings);
        let mut client = Client::connect(server.addr);
        assert_eq!(client.reply(), 220);
        client.command("EHLO test");
        client.command("AUTH LOGIN");
        client.command("MAIL FROM:<a@x.com>");
        client.command("RCPT TO:<b@x.com>");
        assert_eq!(client.command("DATA"), 354);

        client.send(&"x".repeat(100_000));
        client.send(".\r\n.\r\n");
        assert_eq!(client.reply(), 552);
        assert_eq!(client.command("MAIL FROM:<a@x.com>"), 250);
        assert_eq!(client.command("QUIT"), 221);
        assert!(server.store.list().unwrap().is_empty());

        server.stop.stop();
        server.handle.join().unwrap();
    }

    #[test]
    fn connections_beyond_worker_count_wait_their_turn() {
        let settings = Settings {
            workers: 1,
            ..test_settings()
        };
        let server = start_test_server(settings);
        let mut first = Client::connect(server.addr);
        assert_eq!(first.reply(), 220);
        let mut second = Client::connect(server.addr);

        assert_eq!(first.command("QUIT"), 221);
        assert_eq!(second.reply(), 220);
        assert_eq!(second.command("QUIT"), 221);

        server.stop.stop();
        server.handle.join().unwrap();
    }

    #[test]
    fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let settings = Settings {
            address: taken.local_addr().unwrap(),
            ..test_settings()
        };
        assert!(Server::bind(&settings, Arc::new(MemoryStore::new(0))).is_err());
    }
}
