use std::mem;
use std::sync::Arc;

use regex::Regex;

use crate::auth;
use crate::store::{Envelope, Message, MessageStore};

mod command;

pub mod reply;
pub mod state;

use self::command::*;
use self::reply::*;
use self::state::*;

pub static DEFAULT_MAX_SIZE: usize = 73_400_320;
static INITIAL_MESSAGE_BUFFER_SIZE: usize = 1024 * 4;

lazy_static! {
    static ref MAIL_COMMAND_REGEX: Regex =
        Regex::new(r"^(?i:From):\s*<(?P<email>[^<>]*)>(?P<params>.*)$").unwrap();
    static ref RCPT_COMMAND_REGEX: Regex =
        Regex::new(r"^(?i:To):\s*<(?P<email>[^<>]+)>").unwrap();
    static ref SIZE_PARAM_REGEX: Regex = Regex::new(r"(?:^|\s)(?i:Size)=(?P<size>\d+)").unwrap();
}

/// Strips SMTP dot-stuffing from a single body line.
pub fn unstuff(line: &[u8]) -> &[u8] {
    match line.first() {
        Some(b'.') => &line[1..],
        _ => line,
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// SMTP state machine for one connection. Performs no I/O itself: the caller
/// feeds it command lines or, while `is_data()`, raw body lines.
pub struct Protocol {
    pub state: State,
    pub client: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub message: Vec<u8>,

    hostname: String,
    max_size: usize,
    auth_required: bool,
    authenticated: bool,
    oversized: bool,
    closing: bool,
    store: Arc<dyn MessageStore>,
}

impl Protocol {
    pub fn new(hostname: &str, store: Arc<dyn MessageStore>) -> Self {
        Protocol {
            state: State::default(),
            client: String::new(),
            sender: String::new(),
            recipients: Vec::new(),
            message: Vec::with_capacity(INITIAL_MESSAGE_BUFFER_SIZE),
            hostname: hostname.to_string(),
            max_size: DEFAULT_MAX_SIZE,
            auth_required: true,
            authenticated: false,
            oversized: false,
            closing: false,
            store,
        }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size;
    }

    pub fn set_auth_required(&mut self, required: bool) {
        self.auth_required = required;
    }

    pub fn is_data(&self) -> bool {
        self.state == State::Data
    }

    /// True once QUIT has been answered.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    pub fn start(&mut self) -> Reply {
        self.state = State::Greeting;
        Reply::greeting(&self.hostname)
    }

    pub fn process_command(&mut self, line: &str) -> Reply {
        match parse_command(line.trim_end_matches(&['\r', '\n'][..])) {
            Ok(cmd) => self.command(&cmd),
            Err(_) => Reply::unknown_command(),
        }
    }

    /// Consumes one body line (line terminator included or not). Returns the
    /// final reply once the end-of-data marker arrives.
    pub fn process_data(&mut self, line: &[u8]) -> Option<Reply> {
        let line = trim_line_ending(line);
        if line == b"." {
            return Some(self.finish_data());
        }

        let line = unstuff(line);
        if self.oversized || self.message.len() + line.len() + 2 > self.max_size {
            if !self.oversized {
                warn!(
                    "message from <{}> exceeds {} bytes, discarding",
                    self.sender, self.max_size
                );
                self.oversized = true;
                self.message = Vec::new();
            }
            return None;
        }

        self.message.extend_from_slice(line);
        self.message.extend_from_slice(b"\r\n");
        None
    }

    fn command(&mut self, command: &Command) -> Reply {
        match (&command.verb, self.state) {
            (Verb::Quit, _) => {
                self.closing = true;
                Reply::bye()
            }
            (Verb::Noop, _) => Reply::ok("Ok"),
            (Verb::Rset, State::Greeting) => Reply::bad_sequence(),
            (Verb::Rset, _) => {
                self.cleanup();
                self.state = self.ready_state();
                Reply::ok("Ok")
            }
            (Verb::Ehlo, State::Greeting) => self.ehlo(command),
            (Verb::Helo, State::Greeting) => self.helo(command),
            (Verb::Auth, State::AfterEhlo) => self.auth(command),
            (Verb::Mail, state) if state.accepts_mail(self.auth_required) => self.mail(command),
            (Verb::Rcpt, State::MailFrom) | (Verb::Rcpt, State::RcptTo) => self.rcpt(command),
            (Verb::Data, State::RcptTo) if !self.recipients.is_empty() => self.data(),
            (Verb::Unknown(verb), _) => {
                debug!("unrecognized command {}", verb);
                Reply::unknown_command()
            }
            _ => Reply::bad_sequence(),
        }
    }

    fn ready_state(&self) -> State {
        if self.authenticated {
            State::AfterAuth
        } else {
            State::AfterEhlo
        }
    }

    fn cleanup(&mut self) {
        self.message.clear();
        self.recipients.clear();
        self.sender.clear();
        self.oversized = false;
    }

    fn ehlo(&mut self, cmd: &Command) -> Reply {
        if cmd.args.is_empty() {
            return Reply::syntax_error();
        }
        self.client = cmd.args.clone();
        self.state = State::AfterEhlo;
        Reply::ok_many(vec![
            self.hostname.clone(),
            format!("SIZE {}", self.max_size),
            "8BITMIME".to_string(),
            "AUTH PLAIN LOGIN".to_string(),
        ])
    }

    fn helo(&mut self, cmd: &Command) -> Reply {
        if cmd.args.is_empty() {
            return Reply::syntax_error();
        }
        self.client = cmd.args.clone();
        self.state = State::AfterEhlo;
        Reply::ok(self.hostname.clone())
    }

    fn auth(&mut self, cmd: &Command) -> Reply {
        let mut args = cmd.args.split_whitespace();
        let mechanism = match args.next() {
            Some(mechanism) => mechanism,
            None => return Reply::syntax_error(),
        };

        let creds =
            auth::authenticate(mechanism, args.next()).unwrap_or_else(|never| match never {});
        debug!(
            "{} authenticated with {} as {:?}",
            self.client, creds.mechanism, creds.username
        );

        self.authenticated = true;
        self.state = State::AfterAuth;
        Reply::auth_ok()
    }

    fn mail(&mut self, cmd: &Command) -> Reply {
        let cap = match MAIL_COMMAND_REGEX.captures(cmd.args.as_str()) {
            Some(cap) => cap,
            None => return Reply::syntax_error(),
        };

        let params = cap.name("params").map_or("", |params| params.as_str());
        if let Some(size) = SIZE_PARAM_REGEX
            .captures(params)
            .and_then(|cap| cap.name("size"))
        {
            // all digits, so a parse failure can only be an overflow
            match size.as_str().parse::<usize>() {
                Ok(size) if size <= self.max_size => {}
                _ => return Reply::message_too_big(),
            }
        }

        self.cleanup();
        self.sender = cap["email"].to_string();
        self.state = State::MailFrom;
        Reply::ok("Ok")
    }

    fn rcpt(&mut self, cmd: &Command) -> Reply {
        let m = RCPT_COMMAND_REGEX
            .captures(cmd.args.as_str())
            .and_then(|cap| cap.name("email").map(|email| email.as_str()));
        match m {
            Some(address) => {
                self.recipients.push(address.to_string());
                self.state = State::RcptTo;
                Reply::ok("Ok")
            }
            None => Reply::syntax_error(),
        }
    }

    fn data(&mut self) -> Reply {
        self.message.clear();
        self.oversized = false;
        self.state = State::Data;
        Reply::data()
    }

    fn finish_data(&mut self) -> Reply {
        if self.oversized {
            self.cleanup();
            self.state = self.ready_state();
            return Reply::message_too_big();
        }

        let envelope = match Envelope::new(self.sender.clone(), self.recipients.clone()) {
            Some(envelope) => envelope,
            None => {
                self.cleanup();
                self.state = self.ready_state();
                return Reply::bad_sequence();
            }
        };
        let body = mem::take(&mut self.message);
        let size = body.len();

        match self.store.save(Message::new(envelope, body)) {
            Ok(id) => {
                info!(
                    "captured message {} from <{}> to {:?}, size: {}",
                    id, self.sender, self.recipients, size
                );
                self.cleanup();
                self.state = State::Done;
                Reply::ok(format!("Ok: queued as {}", id))
            }
            Err(err) => {
                error!("failed to store message from <{}>: {}", self.sender, err);
                // envelope is kept so the client can resend DATA
                self.state = State::RcptTo;
                Reply::insufficient_storage()
            }
        }
    }
}
