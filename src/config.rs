use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Error};
use clap::{App, Arg, ArgMatches, SubCommand};

use crate::proto::DEFAULT_MAX_SIZE;
use crate::store::{DirStore, MemoryStore, MessageStore};

/// Startup configuration, read once and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Settings {
    pub address: SocketAddr,
    pub hostname: String,
    pub workers: usize,
    pub idle_timeout: Duration,
    pub max_size: usize,
    pub max_messages: usize,
    pub storage: Option<PathBuf>,
    pub auth_required: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            address: SocketAddr::from(([127, 0, 0, 1], 2525)),
            hostname: "localhost".to_string(),
            workers: 64,
            idle_timeout: Duration::from_secs(60),
            max_size: DEFAULT_MAX_SIZE,
            max_messages: 0,
            storage: None,
            auth_required: true,
        }
    }
}

impl Settings {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, Error> {
        let address = value(matches, "address")?
            .parse::<SocketAddr>()
            .context("invalid listen address")?;

        let workers = value(matches, "workers")?.parse::<usize>()?;
        if workers < 1 {
            bail!("number of workers can't be zero");
        }

        let idle_timeout = value(matches, "idle-timeout")?.parse::<u64>()?;
        if idle_timeout < 1 {
            bail!("idle timeout must be at least one second");
        }

        let max_size = value(matches, "max-size")?.parse::<usize>()?;
        if max_size < 1 {
            bail!("maximum message size can't be zero");
        }

        Ok(Settings {
            address,
            hostname: value(matches, "hostname")?.to_string(),
            workers,
            idle_timeout: Duration::from_secs(idle_timeout),
            max_size,
            max_messages: value(matches, "max-messages")?.parse::<usize>()?,
            storage: matches.value_of("storage").map(PathBuf::from),
            auth_required: !matches.is_present("no-auth"),
        })
    }

    pub fn open_store(&self) -> Result<Arc<dyn MessageStore>, Error> {
        match &self.storage {
            Some(path) => {
                let store = DirStore::open(path, self.max_messages)
                    .with_context(|| format!("can't open message store {}", path.display()))?;
                Ok(Arc::new(store))
            }
            None => Ok(Arc::new(MemoryStore::new(self.max_messages))),
        }
    }
}

fn value<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a str, Error> {
    match matches.value_of(name) {
        Some(value) => Ok(value),
        None => bail!("missing value for '{}'", name),
    }
}

pub fn app<'a, 'b>() -> App<'a, 'b> {
    App::new("Local SMTP capture server")
        .author("Konstantin Sorokin <kvs@sigterm.ru>")
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .env("SMTP_ADDRESS")
                .takes_value(true)
                .default_value("127.0.0.1:2525")
                .help("Address to listen"),
        )
        .arg(
            Arg::with_name("hostname")
                .long("hostname")
                .env("SMTP_HOSTNAME")
                .takes_value(true)
                .default_value("localhost")
                .help("Host name announced in greeting"),
        )
        .arg(
            Arg::with_name("workers")
                .short("w")
                .long("workers")
                .env("SMTP_WORKERS")
                .takes_value(true)
                .default_value("64")
                .help("Number of workers to launch, one per concurrent connection"),
        )
        .arg(
            Arg::with_name("idle-timeout")
                .long("idle-timeout")
                .env("SMTP_IDLE_TIMEOUT")
                .takes_value(true)
                .default_value("60")
                .help("Seconds a connection may stay idle"),
        )
        .arg(
            Arg::with_name("max-size")
                .long("max-size")
                .env("SMTP_MAX_SIZE")
                .takes_value(true)
                .default_value("73400320")
                .help("Maximum message size in bytes"),
        )
        .arg(
            Arg::with_name("max-messages")
                .long("max-messages")
                .env("SMTP_MAX_MESSAGES")
                .takes_value(true)
                .default_value("0")
                .help("Maximum number of stored messages, 0 for unlimited"),
        )
        .arg(
            Arg::with_name("storage")
                .short("s")
                .long("storage")
                .env("SMTP_STORAGE")
                .takes_value(true)
                .help("Directory to store captured messages in (memory if unset)"),
        )
        .arg(
            Arg::with_name("no-auth")
                .long("no-auth")
                .help("Accept MAIL without a preceding AUTH"),
        )
        .subcommand(SubCommand::with_name("list").about("List captured messages"))
        .subcommand(
            SubCommand::with_name("show")
                .about("Print a captured message")
                .arg(
                    Arg::with_name("id")
                        .required(true)
                        .index(1)
                        .help("Message id"),
                ),
        )
}
