extern crate clap;
extern crate env_logger;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
extern crate ctrlc;
extern crate regex;
extern crate threadpool;

use std::io;

use anyhow::{bail, Error};
use clap::ArgMatches;

mod auth;
mod config;
mod inspect;
mod proto;
mod server;
mod store;

use config::Settings;
use server::Server;

fn serve(settings: &Settings) -> Result<(), Error> {
    let store = settings.open_store()?;
    match &settings.storage {
        Some(path) => info!("storing captured mail in {}", path.display()),
        None => info!("storing captured mail in memory"),
    }

    let server = Server::bind(settings, store)?;

    // Setup Ctrl-C handling
    let stop = server.stop_handle();
    ctrlc::set_handler(move || {
        info!("Caught Ctrl-C, exiting");
        stop.stop();
    })?;

    server.run()
}

fn run(matches: &ArgMatches) -> Result<(), Error> {
    let settings = Settings::from_matches(matches)?;

    match matches.subcommand() {
        ("list", _) | ("show", _) if settings.storage.is_none() => {
            bail!("--storage is required to inspect captured messages")
        }
        ("list", _) => {
            let store = settings.open_store()?;
            inspect::list(store.as_ref(), &mut io::stdout().lock())
        }
        ("show", Some(sub)) => {
            let store = settings.open_store()?;
            let id = sub.value_of("id").unwrap_or_default();
            inspect::show(store.as_ref(), id, &mut io::stdout().lock())
        }
        _ => serve(&settings),
    }
}

fn main() {
    env_logger::init();

    let args = config::app().get_matches();

    if let Err(e) = run(&args) {
        error!("{:#}", e);
        std::process::exit(-1);
    }
}
