use std::str::FromStr;

use anyhow::{anyhow, Error};

#[derive(Debug, Clone, PartialEq)]
pub enum Verb {
    Helo,
    Ehlo,
    Auth,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
    Unknown(String),
}

impl FromStr for Verb {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let verb = match s.to_uppercase().as_str() {
            "HELO" => Verb::Helo,
            "EHLO" => Verb::Ehlo,
            "AUTH" => Verb::Auth,
            "MAIL" => Verb::Mail,
            "RCPT" => Verb::Rcpt,
            "DATA" => Verb::Data,
            "RSET" => Verb::Rset,
            "NOOP" => Verb::Noop,
            "QUIT" => Verb::Quit,
            other => Verb::Unknown(other.to_string()),
        };
        Ok(verb)
    }
}

#[derive(Debug)]
pub struct Command {
    pub verb: Verb,
    pub args: String,
}

/// Splits a command line (without its line terminator) into verb and
/// whitespace-normalized arguments.
pub fn parse_command(line: &str) -> Result<Command, Error> {
    let items: Vec<&str> = line.split_whitespace().collect();

    match items.split_first() {
        None => Err(anyhow!("empty command line")),
        Some((verb, args)) => Ok(Command {
            verb: verb.parse()?,
            args: args.join(" "),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_test1() {
        let raw = "mail from: <test@example.com>";
        let cmd = parse_command(raw).unwrap();
        assert_eq!(cmd.verb, Verb::Mail);
        assert_eq!(cmd.args, "from: <test@example.com>");
    }

    #[test]
    fn parse_command_test2() {
        let cmd = parse_command("data").unwrap();
        assert_eq!(cmd.verb, Verb::Data);
        assert_eq!(cmd.args, "");
    }

    #[test]
    fn parse_command_collapses_whitespace() {
        let cmd = parse_command("AUTH   PLAIN\tAHVzZXIA").unwrap();
        assert_eq!(cmd.verb, Verb::Auth);
        assert_eq!(cmd.args, "PLAIN AHVzZXIA");
    }

    #[test]
    fn parse_command_keeps_unknown_verbs() {
        let cmd = parse_command("vrfy postmaster").unwrap();
        assert_eq!(cmd.verb, Verb::Unknown("VRFY".to_string()));
    }

    #[test]
    fn parse_command_rejects_blank_line() {
        assert!(parse_command("").is_err());
        assert!(parse_command("   ").is_err());
    }
}
