use std::fmt;

static OK_STATUS_CODE: u16 = 250;
static GREETING_STATUS_CODE: u16 = 220;
static BYE_STATUS_CODE: u16 = 221;
static AUTH_OK_STATUS_CODE: u16 = 235;
static DATA_STATUS_CODE: u16 = 354;
static CLOSING_STATUS_CODE: u16 = 421;
static INSUFFICIENT_STORAGE_STATUS_CODE: u16 = 452;
static UNKNOWN_COMMAND_STATUS_CODE: u16 = 500;
static SYNTAX_ERROR_STATUS_CODE: u16 = 501;
static BAD_SEQUENCE_STATUS_CODE: u16 = 503;
static MESSAGE_TOO_BIG_STATUS_CODE: u16 = 552;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub lines: Vec<String>,
}

impl fmt::Display for Reply {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if let Some((last, init)) = self.lines.split_last() {
            for line in init {
                fmt.write_fmt(format_args!("{}-{}\r\n", self.status, line))?;
            }
            fmt.write_fmt(format_args!("{} {}\r\n", self.status, last))?;
        }
        Ok(())
    }
}

impl Reply {
    fn single(status: u16, message: impl Into<String>) -> Self {
        Reply {
            status,
            lines: vec![message.into()],
        }
    }

    pub fn greeting(hostname: &str) -> Self {
        Reply::single(GREETING_STATUS_CODE, format!("{} ESMTP ready", hostname))
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Reply::single(OK_STATUS_CODE, message)
    }

    pub fn ok_many(messages: Vec<String>) -> Self {
        Reply {
            status: OK_STATUS_CODE,
            lines: messages,
        }
    }

    pub fn auth_ok() -> Self {
        Reply::single(AUTH_OK_STATUS_CODE, "Authentication successful")
    }

    pub fn bye() -> Self {
        Reply::single(BYE_STATUS_CODE, "Bye")
    }

    pub fn data() -> Self {
        Reply::single(DATA_STATUS_CODE, "End data with <CR><LF>.<CR><LF>")
    }

    pub fn idle_timeout() -> Self {
        Reply::single(CLOSING_STATUS_CODE, "Idle timeout, closing connection")
    }

    pub fn shutting_down() -> Self {
        Reply::single(CLOSING_STATUS_CODE, "Service closing transmission channel")
    }

    pub fn insufficient_storage() -> Self {
        Reply::single(INSUFFICIENT_STORAGE_STATUS_CODE, "Insufficient storage")
    }

    pub fn unknown_command() -> Self {
        Reply::single(UNKNOWN_COMMAND_STATUS_CODE, "Command not recognized")
    }

    pub fn line_too_long() -> Self {
        Reply::single(UNKNOWN_COMMAND_STATUS_CODE, "Line too long")
    }

    pub fn syntax_error() -> Self {
        Reply::single(SYNTAX_ERROR_STATUS_CODE, "Syntax error")
    }

    pub fn bad_sequence() -> Self {
        Reply::single(BAD_SEQUENCE_STATUS_CODE, "Bad sequence of commands")
    }

    pub fn message_too_big() -> Self {
        Reply::single(
            MESSAGE_TOO_BIG_STATUS_CODE,
            "Message size exceeds maximum allowed",
        )
    }
}
