//! Read-only access to a message store for the `list` and `show` commands.

use std::io::Write;

use anyhow::{anyhow, bail, Error};

use crate::store::{MessageId, MessageStore};

pub fn list<W>(store: &dyn MessageStore, out: &mut W) -> Result<(), Error>
where
    W: Write,
{
    for id in store.list()? {
        match store.get(id)? {
            Some(message) => writeln!(
                out,
                "{}  {}  <{}>  {}  {} bytes",
                id,
                message.received.to_rfc3339(),
                message.envelope.sender,
                message.envelope.recipients.join(", "),
                message.body.len()
            )?,
            None => warn!("message {} disappeared while listing", id),
        }
    }

    Ok(())
}

pub fn show<W>(store: &dyn MessageStore, id: &str, out: &mut W) -> Result<(), Error>
where
    W: Write,
{
    let id = match id.parse::<u64>() {
        Ok(id) => MessageId(id),
        Err(_) => bail!("invalid message id '{}'", id),
    };
    let message = store.get(id)?.ok_or_else(|| anyhow!("no message with id {}", id))?;

    writeln!(out, "X-Envelope-From: <{}>", message.envelope.sender)?;
    for rcpt in &message.envelope.recipients {
        writeln!(out, "X-Envelope-To: <{}>", rcpt)?;
    }
    writeln!(out, "X-Received-At: {}", message.received.to_rfc3339())?;
    out.write_all(&message.body)?;
    out.flush()?;

    Ok(())
}
