//! Authentication stub. Every mechanism and every credential is accepted;
//! the initial response is decoded only so the username can be logged.

use std::convert::Infallible;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

#[derive(Debug, Default, PartialEq)]
pub struct Credentials {
    pub mechanism: String,
    pub username: Option<String>,
}

pub fn authenticate(
    mechanism: &str,
    initial_response: Option<&str>,
) -> Result<Credentials, Infallible> {
    let mechanism = mechanism.to_uppercase();
    let decoded = initial_response
        .filter(|response| *response != "=")
        .and_then(|response| STANDARD.decode(response).ok());

    let username = decoded.and_then(|bytes| match mechanism.as_str() {
        // authzid \0 authcid \0 passwd
        "PLAIN" => bytes
            .split(|b| *b == 0)
            .nth(1)
            .map(|user| String::from_utf8_lossy(user).into_owned()),
        "LOGIN" => Some(String::from_utf8_lossy(&bytes).into_owned()),
        _ => None,
    });

    Ok(Credentials {
        mechanism,
        username,
    })
}
