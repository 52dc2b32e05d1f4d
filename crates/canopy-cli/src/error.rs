use std::fmt::Display;

use reqwest::StatusCode;

#[derive(Debug)]
pub enum Error {
    /// We couldn't reach the server, or the connection broke midway
    Transport(reqwest::Error),
    /// The server answered with a non-2xx status
    Http { status: u16, body: String },
    /// An error while (de)serializing json
    Serde(serde_json::Error),
    /// The server understood us but the call failed
    Rpc { code: i64, message: String },
    /// Reading a local file, like the TLS certificate
    Io(std::io::Error),
    /// Something in the client config doesn't make sense
    InvalidConfig(String),
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Transport(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Serde(value)
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Transport(e) => write!(f, "couldn't talk to the server: {e}"),
            // servers with nothing to say still get a readable error
            Error::Http { status, body } if body.is_empty() => {
                let reason = StatusCode::from_u16(*status)
                    .ok()
                    .and_then(|status| status.canonical_reason())
                    .unwrap_or("Unknown");
                write!(f, "{status} {reason}")
            }
            Error::Http { body, .. } => write!(f, "{body}"),
            Error::Serde(e) => write!(f, "error while deserializing the response: {e}"),
            Error::Rpc { code, message } => write!(f, "rpc error {code}: {message}"),
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::InvalidConfig(what) => write!(f, "invalid config: {what}"),
        }
    }
}

impl std::error::Error for Error {}
