//! Shared error taxonomy.
//!
//! Every fallible boundary in this crate - decompression, AEAD authentication,
//! vint/ASCII parsing, oid mismatches, ref CAS races, protocol framing - maps to one
//! of these nine kinds. The wire protocol (`server`/`client`) collapses all of them
//! to a single `error <message>\n` line on the way out and re-classifies by message
//! prefix on the way back in (see `Error::classify_remote`).

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("CAS failure on {name}: expected {expected:?}, found {found:?}")]
    CasFailure {
        name: String,
        expected: Option<String>,
        found: Option<String>,
    },

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Render for the wire protocol's `error <message>\n` line.
    ///
    /// `KeyError:` is a stable prefix recognized by `classify_remote` on the other
    /// side, matching `orig:lib/bup/protocol.py`'s `KeyError:` convention for
    /// missing objects.
    pub fn to_wire_message(&self) -> String {
        match self {
            Error::NotFound(what) => format!("KeyError: {what}"),
            other => other.to_string(),
        }
    }

    /// Reclassify an `error <message>` line received from a remote peer back into a
    /// typed `Error`. Anything not recognized becomes `Error::Protocol` - the wire
    /// layer only carries text, so precise kinds besides `NotFound` are best-effort.
    pub fn classify_remote(message: &str) -> Error {
        if let Some(rest) = message.strip_prefix("KeyError:") {
            Error::NotFound(rest.trim().to_string())
        } else {
            Error::Protocol(message.to_string())
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(e: std::str::Utf8Error) -> Error {
        Error::Corruption(format!("invalid utf-8: {e}"))
    }
}

impl From<std::num::ParseIntError> for Error {
    fn from(e: std::num::ParseIntError) -> Error {
        Error::Corruption(format!("invalid integer: {e}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Corruption(format!("invalid json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_not_found() {
        let err = Error::NotFound("deadbeef".into());
        let wire = err.to_wire_message();
        assert_eq!(wire, "KeyError: deadbeef");
        match Error::classify_remote(&wire) {
            Error::NotFound(what) => assert_eq!(what, "deadbeef"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unrecognized_message_is_protocol_error() {
        match Error::classify_remote("something else went wrong") {
            Error::Protocol(_) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
