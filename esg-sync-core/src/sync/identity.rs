//! Client identity validation.
//!
//! Identities are opaque strings chosen by the caller. The broker only
//! requires that they be printable and reasonably short.

use thiserror::Error;

/// Longest identity accepted, in bytes.
pub const MAX_IDENTITY_LEN: usize = 256;

/// Reasons an identity is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidIdentity {
    #[error("identity is empty")]
    Empty,

    #[error("identity is {0} bytes long, the limit is {MAX_IDENTITY_LEN}")]
    TooLong(usize),

    #[error("identity contains control characters")]
    ControlCharacter,
}

/// Validates an identity, returning it with surrounding whitespace removed.
pub fn validate_identity(raw: &str) -> Result<String, InvalidIdentity> {
    let identity = raw.trim();

    if identity.is_empty() {
        return Err(InvalidIdentity::Empty);
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(InvalidIdentity::TooLong(identity.len()));
    }
    if identity.chars().any(char::is_control) {
        return Err(InvalidIdentity::ControlCharacter);
    }

    Ok(identity.to_string())
}
