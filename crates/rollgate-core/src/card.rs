//! Card ID validation.
//!
//! Reader drivers hand us whatever the card (or a keyboard-wedge emulator)
//! typed. IDs are trimmed and checked before they reach the directory.

use thiserror::Error;

const MAX_CARD_ID_LEN: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CardIdError {
    #[error("empty card id")]
    Empty,
    #[error("card id longer than {MAX_CARD_ID_LEN} characters")]
    TooLong,
    #[error("card id contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Trim and validate a raw card ID, returning the canonical form.
///
/// Accepted alphabet: ASCII letters, digits, `:`, `_` and `-`.
pub fn normalize_card_id(raw: &str) -> Result<String, CardIdError> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(CardIdError::Empty);
    }
    if id.len() > MAX_CARD_ID_LEN {
        return Err(CardIdError::TooLong);
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-')))
    {
        return Err(CardIdError::InvalidChar(bad));
    }
    Ok(id.to_string())
}
