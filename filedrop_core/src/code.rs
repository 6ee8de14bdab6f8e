//! Session codes used to pair two devices.
//!
//! A session code is a short routing hint typed or scanned on the joining
//! device. It is not a secret: the rendezvous store scopes messages by it
//! and it expires after [`crate::expiry::SESSION_TTL`].

use crate::error::CodeError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32 symbols, without the easily confused I, O, 0 and 1.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

pub const MIN_CODE_LENGTH: usize = 4;
pub const MAX_CODE_LENGTH: usize = 8;
pub const DEFAULT_CODE_LENGTH: usize = 6;

/// Prefix that marks a scanned payload as ours.
pub const JOIN_PAYLOAD_PREFIX: &str = "FILEDROP:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionCode(String);

impl SessionCode {
    /// Draw a fresh code of `length` symbols. Lengths outside 4..=8 are
    /// clamped so the result always validates.
    pub fn generate(length: usize) -> Self {
        let length = length.clamp(MIN_CODE_LENGTH, MAX_CODE_LENGTH);
        let mut rng = rand::rng();
        let code = (0..length)
            .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    pub fn generate_default() -> Self {
        Self::generate(DEFAULT_CODE_LENGTH)
    }

    /// Normalize free-form user input and validate it.
    pub fn parse(input: &str) -> Result<Self, CodeError> {
        let normalized = normalize(input);
        if normalized.is_empty() {
            return Err(CodeError::Empty);
        }
        if !validate(&normalized) {
            return Err(CodeError::Invalid(normalized));
        }
        Ok(Self(normalized))
    }

    /// Accept either a scanned join payload or a typed code.
    ///
    /// A payload carrying the prefix must hold a valid code as-is; only
    /// unprefixed input goes through [`normalize`].
    pub fn from_user_input(input: &str) -> Result<Self, CodeError> {
        let trimmed = input.trim();
        if trimmed.starts_with(JOIN_PAYLOAD_PREFIX) {
            return decode_join_payload(trimmed)
                .ok_or_else(|| CodeError::Invalid(trimmed.to_string()));
        }
        Self::parse(trimmed)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = CodeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if validate(&value) {
            Ok(Self(value))
        } else {
            Err(CodeError::Invalid(value))
        }
    }
}

impl From<SessionCode> for String {
    fn from(code: SessionCode) -> Self {
        code.0
    }
}

impl AsRef<str> for SessionCode {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Accepts iff the length is in 4..=8 and every char is `[A-Z0-9]`.
///
/// Validation is deliberately wider than the generation alphabet so that
/// codes produced by other clients with a different alphabet still route.
pub fn validate(code: &str) -> bool {
    (MIN_CODE_LENGTH..=MAX_CODE_LENGTH).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Uppercase and drop everything outside `[A-Z0-9]`, so users can type
/// separators or lowercase freely.
pub fn normalize(input: &str) -> String {
    input
        .chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect()
}

pub fn encode_join_payload(code: &SessionCode) -> String {
    format!("{}{}", JOIN_PAYLOAD_PREFIX, code)
}

/// Unwrap a scanned payload. A bare valid code without the prefix is
/// accepted too.
pub fn decode_join_payload(payload: &str) -> Option<SessionCode> {
    let body = payload.strip_prefix(JOIN_PAYLOAD_PREFIX).unwrap_or(payload);
    if validate(body) {
        Some(SessionCode(body.to_string()))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_user_input() {
        let code = SessionCode::parse("K7QM2X").unwrap();
        assert_eq!(
            SessionCode::from_user_input(&encode_join_payload(&code)).unwrap(),
            code
        );
        assert_eq!(SessionCode::from_user_input(" k7q-m2x ").unwrap(), code);
        // The prefix word must not be mistaken for a typed code
        assert!(SessionCode::from_user_input("FILEDROP:!!").is_err());
        assert!(SessionCode::from_user_input("FILEDROP:ab").is_err());
        assert!(matches!(
            SessionCode::from_user_input("  "),
            Err(CodeError::Empty)
        ));
    }

    #[test]
    fn test_generate_validates_for_all_lengths() {
        for length in MIN_CODE_LENGTH..=MAX_CODE_LENGTH {
            for _ in 0..200 {
                let code = SessionCode::generate(length);
                assert_eq!(code.as_str().len(), length);
                assert!(validate(code.as_str()), "generated {} failed", code);
            }
        }
    }

    #[test]
    fn test_generate_avoids_ambiguous_chars() {
        for _ in 0..500 {
            let code = SessionCode::generate(MAX_CODE_LENGTH);
            assert!(
                !code.as_str().chars().any(|c| matches!(c, 'I' | 'O' | '0' | '1')),
                "ambiguous char in {}",
                code
            );
        }
    }

    #[test]
    fn test_generate_clamps_length() {
        assert_eq!(SessionCode::generate(1).as_str().len(), MIN_CODE_LENGTH);
        assert_eq!(SessionCode::generate(42).as_str().len(), MAX_CODE_LENGTH);
        assert_eq!(SessionCode::generate_default().as_str().len(), 6);
    }

    #[test]
    fn test_validate() {
        assert!(validate("ABCD"));
        assert!(validate("AB12CD90"));
        assert!(!validate("ABC"));
        assert!(!validate("ABCDEFGHJ"));
        assert!(!validate("abcd"));
        assert!(!validate("AB-CD"));
        assert!(!validate(""));
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("ab-cd ef"), "ABCDEF");
        assert_eq!(normalize("  x7k/9q "), "X7K9Q");
        assert_eq!(normalize("ü-ß"), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        for input in ["ab-cd", "Hello World!", "", "ÄBC-123", "xyz_987__"] {
            let once = normalize(input);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_parse_manual_entry() {
        assert_eq!(SessionCode::parse("abc-def").unwrap().as_str(), "ABCDEF");
        assert!(matches!(SessionCode::parse("--"), Err(CodeError::Empty)));
        assert!(matches!(SessionCode::parse("ab"), Err(CodeError::Invalid(_))));
    }

    #[test]
    fn test_join_payload_round_trip() {
        for length in MIN_CODE_LENGTH..=MAX_CODE_LENGTH {
            let code = SessionCode::generate(length);
            let payload = encode_join_payload(&code);
            assert!(payload.starts_with("FILEDROP:"));
            assert_eq!(decode_join_payload(&payload), Some(code));
        }
    }

    #[test]
    fn test_decode_join_payload_fallbacks() {
        assert_eq!(
            decode_join_payload("K7MQ2X").map(String::from),
            Some("K7MQ2X".to_string())
        );
        assert_eq!(decode_join_payload("https://example.com"), None);
        assert_eq!(decode_join_payload("FILEDROP:"), None);
        assert_eq!(decode_join_payload("FILEDROP:abc"), None);
    }

    #[test]
    fn test_serde_rejects_invalid_code() {
        let ok: SessionCode = serde_json::from_str("\"ABCD23\"").unwrap();
        assert_eq!(ok.as_str(), "ABCD23");
        assert!(serde_json::from_str::<SessionCode>("\"ab\"").is_err());
    }
}
