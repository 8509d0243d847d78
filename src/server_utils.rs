use rand::distr::Alphanumeric;
use rand::Rng;

use crate::constants::{
    DEFAULT_ROOM_CAPACITY, MAX_NAME_CHARS, MAX_ROOM_CAPACITY, MAX_ROOM_NAME_CHARS,
    MIN_ROOM_CAPACITY, ROOM_CODE_ALPHABET, ROOM_CODE_LEN,
};

pub fn sanitize_name(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return "Player".to_string();
    }
    trimmed.chars().take(MAX_NAME_CHARS).collect()
}

pub fn sanitize_room_name(value: Option<&str>, host_name: &str) -> String {
    let trimmed = value.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return format!("{host_name}'s room");
    }
    trimmed.chars().take(MAX_ROOM_NAME_CHARS).collect()
}

/// Codes are shown upper-case but typed by hand, so lookups ignore case and
/// surrounding whitespace.
pub fn normalize_room_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}

pub fn normalize_capacity(value: Option<i64>) -> usize {
    value
        .map(|capacity| capacity.clamp(MIN_ROOM_CAPACITY as i64, MAX_ROOM_CAPACITY as i64) as usize)
        .unwrap_or(DEFAULT_ROOM_CAPACITY)
}

/// Empty secrets count as no secret at all.
pub fn normalize_secret(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|secret| !secret.is_empty())
        .map(str::to_string)
}

pub fn random_room_code() -> String {
    let mut rng = rand::rng();
    (0..ROOM_CODE_LEN)
        .map(|_| ROOM_CODE_ALPHABET[rng.random_range(0..ROOM_CODE_ALPHABET.len())] as char)
        .collect()
}

pub fn random_suffix(len: usize) -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_name_applies_trim_empty_and_max_len() {
        assert_eq!(sanitize_name(""), "Player");
        assert_eq!(sanitize_name("   "), "Player");
        assert_eq!(sanitize_name(" Alice "), "Alice");
        assert_eq!(sanitize_name("12345678901234567890"), "1234567890123456");
    }

    #[test]
    fn room_name_falls_back_to_host() {
        assert_eq!(sanitize_room_name(None, "Alice"), "Alice's room");
        assert_eq!(sanitize_room_name(Some("  "), "Bob"), "Bob's room");
        assert_eq!(sanitize_room_name(Some(" Friday "), "Bob"), "Friday");
        assert_eq!(sanitize_room_name(Some(&"x".repeat(60)), "Bob").len(), 40);
    }

    #[test]
    fn room_codes_are_case_insensitive() {
        assert_eq!(normalize_room_code(" ab12cd "), "AB12CD");
        assert_eq!(normalize_room_code("AB12CD"), "AB12CD");
    }

    #[test]
    fn normalize_capacity_clamps_range() {
        assert_eq!(normalize_capacity(None), 4);
        assert_eq!(normalize_capacity(Some(-3)), 2);
        assert_eq!(normalize_capacity(Some(3)), 3);
        assert_eq!(normalize_capacity(Some(99)), 4);
    }

    #[test]
    fn blank_secret_is_dropped() {
        assert_eq!(normalize_secret(None), None);
        assert_eq!(normalize_secret(Some("  ")), None);
        assert_eq!(normalize_secret(Some(" s3cret ")), Some("s3cret".to_string()));
    }

    #[test]
    fn random_room_code_uses_alphabet() {
        for _ in 0..50 {
            let code = random_room_code();
            assert_eq!(code.len(), ROOM_CODE_LEN);
            assert!(code.bytes().all(|byte| ROOM_CODE_ALPHABET.contains(&byte)));
        }
    }
}
