//! Identifier generation and validation.
//!
//! Session codes are short enough to read over a shoulder, so the alphabet
//! drops the confusable symbols 0/O/1/I. All generation goes through
//! `OsRng`; 256 % 32 == 0, so a plain byte-to-symbol mapping is uniform.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::constants::{MAX_FILENAME_BYTES, SESSION_CODE_ALPHABET, SESSION_CODE_LEN};

/// Generate a fresh 5-character session code.
pub fn new_session_code() -> String {
    let mut raw = [0u8; SESSION_CODE_LEN];
    OsRng.fill_bytes(&mut raw);
    raw.iter()
        .map(|b| SESSION_CODE_ALPHABET[*b as usize % SESSION_CODE_ALPHABET.len()] as char)
        .collect()
}

/// Generate a 32-hex-char file identifier (16 random bytes).
pub fn new_file_id() -> String {
    let mut raw = [0u8; 16];
    OsRng.fill_bytes(&mut raw);
    hex::encode(raw)
}

/// Generate a 32-hex-char upload identifier.
pub fn new_upload_id() -> String {
    new_file_id()
}

/// Generate a message identifier of the form `msg_<millis>_<8hex>`.
pub fn new_message_id(now_millis: i64) -> String {
    let mut raw = [0u8; 4];
    OsRng.fill_bytes(&mut raw);
    format!("msg_{}_{}", now_millis, hex::encode(raw))
}

/// Uppercase a session code into its canonical form.
pub fn canonical_session_code(code: &str) -> String {
    code.to_ascii_uppercase()
}

/// Check the shape of a session code, case-insensitively.
pub fn is_valid_session_code(code: &str) -> bool {
    code.len() == SESSION_CODE_LEN
        && code
            .bytes()
            .all(|b| SESSION_CODE_ALPHABET.contains(&b.to_ascii_uppercase()))
}

/// Check the shape of a file identifier (32 hex chars, case-insensitive).
pub fn is_valid_file_id(id: &str) -> bool {
    id.len() == 32 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Strip path separators, NUL bytes and `..` sequences from a filename and
/// truncate it to 255 bytes. An empty result becomes `"unnamed"`.
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| *c != '/' && *c != '\\' && *c != '\0')
        .collect();

    while out.contains("..") {
        out = out.replace("..", "");
    }

    if out.len() > MAX_FILENAME_BYTES {
        let mut end = MAX_FILENAME_BYTES;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
    }

    if out.is_empty() {
        "unnamed".to_string()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_code_shape() {
        for _ in 0..100 {
            let code = new_session_code();
            assert_eq!(code.len(), SESSION_CODE_LEN);
            assert!(is_valid_session_code(&code));
            assert!(!code.contains(['0', 'O', '1', 'I']));
        }
    }

    #[test]
    fn test_session_code_case_insensitive() {
        assert!(is_valid_session_code("ab2cd"));
        assert!(is_valid_session_code("AB2CD"));
        assert_eq!(canonical_session_code("ab2cd"), "AB2CD");
    }

    #[test]
    fn test_session_code_rejects_confusables() {
        assert!(!is_valid_session_code("AB0CD"));
        assert!(!is_valid_session_code("AB1CD"));
        assert!(!is_valid_session_code("ABICD"));
        assert!(!is_valid_session_code("ABCD"));
        assert!(!is_valid_session_code("ABCDEF"));
    }

    #[test]
    fn test_file_id_shape() {
        let id = new_file_id();
        assert_eq!(id.len(), 32);
        assert!(is_valid_file_id(&id));
        assert!(is_valid_file_id(&id.to_ascii_uppercase()));
        assert!(!is_valid_file_id("zz"));
    }

    #[test]
    fn test_message_id_shape() {
        let id = new_message_id(1_700_000_000_000);
        assert!(id.starts_with("msg_1700000000000_"));
        assert_eq!(id.len(), "msg_1700000000000_".len() + 8);
    }

    #[test]
    fn test_sanitize_strips_traversal() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_filename("a\\b/c\0d"), "abcd");
        assert_eq!(sanitize_filename("...."), "unnamed");
    }

    #[test]
    fn test_sanitize_empty_fallback() {
        assert_eq!(sanitize_filename(""), "unnamed");
        assert_eq!(sanitize_filename("//\\\\"), "unnamed");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        let long = "é".repeat(200); // 400 bytes
        let out = sanitize_filename(&long);
        assert!(out.len() <= MAX_FILENAME_BYTES);
        assert_eq!(out.chars().count(), 127);
    }

    #[test]
    fn test_sanitize_keeps_normal_names() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("photo (1).jpg"), "photo (1).jpg");
    }
}
