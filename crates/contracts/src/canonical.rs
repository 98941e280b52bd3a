use hex::ToHex;
use sha2::Digest;
use unicode_normalization::UnicodeNormalization;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}

/// Line endings folded to `\n` and Unicode in NFC. Only fingerprints see this
/// form; the statement sent to the database keeps its original text.
pub fn canonicalize_text_plain(input: &str) -> String {
    let normalized = input.replace("\r\n", "\n").replace('\r', "\n");
    normalized.nfc().collect::<String>()
}

/// Stable audit identifier for a rendered statement. Whitespace runs are
/// collapsed so formatting differences do not change the fingerprint.
pub fn sql_fingerprint(sql: &str) -> String {
    let canonical = canonicalize_text_plain(sql);
    let collapsed = canonical.split_whitespace().collect::<Vec<_>>().join(" ");
    sha256_hex(collapsed.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_lower_hex_digest(s: &str) -> bool {
        s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    }

    #[test]
    fn text_plain_normalizes_line_endings_and_unicode_nfc() {
        let input = "line1\r\nline2\rline3\ne\u{0301}";
        let canonical = canonicalize_text_plain(input);
        assert_eq!(canonical, "line1\nline2\nline3\n\u{00e9}");
    }

    #[test]
    fn sha256_hex_is_lowercase_and_valid() {
        let h = sha256_hex(b"abc");
        assert!(is_lower_hex_digest(&h));
        assert_eq!(
            h,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn fingerprint_ignores_whitespace_layout() {
        let a = sql_fingerprint("SELECT id\r\n  FROM users   LIMIT 10");
        let b = sql_fingerprint("SELECT id FROM users LIMIT 10");
        assert_eq!(a, b);
        assert!(is_lower_hex_digest(&a));
        assert_ne!(a, sql_fingerprint("SELECT id FROM users LIMIT 11"));
    }
}
