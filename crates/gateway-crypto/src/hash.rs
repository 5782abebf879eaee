use sha2::{Digest, Sha256};

/// SHA-256 of `data`, returned as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// SHA-256 of `data`, returned as the raw 32-byte digest.
pub fn sha256_bytes(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// CRC32 of `data`, returned as 8 lowercase hex digits — the checksum
/// algorithm the WAL envelope uses.
pub fn crc32_hex(data: &[u8]) -> String {
    format!("{:08x}", crc32fast::hash(data))
}

/// The EIP-3009-style unlock authorization fingerprint:
/// `sha256(lowercase(from):lowercase(to):nonce:value:valid_before)`, used as
/// the `NonceRegistry` key. The core treats the on-chain authorization as
/// opaque beyond this fingerprint.
pub fn unlock_authorization_fingerprint(
    from: &str,
    to: &str,
    nonce: &str,
    value: &str,
    valid_before: &str,
) -> String {
    let canonical = format!(
        "{}:{}:{}:{}:{}",
        from.trim().to_ascii_lowercase(),
        to.trim().to_ascii_lowercase(),
        nonce.trim().to_ascii_lowercase(),
        value,
        valid_before,
    );
    sha256_hex(canonical.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_known_vector() {
        // sha256("") = e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn crc32_hex_is_eight_lowercase_digits() {
        let h = crc32_hex(b"{\"a\":1}");
        assert_eq!(h.len(), 8);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprint_is_case_insensitive_on_addresses() {
        let a = unlock_authorization_fingerprint("0xABC", "0xDEF", "n1", "100", "9999");
        let b = unlock_authorization_fingerprint("0xabc", "0xdef", "n1", "100", "9999");
        assert_eq!(a, b);
    }
}
