//! Conversions between Rust strings and C string buffers.

/// NUL-terminated narrow string.
pub fn narrow_bytes(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    bytes
}

/// Text up to the first NUL; invalid UTF-8 is replaced.
pub fn narrow_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// NUL-terminated UTF-16LE string, as used by `wchar_t` on Windows.
pub fn wide_bytes(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(u16::to_le_bytes)
        .collect()
}

pub fn wide_string(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|unit| *unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow() {
        assert_eq!(narrow_bytes("ab"), b"ab\0".to_vec());
        assert_eq!(narrow_string(b"ab\0cd"), "ab");
        assert_eq!(narrow_string(b"ab"), "ab");
    }

    #[test]
    fn test_wide() {
        let bytes = wide_bytes("hé");
        assert_eq!(bytes, vec![b'h', 0, 0xe9, 0, 0, 0]);
        assert_eq!(wide_string(&bytes), "hé");
        assert_eq!(wide_string(&[]), "");
    }
}
