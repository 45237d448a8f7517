//! CRC32C (Castagnoli) digests over byte content and logical line ranges.

/// CRC32C of raw bytes.
pub fn crc32c_bytes(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

/// Uppercase fixed-width hex rendering used in response headers.
pub fn crc32c_hex(crc: u32) -> String {
    format!("{crc:08X}")
}

/// CRC32C of a logical line range: the lines joined by a single `\n`, with
/// no line-number decorations and no trailing newline. Edit and read must
/// produce byte-identical input to this function for tokens to line up.
pub fn range_crc(lines: &[String]) -> u32 {
    let mut crc = 0u32;
    for (i, line) in lines.iter().enumerate() {
        if i > 0 {
            crc = crc32c::crc32c_append(crc, b"\n");
        }
        crc = crc32c::crc32c_append(crc, line.as_bytes());
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn range_crc_equals_crc_of_joined_text() {
        let lines = vec!["alpha".to_string(), "beta".to_string(), "gamma".to_string()];
        assert_eq!(range_crc(&lines), crc32c_bytes(b"alpha\nbeta\ngamma"));
    }

    #[test]
    fn empty_range_is_the_empty_crc() {
        assert_eq!(range_crc(&[]), crc32c_bytes(b""));
    }

    #[test]
    fn single_line_has_no_separator() {
        let lines = vec!["only".to_string()];
        assert_eq!(range_crc(&lines), crc32c_bytes(b"only"));
    }

    #[test]
    fn hex_is_zero_padded_uppercase() {
        assert_eq!(crc32c_hex(0xAB), "000000AB");
    }
}
