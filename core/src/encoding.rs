//! Charset detection and strict re-encoding.
//!
//! Reads never fail on malformed bytes: detection falls back to an 8-bit
//! charset and malformed sequences decode to replacement characters, which
//! is reported as a warning. Writes are the opposite: a codepoint the
//! target charset cannot represent fails the operation, naming the first
//! offending character, because silently replacing it would corrupt the
//! file behind the caller's back.

use std::path::Path;

use encoding_rs::Encoding;

use crate::digest;
use crate::error::BrokerErr;
use crate::error::EncodingError;
use crate::fsio;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const UTF16_LE_BOM: &[u8] = &[0xFF, 0xFE];
const UTF16_BE_BOM: &[u8] = &[0xFE, 0xFF];

/// A detected or forced charset. BOM presence is part of the identity so a
/// re-encode reproduces the original byte layout exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8 { bom: bool },
    Utf16Le,
    Utf16Be,
    Legacy(&'static Encoding),
}

impl Charset {
    pub fn label(&self) -> &'static str {
        match self {
            Charset::Utf8 { bom: false } => "UTF-8",
            Charset::Utf8 { bom: true } => "UTF-8 BOM",
            Charset::Utf16Le => "UTF-16LE",
            Charset::Utf16Be => "UTF-16BE",
            Charset::Legacy(enc) => enc.name(),
        }
    }

    /// Resolve a caller-supplied label (`forced_encoding` / `encoding`
    /// parameters). Labels go through the WHATWG registry, so the usual
    /// aliases (`latin1`, `cp1251`, ...) work.
    pub fn for_label(label: &str) -> Result<Charset, EncodingError> {
        match label.to_ascii_uppercase().as_str() {
            "UTF-8 BOM" | "UTF-8-BOM" | "UTF8-BOM" => return Ok(Charset::Utf8 { bom: true }),
            _ => {}
        }
        let enc = Encoding::for_label(label.as_bytes())
            .ok_or_else(|| EncodingError::UnknownCharset(label.to_string()))?;
        Ok(if enc == encoding_rs::UTF_8 {
            Charset::Utf8 { bom: false }
        } else if enc == encoding_rs::UTF_16LE {
            Charset::Utf16Le
        } else if enc == encoding_rs::UTF_16BE {
            Charset::Utf16Be
        } else {
            Charset::Legacy(enc)
        })
    }
}

#[derive(Debug, Clone)]
pub struct DecodedText {
    pub content: String,
    pub charset: Charset,
    /// Malformed input was decoded to replacement characters.
    pub had_replacements: bool,
}

/// Decode `bytes`, honouring `forced` when supplied and otherwise running
/// detection: BOM first, then UTF-8 validation, then the 8-bit fallback.
/// A leading BOM is stripped from the returned content.
pub fn decode(bytes: &[u8], forced: Option<Charset>, fallback: &'static Encoding) -> DecodedText {
    if let Some(charset) = forced {
        return decode_as(bytes, charset);
    }
    if bytes.starts_with(UTF8_BOM) {
        return decode_as(bytes, Charset::Utf8 { bom: true });
    }
    if bytes.starts_with(UTF16_LE_BOM) {
        return decode_as(bytes, Charset::Utf16Le);
    }
    if bytes.starts_with(UTF16_BE_BOM) {
        return decode_as(bytes, Charset::Utf16Be);
    }
    if let Ok(content) = std::str::from_utf8(bytes) {
        return DecodedText {
            content: content.to_string(),
            charset: Charset::Utf8 { bom: false },
            had_replacements: false,
        };
    }
    decode_as(bytes, Charset::Legacy(fallback))
}

fn decode_as(bytes: &[u8], charset: Charset) -> DecodedText {
    let (body, encoding): (&[u8], &'static Encoding) = match charset {
        Charset::Utf8 { .. } => (
            bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes),
            encoding_rs::UTF_8,
        ),
        Charset::Utf16Le => (
            bytes.strip_prefix(UTF16_LE_BOM).unwrap_or(bytes),
            encoding_rs::UTF_16LE,
        ),
        Charset::Utf16Be => (
            bytes.strip_prefix(UTF16_BE_BOM).unwrap_or(bytes),
            encoding_rs::UTF_16BE,
        ),
        Charset::Legacy(enc) => (bytes, enc),
    };
    let (content, had_replacements) = encoding.decode_without_bom_handling(body);
    DecodedText {
        content: content.into_owned(),
        charset,
        had_replacements,
    }
}

/// Encode `content` in `charset`, failing on the first unmappable
/// character rather than substituting.
pub fn encode(content: &str, charset: Charset) -> Result<Vec<u8>, EncodingError> {
    match charset {
        Charset::Utf8 { bom } => {
            let mut out = Vec::with_capacity(content.len() + 3);
            if bom {
                out.extend_from_slice(UTF8_BOM);
            }
            out.extend_from_slice(content.as_bytes());
            Ok(out)
        }
        Charset::Utf16Le => {
            let mut out = Vec::with_capacity(content.len() * 2 + 2);
            out.extend_from_slice(UTF16_LE_BOM);
            for unit in content.encode_utf16() {
                out.extend_from_slice(&unit.to_le_bytes());
            }
            Ok(out)
        }
        Charset::Utf16Be => {
            let mut out = Vec::with_capacity(content.len() * 2 + 2);
            out.extend_from_slice(UTF16_BE_BOM);
            for unit in content.encode_utf16() {
                out.extend_from_slice(&unit.to_be_bytes());
            }
            Ok(out)
        }
        Charset::Legacy(enc) => {
            let (bytes, _, had_errors) = enc.encode(content);
            if had_errors {
                let (ch, pos) = first_unmappable(content, enc);
                return Err(EncodingError::Unmappable {
                    ch,
                    pos,
                    charset: enc.name().to_string(),
                });
            }
            Ok(bytes.into_owned())
        }
    }
}

fn first_unmappable(content: &str, enc: &'static Encoding) -> (char, usize) {
    let mut buf = [0u8; 4];
    for (pos, ch) in content.chars().enumerate() {
        let (_, _, had_errors) = enc.encode(ch.encode_utf8(&mut buf));
        if had_errors {
            return (ch, pos);
        }
    }
    // Unreachable when callers only probe after a failed encode.
    ('\u{FFFD}', 0)
}

/// Encode and write atomically, returning the CRC32C of the written bytes.
pub fn write_text(path: &Path, content: &str, charset: Charset) -> Result<(u32, Vec<u8>), BrokerErr> {
    let bytes = encode(content, charset)?;
    fsio::write_bytes_atomic(path, &bytes)?;
    Ok((digest::crc32c_bytes(&bytes), bytes))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_utf8_is_detected() {
        let decoded = decode("hello".as_bytes(), None, encoding_rs::WINDOWS_1251);
        assert_eq!(decoded.charset, Charset::Utf8 { bom: false });
        assert_eq!(decoded.content, "hello");
        assert!(!decoded.had_replacements);
    }

    #[test]
    fn utf8_bom_is_detected_and_stripped() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice("hi".as_bytes());
        let decoded = decode(&bytes, None, encoding_rs::WINDOWS_1251);
        assert_eq!(decoded.charset, Charset::Utf8 { bom: true });
        assert_eq!(decoded.content, "hi");
    }

    #[test]
    fn utf16le_round_trips_through_bom() {
        let original = "Привет";
        let encoded = encode(original, Charset::Utf16Le).unwrap();
        assert!(encoded.starts_with(UTF16_LE_BOM));
        let decoded = decode(&encoded, None, encoding_rs::WINDOWS_1251);
        assert_eq!(decoded.charset, Charset::Utf16Le);
        assert_eq!(decoded.content, original);
    }

    #[test]
    fn invalid_utf8_falls_back_to_the_8bit_charset() {
        // 0xCF 0xF0 is "Пр" in windows-1251 and invalid UTF-8.
        let decoded = decode(&[0xCF, 0xF0], None, encoding_rs::WINDOWS_1251);
        assert_eq!(decoded.charset, Charset::Legacy(encoding_rs::WINDOWS_1251));
        assert_eq!(decoded.content, "Пр");
    }

    #[test]
    fn legacy_round_trip_preserves_bytes() {
        let bytes: Vec<u8> = (0x20u8..=0xFF).collect();
        let decoded = decode(&bytes, Some(Charset::Legacy(encoding_rs::WINDOWS_1251)), encoding_rs::WINDOWS_1251);
        let encoded = encode(&decoded.content, Charset::Legacy(encoding_rs::WINDOWS_1251)).unwrap();
        assert_eq!(encoded, bytes);
    }

    #[test]
    fn unmappable_character_fails_with_position() {
        let err = encode("ok → bad", Charset::Legacy(encoding_rs::WINDOWS_1251)).unwrap_err();
        match err {
            EncodingError::Unmappable { ch, pos, charset } => {
                assert_eq!(ch, '→');
                assert_eq!(pos, 3);
                assert_eq!(charset, "windows-1251");
            }
            other => panic!("expected Unmappable, got {other:?}"),
        }
    }

    #[test]
    fn forced_decoding_replaces_instead_of_failing() {
        let decoded = decode(&[0xFF, 0xFE, 0x41], Some(Charset::Utf8 { bom: false }), encoding_rs::WINDOWS_1251);
        assert!(decoded.had_replacements);
        assert!(decoded.content.contains('\u{FFFD}'));
    }

    #[test]
    fn labels_resolve_through_the_registry() {
        assert_eq!(Charset::for_label("utf-8").unwrap(), Charset::Utf8 { bom: false });
        assert_eq!(Charset::for_label("UTF-16LE").unwrap(), Charset::Utf16Le);
        assert_eq!(
            Charset::for_label("cp1251").unwrap(),
            Charset::Legacy(encoding_rs::WINDOWS_1251)
        );
        assert!(Charset::for_label("klingon").is_err());
    }
}
