//! Source intake: encoding normalization and the trojan-source guard

use thiserror::Error;
use verdict_core::SourceLocation;

/// Bidirectional control characters that can make rendered source differ
/// from the token stream. Sources containing any of these are rejected
/// before lexing.
pub const TROJAN_SOURCE_CHARS: [char; 4] = ['\u{2066}', '\u{2067}', '\u{2069}', '\u{202E}'];

/// Errors raised while normalizing raw policy bytes into UTF-8 text.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("source contains bidirectional control character {codepoint}")]
    TrojanSource {
        codepoint: String,
        location: SourceLocation,
    },

    #[error("invalid source encoding: {reason}")]
    Encoding { reason: String },
}

/// Reject sources containing trojan-source characters.
pub fn guard_trojan_source(source: &str) -> Result<(), SourceError> {
    for (offset, c) in source.char_indices() {
        if TROJAN_SOURCE_CHARS.contains(&c) {
            return Err(SourceError::TrojanSource {
                codepoint: format!("U+{:04X}", c as u32),
                location: SourceLocation::from_offsets(None, source, offset, offset + c.len_utf8()),
            });
        }
    }
    Ok(())
}

/// Decode raw policy bytes into UTF-8 text, honoring a leading BOM.
///
/// - `EF BB BF`: UTF-8, BOM stripped
/// - `FF FE`: UTF-16 little-endian
/// - `FE FF`: UTF-16 big-endian
/// - otherwise: plain UTF-8
pub fn decode_source(bytes: &[u8]) -> Result<String, SourceError> {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return utf8(rest);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return utf16(rest, u16::from_le_bytes);
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        return utf16(rest, u16::from_be_bytes);
    }
    utf8(bytes)
}

fn utf8(bytes: &[u8]) -> Result<String, SourceError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| SourceError::Encoding {
        reason: e.to_string(),
    })
}

fn utf16(bytes: &[u8], decode_pair: fn([u8; 2]) -> u16) -> Result<String, SourceError> {
    if bytes.len() % 2 != 0 {
        return Err(SourceError::Encoding {
            reason: "odd UTF-16 byte length".to_string(),
        });
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| decode_pair([pair[0], pair[1]]))
        .collect();
    char::decode_utf16(units)
        .collect::<Result<String, _>>()
        .map_err(|e| SourceError::Encoding {
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_source_passes_guard() {
        assert!(guard_trojan_source("policy \"p\" permit").is_ok());
    }

    #[test]
    fn test_rtl_override_is_rejected() {
        let source = "policy \"p\u{202E}\" permit";
        let err = guard_trojan_source(source).unwrap_err();
        match err {
            SourceError::TrojanSource { codepoint, .. } => assert_eq!(codepoint, "U+202E"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_utf8_bom_is_stripped() {
        let bytes = [0xEF, 0xBB, 0xBF, b'o', b'k'];
        assert_eq!(decode_source(&bytes).unwrap(), "ok");
    }

    #[test]
    fn test_utf16_le_decodes() {
        let bytes = [0xFF, 0xFE, b'o', 0x00, b'k', 0x00];
        assert_eq!(decode_source(&bytes).unwrap(), "ok");
    }

    #[test]
    fn test_utf16_be_decodes() {
        let bytes = [0xFE, 0xFF, 0x00, b'o', 0x00, b'k'];
        assert_eq!(decode_source(&bytes).unwrap(), "ok");
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        assert!(matches!(
            decode_source(&[0xC3, 0x28]),
            Err(SourceError::Encoding { .. })
        ));
    }
}
