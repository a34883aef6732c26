//! Clipboard text transcoding between the upstream wire encoding and UTF-8.
//!
//! The RFB standard mandates ISO 8859-1 for cut text, but real servers are
//! routinely configured for other encodings. The bridge therefore transcodes:
//! inbound cut text is decoded from the configured encoding into UTF-8 before
//! it reaches viewers, and outbound viewer clipboard (always UTF-8) is encoded
//! into the configured encoding before it is sent upstream.

use log::{debug, warn};

/// Maximum number of inbound clipboard bytes accepted per cut-text message.
/// Anything beyond the cap is dropped.
pub const CLIPBOARD_MAX_LEN: usize = 262_144;

/// Windows-1252 mappings for the 0x80..=0x9F range. Undefined positions keep
/// the corresponding C1 control character, matching common converter
/// behaviour.
const CP1252_HIGH: [char; 32] = [
    '\u{20AC}', '\u{0081}', '\u{201A}', '\u{0192}', '\u{201E}', '\u{2026}', '\u{2020}', '\u{2021}',
    '\u{02C6}', '\u{2030}', '\u{0160}', '\u{2039}', '\u{0152}', '\u{008D}', '\u{017D}', '\u{008F}',
    '\u{0090}', '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2022}', '\u{2013}', '\u{2014}',
    '\u{02DC}', '\u{2122}', '\u{0161}', '\u{203A}', '\u{0153}', '\u{009D}', '\u{017E}', '\u{0178}',
];

/// Clipboard encodings the bridge can transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClipboardEncoding {
    /// ISO 8859-1, the encoding the RFB standard requires for cut text.
    #[default]
    Iso8859_1,
    /// UTF-8.
    Utf8,
    /// UTF-16, big-endian unless a byte order mark says otherwise.
    Utf16,
    /// Windows-1252.
    Cp1252,
}

impl ClipboardEncoding {
    /// Resolves an encoding name from the per-viewer arguments.
    ///
    /// A missing or unrecognised name falls back to ISO 8859-1 with a
    /// warning. Any other choice is accepted but noted, since it deviates
    /// from the RFB standard.
    #[must_use]
    pub fn from_name(name: Option<&str>) -> Self {
        let encoding = match name {
            None => Self::Iso8859_1,
            Some("ISO8859-1") => Self::Iso8859_1,
            Some("UTF-8") => Self::Utf8,
            Some("UTF-16") => Self::Utf16,
            Some("CP1252") => Self::Cp1252,
            Some(other) => {
                warn!("Unrecognised clipboard encoding \"{other}\", using ISO8859-1");
                Self::Iso8859_1
            }
        };
        if !encoding.is_standard() {
            warn!(
                "Clipboard encoding {} is a deviation from the RFB standard",
                encoding.name()
            );
        }
        encoding
    }

    /// Whether this encoding is the one the RFB standard specifies.
    #[must_use]
    pub fn is_standard(self) -> bool {
        matches!(self, Self::Iso8859_1)
    }

    /// Canonical name of this encoding.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Iso8859_1 => "ISO8859-1",
            Self::Utf8 => "UTF-8",
            Self::Utf16 => "UTF-16",
            Self::Cp1252 => "CP1252",
        }
    }

    /// Decodes inbound cut-text bytes into UTF-8.
    ///
    /// Input beyond [`CLIPBOARD_MAX_LEN`] bytes is dropped before decoding.
    #[must_use]
    pub fn decode(self, bytes: &[u8]) -> String {
        let bytes = if bytes.len() > CLIPBOARD_MAX_LEN {
            debug!(
                "Clipboard data truncated: {} of {} bytes dropped",
                bytes.len() - CLIPBOARD_MAX_LEN,
                bytes.len()
            );
            &bytes[..CLIPBOARD_MAX_LEN]
        } else {
            bytes
        };

        match self {
            Self::Iso8859_1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Utf16 => decode_utf16_bytes(bytes),
            Self::Cp1252 => bytes
                .iter()
                .map(|&b| match b {
                    0x80..=0x9F => CP1252_HIGH[usize::from(b) - 0x80],
                    _ => char::from(b),
                })
                .collect(),
        }
    }

    /// Encodes outbound UTF-8 viewer clipboard into this encoding.
    ///
    /// Characters with no representation in an 8-bit target become `?`.
    #[must_use]
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Self::Iso8859_1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
            Self::Utf8 => text.as_bytes().to_vec(),
            Self::Utf16 => {
                let mut out = vec![0xFE, 0xFF];
                for unit in text.encode_utf16() {
                    out.extend_from_slice(&unit.to_be_bytes());
                }
                out
            }
            Self::Cp1252 => text
                .chars()
                .map(|c| {
                    if let Some(pos) = CP1252_HIGH.iter().position(|&m| m == c) {
                        0x80 + pos as u8
                    } else {
                        u8::try_from(u32::from(c)).unwrap_or(b'?')
                    }
                })
                .collect(),
        }
    }
}

/// Decodes UTF-16 bytes with BOM detection; big-endian without a BOM.
fn decode_utf16_bytes(bytes: &[u8]) -> String {
    let (big_endian, payload) = match bytes {
        [0xFE, 0xFF, rest @ ..] => (true, rest),
        [0xFF, 0xFE, rest @ ..] => (false, rest),
        _ => (true, bytes),
    };
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| {
            let pair = [pair[0], pair[1]];
            if big_endian {
                u16::from_be_bytes(pair)
            } else {
                u16::from_le_bytes(pair)
            }
        })
        .collect();
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unrecognised_falls_back() {
        assert_eq!(
            ClipboardEncoding::from_name(Some("KOI8-R")),
            ClipboardEncoding::Iso8859_1
        );
        assert_eq!(ClipboardEncoding::from_name(None), ClipboardEncoding::Iso8859_1);
    }

    #[test]
    fn test_standard_flag() {
        assert!(ClipboardEncoding::Iso8859_1.is_standard());
        assert!(!ClipboardEncoding::Utf8.is_standard());
        assert!(!ClipboardEncoding::from_name(Some("UTF-16")).is_standard());
    }

    #[test]
    fn test_utf8_round_trip() {
        let enc = ClipboardEncoding::Utf8;
        assert_eq!(enc.decode(&[0xC3, 0xA9]), "é");
        assert_eq!(enc.encode("é"), vec![0xC3, 0xA9]);
    }

    #[test]
    fn test_iso8859_1_round_trip() {
        let enc = ClipboardEncoding::Iso8859_1;
        assert_eq!(enc.decode(&[0xE9, 0x21]), "é!");
        assert_eq!(enc.encode("é!"), vec![0xE9, 0x21]);
        assert_eq!(enc.encode("€"), vec![b'?']);
    }

    #[test]
    fn test_cp1252_euro_and_quotes() {
        let enc = ClipboardEncoding::Cp1252;
        assert_eq!(enc.decode(&[0x80, 0x93, 0x94]), "€\u{201C}\u{201D}");
        assert_eq!(enc.encode("€"), vec![0x80]);
        assert_eq!(enc.encode("é"), vec![0xE9]);
    }

    #[test]
    fn test_utf16_bom_handling() {
        let enc = ClipboardEncoding::Utf16;
        assert_eq!(enc.decode(&[0xFE, 0xFF, 0x00, 0xE9]), "é");
        assert_eq!(enc.decode(&[0xFF, 0xFE, 0xE9, 0x00]), "é");
        // No BOM defaults to big-endian.
        assert_eq!(enc.decode(&[0x00, 0xE9]), "é");
    }

    #[test]
    fn test_utf16_round_trip() {
        let enc = ClipboardEncoding::Utf16;
        let encoded = enc.encode("aé");
        assert_eq!(encoded, vec![0xFE, 0xFF, 0x00, 0x61, 0x00, 0xE9]);
        assert_eq!(enc.decode(&encoded), "aé");
    }

    #[test]
    fn test_utf16_lone_surrogate_replaced() {
        let enc = ClipboardEncoding::Utf16;
        assert_eq!(enc.decode(&[0xD8, 0x00]), "\u{FFFD}");
    }

    #[test]
    fn test_truncation_cap() {
        let big = vec![b'a'; CLIPBOARD_MAX_LEN + 10];
        let decoded = ClipboardEncoding::Iso8859_1.decode(&big);
        assert_eq!(decoded.len(), CLIPBOARD_MAX_LEN);
    }
}
