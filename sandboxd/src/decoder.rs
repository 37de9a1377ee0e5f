//! Turns a request path into program source.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    #[error("No code provided")]
    Empty,

    #[error("Invalid hex encoding")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("Invalid hex encoding")]
    InvalidUtf8,
}

/// Decoded program text. Owned by a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSource(String);

impl ProgramSource {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

/// Decode a raw request path (`/<hex>`). The query string must already be
/// stripped; a leading `/` is removed and the rest is the payload.
pub fn decode_path(path: &str) -> Result<ProgramSource, DecodeError> {
    decode_payload(path.strip_prefix('/').unwrap_or(path))
}

/// Decode hex-encoded UTF-8. Either letter case is accepted.
pub fn decode_payload(payload: &str) -> Result<ProgramSource, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::Empty);
    }
    let bytes = hex::decode(payload)?;
    String::from_utf8(bytes)
        .map(ProgramSource)
        .map_err(|_| DecodeError::InvalidUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_utf8_text() {
        for text in ["42", "console.log(\"héllo\")", "const 名 = '🦀'; 名", " \n\t", "a/b?c%d"] {
            let encoded = hex::encode(text);
            assert_eq!(decode_payload(&encoded).unwrap().as_str(), text);
            assert_eq!(
                decode_payload(&encoded.to_uppercase()).unwrap().as_str(),
                text
            );
        }
    }

    #[test]
    fn round_trips_every_encoded_width() {
        let boundaries: String = [
            '\u{0}', '\u{7f}', '\u{80}', '\u{7ff}', '\u{800}', '\u{d7ff}', '\u{e000}',
            '\u{fffd}', '\u{ffff}', '\u{10000}', '\u{10ffff}',
        ]
        .into_iter()
        .collect();
        let sweep: Vec<String> = (0..=0x10ffff_u32)
            .step_by(97)
            .filter_map(char::from_u32)
            .collect::<Vec<_>>()
            .chunks(512)
            .map(|chunk| chunk.iter().collect())
            .collect();

        for text in std::iter::once(&boundaries).chain(&sweep) {
            let encoded = hex::encode(text);
            assert_eq!(decode_payload(&encoded).unwrap().as_str(), text);
            assert_eq!(
                decode_payload(&encoded.to_uppercase()).unwrap().as_str(),
                text
            );
        }
    }

    #[test]
    fn strips_single_leading_slash() {
        assert_eq!(decode_path("/3432").unwrap().into_string(), "42");
    }

    #[test]
    fn empty_payload() {
        assert_eq!(decode_path("/"), Err(DecodeError::Empty));
        assert_eq!(decode_path(""), Err(DecodeError::Empty));
    }

    #[test]
    fn malformed_hex() {
        for payload in ["zz", "343", "34 2", "/3432", "34%32"] {
            let err = decode_payload(payload).unwrap_err();
            assert!(matches!(err, DecodeError::InvalidHex(_)), "{payload}: {err:?}");
            assert_eq!(err.to_string(), "Invalid hex encoding");
        }
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let err = decode_payload("ff").unwrap_err();
        assert_eq!(err, DecodeError::InvalidUtf8);
        assert_eq!(err.to_string(), "Invalid hex encoding");
    }

    #[test]
    fn rejects_malformed_utf8_sequences() {
        // Truncated, stray continuation, overlong, surrogate, above U+10FFFF.
        for payload in ["c3", "e282", "f09f98", "80", "c0af", "eda080", "f4908080", "3432c3"] {
            assert_eq!(
                decode_payload(payload),
                Err(DecodeError::InvalidUtf8),
                "{payload}"
            );
        }
    }
}
