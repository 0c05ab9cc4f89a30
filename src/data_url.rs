//! ALFA Data Vault - Data URLs
//!
//! Attachments arrive and leave as `data:<mime>[;params][;base64],<payload>`.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use crate::error::{VaultError, VaultResult};

/// A parsed data URL borrowing its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl<'a> {
    pub mime_type: String,
    pub is_base64: bool,
    pub payload: &'a str,
}

impl<'a> DataUrl<'a> {
    /// Parse a data URL
    pub fn parse(url: &'a str) -> VaultResult<Self> {
        let rest = url
            .strip_prefix("data:")
            .ok_or_else(|| VaultError::InvalidDataUrl("missing 'data:' prefix".into()))?;
        let (header, payload) = rest
            .split_once(',')
            .ok_or_else(|| VaultError::InvalidDataUrl("missing ',' separator".into()))?;

        let mut parts = header.split(';');
        let mime = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let is_base64 = parts.any(|p| p.trim().eq_ignore_ascii_case("base64"));

        let mime_type = if mime.is_empty() { "text/plain".to_string() } else { mime };
        if !mime_type.contains('/') {
            return Err(VaultError::InvalidDataUrl(format!("bad MIME type '{}'", mime_type)));
        }

        Ok(Self {
            mime_type,
            is_base64,
            payload,
        })
    }

    /// Check if the MIME type is an image
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }

    /// File extension for the MIME type
    pub fn extension(&self) -> String {
        extension_for_mime(&self.mime_type)
    }

    /// Size of the decoded content in bytes
    pub fn decoded_len(&self) -> u64 {
        if self.is_base64 {
            base64_decoded_len(self.payload)
        } else {
            self.payload.len() as u64
        }
    }

    /// Decode the payload bytes
    pub fn decode(&self) -> VaultResult<Vec<u8>> {
        if self.is_base64 {
            let compact: String = self.payload.chars().filter(|c| !c.is_whitespace()).collect();
            STANDARD
                .decode(compact.as_bytes())
                .map_err(|e| VaultError::InvalidDataUrl(e.to_string()))
        } else {
            Ok(self.payload.as_bytes().to_vec())
        }
    }
}

/// Build a base64 data URL
pub fn encode(mime_type: &str, data: &[u8]) -> String {
    format!("data:{};base64,{}", mime_type, STANDARD.encode(data))
}

/// Length of the bytes a base64 string decodes to
pub fn base64_decoded_len(payload: &str) -> u64 {
    let chars = payload.chars().filter(|c| !c.is_whitespace()).count() as u64;
    let padding = payload
        .trim_end()
        .chars()
        .rev()
        .take_while(|c| *c == '=')
        .count() as u64;
    (chars * 3 / 4).saturating_sub(padding)
}

/// Map a MIME type to a file extension
pub fn extension_for_mime(mime_type: &str) -> String {
    let known = match mime_type {
        "image/jpeg" | "image/jpg" | "image/pjpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/heic" => "heic",
        "image/heif" => "heif",
        "image/svg+xml" => "svg",
        "image/tiff" => "tiff",
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "application/json" => "json",
        "application/zip" => "zip",
        "text/plain" => "txt",
        "text/csv" => "csv",
        "text/html" => "html",
        "audio/mpeg" => "mp3",
        "video/mp4" => "mp4",
        _ => "",
    };
    if !known.is_empty() {
        return known.to_string();
    }

    // Fall back to a clean subtype, e.g. "application/x-foo" -> "xfoo"
    let subtype: String = mime_type
        .split('/')
        .nth(1)
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if subtype.is_empty() || subtype.len() > 10 {
        "bin".to_string()
    } else {
        subtype
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_base64() {
        let url = "data:image/png;base64,iVBORw0KGgo=";
        let parsed = DataUrl::parse(url).unwrap();

        assert_eq!(parsed.mime_type, "image/png");
        assert!(parsed.is_base64);
        assert!(parsed.is_image());
        assert_eq!(parsed.extension(), "png");
        assert_eq!(parsed.decoded_len(), parsed.decode().unwrap().len() as u64);
    }

    #[test]
    fn test_parse_params_and_default_mime() {
        let parsed = DataUrl::parse("data:text/plain;charset=utf-8;base64,aGk=").unwrap();
        assert_eq!(parsed.decode().unwrap(), b"hi");

        let bare = DataUrl::parse("data:,hello").unwrap();
        assert_eq!(bare.mime_type, "text/plain");
        assert!(!bare.is_base64);
        assert_eq!(bare.decoded_len(), 5);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(DataUrl::parse("http://example.com").is_err());
        assert!(DataUrl::parse("data:image/png;base64").is_err());
        assert!(DataUrl::parse("data:nonsense;base64,AAAA").is_err());
    }

    #[test]
    fn test_decoded_len_matches_padding() {
        for input in [&b""[..], b"a", b"ab", b"abc", b"abcd", b"abcde"] {
            let encoded = STANDARD.encode(input);
            assert_eq!(base64_decoded_len(&encoded), input.len() as u64, "{:?}", input);
        }
    }

    #[test]
    fn test_extensions() {
        assert_eq!(extension_for_mime("image/jpeg"), "jpg");
        assert_eq!(extension_for_mime("application/pdf"), "pdf");
        assert_eq!(extension_for_mime("application/x-foo"), "xfoo");
        assert_eq!(extension_for_mime("application/vnd.some.really-long-type"), "bin");
    }

    #[test]
    fn test_encode_roundtrip() {
        let url = encode("image/jpeg", &[0xFF, 0xD8, 0xFF]);
        let parsed = DataUrl::parse(&url).unwrap();
        assert_eq!(parsed.decode().unwrap(), vec![0xFF, 0xD8, 0xFF]);
    }
}
