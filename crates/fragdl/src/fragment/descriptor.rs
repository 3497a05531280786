use bytes::Bytes;

use crate::error::DownloadError;

pub const AES_128: &str = "AES-128";

/// Half-open byte range `[start, end)` of a fragment inside a larger resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Value for the HTTP `Range` header (inclusive end).
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encryption parameters attached to a fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecryptInfo {
    /// Only `AES-128` is decrypted; any other method passes content through.
    pub method: String,
    /// Where to fetch the key when `key` is not given inline.
    pub uri: Option<String>,
    pub iv: Option<[u8; 16]>,
    pub key: Option<Bytes>,
}

impl DecryptInfo {
    pub fn aes128(uri: impl Into<String>) -> Self {
        Self {
            method: AES_128.to_string(),
            uri: Some(uri.into()),
            ..Default::default()
        }
    }

    pub fn with_iv(mut self, iv: [u8; 16]) -> Self {
        self.iv = Some(iv);
        self
    }

    pub fn with_key(mut self, key: Bytes) -> Self {
        self.key = Some(key);
        self
    }

    pub fn is_aes128(&self) -> bool {
        self.method == AES_128
    }

    /// Parse a hex IV such as `0x000102...0f`.
    pub fn parse_iv(hex_iv: &str) -> Result<[u8; 16], DownloadError> {
        let digits = hex_iv
            .strip_prefix("0x")
            .or_else(|| hex_iv.strip_prefix("0X"))
            .unwrap_or(hex_iv);
        let mut iv = [0u8; 16];
        hex::decode_to_slice(digits, &mut iv)
            .map_err(|e| DownloadError::decryption(format!("Failed to parse IV '{hex_iv}': {e}")))?;
        Ok(iv)
    }
}

/// One remotely fetched chunk of the output, in output order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentDescriptor {
    /// 0-based position in the output.
    pub index: u64,
    pub url: String,
    pub byte_range: Option<ByteRange>,
    pub decrypt_info: Option<DecryptInfo>,
    /// Used to derive the IV when `decrypt_info.iv` is absent.
    pub media_sequence: u64,
    /// Total number of fragments, when the producer knows it.
    pub fragment_count: Option<u64>,
}

impl FragmentDescriptor {
    pub fn new(index: u64, url: impl Into<String>) -> Self {
        Self {
            index,
            url: url.into(),
            media_sequence: index,
            ..Default::default()
        }
    }

    pub fn with_byte_range(mut self, start: u64, end: u64) -> Self {
        self.byte_range = Some(ByteRange { start, end });
        self
    }

    pub fn with_decrypt_info(mut self, info: DecryptInfo) -> Self {
        self.decrypt_info = Some(info);
        self
    }

    pub fn with_fragment_count(mut self, count: u64) -> Self {
        self.fragment_count = Some(count);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_header_is_inclusive() {
        let range = ByteRange { start: 100, end: 200 };
        assert_eq!(range.header_value(), "bytes=100-199");
        assert_eq!(range.len(), 100);
    }

    #[test]
    fn iv_parsing() {
        let iv = DecryptInfo::parse_iv("0x000102030405060708090a0b0c0d0e0f").unwrap();
        assert_eq!(iv[15], 0x0f);
        assert!(DecryptInfo::parse_iv("0x1234").is_err());
    }
}
