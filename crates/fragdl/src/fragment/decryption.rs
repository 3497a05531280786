//! Fragment decryption: AES-128-CBC with PKCS#7 padding, keys fetched once per URL.

use std::collections::HashMap;

use aes::Aes128;
use bytes::Bytes;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::descriptor::FragmentDescriptor;
use super::fetcher::FragmentFetcher;
use crate::error::DownloadError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// IV used when a fragment carries none: 8 zero bytes followed by the
/// big-endian media sequence number.
pub fn media_sequence_iv(media_sequence: u64) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[8..].copy_from_slice(&media_sequence.to_be_bytes());
    iv
}

pub fn decrypt_aes128(data: &[u8], key: &[u8], iv: &[u8; 16]) -> Result<Bytes, DownloadError> {
    let decryptor = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
        DownloadError::decryption(format!("Failed to initialize AES decryptor: {e}"))
    })?;
    let mut buffer = data.to_vec();
    let plain_len = decryptor
        .decrypt_padded_mut::<Pkcs7>(&mut buffer)
        .map_err(|e| DownloadError::decryption(format!("Decryption failed: {e}")))?
        .len();
    buffer.truncate(plain_len);
    Ok(Bytes::from(buffer))
}

/// Run the decryption on the blocking pool so large fragments do not stall
/// the coordinating task.
pub async fn decrypt_offloaded(
    data: Bytes,
    key: Bytes,
    iv: [u8; 16],
) -> Result<Bytes, DownloadError> {
    tokio::task::spawn_blocking(move || decrypt_aes128(&data, &key, &iv))
        .await
        .map_err(|e| DownloadError::decryption(format!("Decryption task failed: {e}")))?
}

/// Keys of one download, keyed by URL. Each key is fetched at most once.
#[derive(Debug, Default)]
pub struct KeyCache {
    keys: HashMap<String, Bytes>,
}

impl KeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub async fn get_or_fetch(
        &mut self,
        url: &str,
        fetcher: &dyn FragmentFetcher,
        token: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        if let Some(key) = self.keys.get(url) {
            return Ok(key.clone());
        }
        let key = fetcher.fetch_key(url, token).await?;
        if key.len() != 16 {
            return Err(DownloadError::decryption(format!(
                "Decryption key from {url} has incorrect length: {} bytes (expected 16)",
                key.len()
            )));
        }
        debug!(url, "Fetched decryption key");
        self.keys.insert(url.to_string(), key.clone());
        Ok(key)
    }
}

/// Decrypts fragments of one download.
#[derive(Debug, Default)]
pub struct Decrypter {
    cache: KeyCache,
    key_uri_override: Option<String>,
}

impl Decrypter {
    pub fn new(key_uri_override: Option<String>) -> Self {
        Self {
            cache: KeyCache::new(),
            key_uri_override,
        }
    }

    pub fn key_cache(&self) -> &KeyCache {
        &self.cache
    }

    /// Decrypt `content` if the fragment is AES-128 encrypted, otherwise return it as is.
    pub async fn decrypt_fragment(
        &mut self,
        fragment: &FragmentDescriptor,
        content: Bytes,
        fetcher: &dyn FragmentFetcher,
        token: &CancellationToken,
    ) -> Result<Bytes, DownloadError> {
        let Some(info) = fragment.decrypt_info.as_ref().filter(|i| i.is_aes128()) else {
            return Ok(content);
        };
        let iv = info
            .iv
            .unwrap_or_else(|| media_sequence_iv(fragment.media_sequence));
        let key = match &info.key {
            Some(key) => key.clone(),
            None => {
                let uri = self
                    .key_uri_override
                    .as_deref()
                    .or(info.uri.as_deref())
                    .ok_or_else(|| DownloadError::decryption("Key URI is missing"))?
                    .to_string();
                self.cache.get_or_fetch(&uri, fetcher, token).await?
            }
        };
        decrypt_offloaded(content, key, iv).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fragment::descriptor::DecryptInfo;
    use async_trait::async_trait;
    use cipher::BlockEncryptMut;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Aes128CbcEnc = cbc::Encryptor<Aes128>;

    pub(crate) fn encrypt(plain: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        let encryptor = Aes128CbcEnc::new_from_slices(key, iv).unwrap();
        let mut buffer = vec![0u8; (plain.len() / 16 + 1) * 16];
        buffer[..plain.len()].copy_from_slice(plain);
        encryptor
            .encrypt_padded_mut::<Pkcs7>(&mut buffer, plain.len())
            .unwrap()
            .to_vec()
    }

    struct KeyServer {
        key: Bytes,
        requests: AtomicUsize,
    }

    #[async_trait]
    impl FragmentFetcher for KeyServer {
        async fn fetch(
            &self,
            _fragment: &FragmentDescriptor,
            _dest: &Path,
            _token: &CancellationToken,
            _on_progress: &(dyn Fn(u64) + Send + Sync),
        ) -> Result<u64, DownloadError> {
            unreachable!("only keys are requested")
        }

        async fn fetch_key(&self, _url: &str, _token: &CancellationToken) -> Result<Bytes, DownloadError> {
            self.requests.fetch_add(1, Ordering::Relaxed);
            Ok(self.key.clone())
        }
    }

    #[test]
    fn iv_from_media_sequence() {
        let iv = media_sequence_iv(0x0102);
        assert_eq!(&iv[..8], &[0u8; 8]);
        assert_eq!(&iv[8..], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
    }

    #[test]
    fn decrypt_round_trip() {
        let key = [0x42u8; 16];
        let iv = [0x24u8; 16];
        let plain = b"fragment payload that spans more than one block";
        let encrypted = encrypt(plain, &key, &iv);
        assert_eq!(decrypt_aes128(&encrypted, &key, &iv).unwrap().as_ref(), plain);
        assert!(decrypt_aes128(&encrypted[..encrypted.len() - 1], &key, &iv).is_err());
    }

    #[tokio::test]
    async fn keys_are_fetched_once_per_url() {
        let key = [7u8; 16];
        let server = KeyServer {
            key: Bytes::copy_from_slice(&key),
            requests: AtomicUsize::new(0),
        };
        let token = CancellationToken::new();
        let mut decrypter = Decrypter::new(None);

        for sequence in 10..13u64 {
            let plain = format!("segment {sequence}");
            let encrypted = encrypt(plain.as_bytes(), &key, &media_sequence_iv(sequence));
            let mut fragment = FragmentDescriptor::new(sequence - 10, "http://h/seg.ts")
                .with_decrypt_info(DecryptInfo::aes128("http://h/key"));
            fragment.media_sequence = sequence;
            let out = decrypter
                .decrypt_fragment(&fragment, Bytes::from(encrypted), &server, &token)
                .await
                .unwrap();
            assert_eq!(out.as_ref(), plain.as_bytes());
        }
        assert_eq!(server.requests.load(Ordering::Relaxed), 1);
        assert_eq!(decrypter.key_cache().len(), 1);
    }

    #[tokio::test]
    async fn inline_key_and_plain_fragments() {
        let server = KeyServer {
            key: Bytes::from_static(&[0u8; 4]),
            requests: AtomicUsize::new(0),
        };
        let token = CancellationToken::new();
        let mut decrypter = Decrypter::new(None);

        let plain = FragmentDescriptor::new(0, "http://h/0.ts");
        let out = decrypter
            .decrypt_fragment(&plain, Bytes::from_static(b"raw"), &server, &token)
            .await
            .unwrap();
        assert_eq!(out.as_ref(), b"raw");

        let key = [9u8; 16];
        let iv = [1u8; 16];
        let inline = FragmentDescriptor::new(1, "http://h/1.ts").with_decrypt_info(
            DecryptInfo::aes128("http://h/key")
                .with_key(Bytes::copy_from_slice(&key))
                .with_iv(iv),
        );
        let out = decrypter
            .decrypt_fragment(&inline, Bytes::from(encrypt(b"secret", &key, &iv)), &server, &token)
            .await
            .unwrap();
        assert_eq!(out.as_ref(), b"secret");
        assert_eq!(server.requests.load(Ordering::Relaxed), 0);

        // A fetched key of the wrong size is rejected.
        let fetched = FragmentDescriptor::new(2, "http://h/2.ts")
            .with_decrypt_info(DecryptInfo::aes128("http://h/short-key"));
        let err = decrypter
            .decrypt_fragment(&fetched, Bytes::from_static(b"x"), &server, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::Decryption { .. }));
    }
}
