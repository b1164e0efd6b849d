// AES-128-CBC segment decryption with PKCS#7 padding removal.

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};

use crate::HlsError;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

fn decryption_error(reason: impl Into<String>) -> HlsError {
    HlsError::Decryption {
        reason: reason.into(),
    }
}

/// Decrypts media chunks that share one key and IV.
#[derive(Clone)]
pub struct SegmentDecryptor {
    key: [u8; 16],
    iv: [u8; 16],
}

impl SegmentDecryptor {
    pub fn new(key: &[u8], iv: [u8; 16]) -> Result<Self, HlsError> {
        let key: [u8; 16] = key.try_into().map_err(|_| {
            decryption_error(format!("key must be 16 bytes, got {}", key.len()))
        })?;

        Ok(SegmentDecryptor { key, iv })
    }

    /// Decrypts in place and strips the PKCS#7 padding.
    pub fn decrypt(&self, data: &mut Vec<u8>) -> Result<(), HlsError> {
        let cipher = Aes128CbcDec::new(&self.key.into(), &self.iv.into());

        let plain_len = cipher
            .decrypt_padded_mut::<Pkcs7>(data)
            .map_err(|e| decryption_error(format!("segment decryption failed: {e}")))?
            .len();

        data.truncate(plain_len);
        Ok(())
    }
}
