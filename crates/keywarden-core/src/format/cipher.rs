//! Content-cipher registry.
//!
//! The body cipher is selected by UUID from the header; alternates plug in
//! through [`CipherRegistry::register`]. AES-256-CBC with PKCS#7 padding is
//! the built-in default.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{Error, Result};

/// UUID of the built-in AES-256-CBC cipher.
pub const AES_CIPHER_UUID: Uuid = Uuid::from_bytes([
    0x31, 0xc1, 0xf2, 0xe6, 0xbf, 0x71, 0x43, 0x50, 0xbe, 0x58, 0x05, 0x21, 0x6a, 0xfc, 0x5a,
    0xff,
]);

/// A symmetric cipher usable for the encrypted body.
pub trait ContentCipher: Send + Sync {
    fn uuid(&self) -> Uuid;
    fn name(&self) -> &'static str;
    fn iv_length(&self) -> usize;
    fn encrypt(&self, key: &[u8; 32], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;
    fn decrypt(&self, key: &[u8; 32], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub struct AesCbcCipher;

impl ContentCipher for AesCbcCipher {
    fn uuid(&self) -> Uuid {
        AES_CIPHER_UUID
    }

    fn name(&self) -> &'static str {
        "AES-256-CBC"
    }

    fn iv_length(&self) -> usize {
        16
    }

    fn encrypt(&self, key: &[u8; 32], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcEnc::new_from_slices(key, iv)
            .map_err(|e| Error::Cipher(format!("aes-cbc init: {e}")))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt(&self, key: &[u8; 32], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| Error::Cipher(format!("aes-cbc init: {e}")))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| Error::InvalidCompositeKey)
    }
}

/// UUID-keyed cipher lookup. The default registry knows AES.
pub struct CipherRegistry {
    ciphers: Vec<Arc<dyn ContentCipher>>,
}

impl CipherRegistry {
    pub fn empty() -> Self {
        Self {
            ciphers: Vec::new(),
        }
    }

    pub fn register(&mut self, cipher: Arc<dyn ContentCipher>) {
        self.ciphers.retain(|c| c.uuid() != cipher.uuid());
        self.ciphers.push(cipher);
    }

    pub fn get(&self, uuid: Uuid) -> Result<&dyn ContentCipher> {
        self.ciphers
            .iter()
            .find(|c| c.uuid() == uuid)
            .map(|c| c.as_ref())
            .ok_or(Error::UnknownCipher(uuid))
    }
}

impl Default for CipherRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(AesCbcCipher));
        registry
    }
}
