//! In-memory obfuscated secrets.
//!
//! A protected value keeps its bytes XOR-ed against a ChaCha20 keystream
//! derived from a per-process key and a per-value nonce, so a memory dump
//! does not expose resident secrets in the clear. `reveal`/`read` decode
//! transiently into a [`Zeroizing`] buffer that is wiped on drop.
//!
//! Two values compare equal by decoded content, never by obfuscation state.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use rand::RngCore;
use std::fmt;
use std::sync::OnceLock;
use zeroize::Zeroizing;

fn process_key() -> &'static [u8; 32] {
    static KEY: OnceLock<[u8; 32]> = OnceLock::new();
    KEY.get_or_init(|| {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        key
    })
}

fn apply_pad(nonce: &[u8; 12], data: &mut [u8]) {
    let mut cipher = ChaCha20::new(process_key().into(), nonce.into());
    cipher.apply_keystream(data);
}

/// A byte sequence tagged with a protection flag. Protected content lives
/// obfuscated in memory; unprotected content is stored as-is.
#[derive(Clone)]
pub struct ProtectedBinary {
    protect: bool,
    nonce: [u8; 12],
    data: Vec<u8>,
}

impl ProtectedBinary {
    pub fn new(protect: bool, plaintext: &[u8]) -> Self {
        let mut nonce = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce);
        let mut data = plaintext.to_vec();
        if protect {
            apply_pad(&nonce, &mut data);
        }
        Self {
            protect,
            nonce,
            data,
        }
    }

    pub fn plain(plaintext: &[u8]) -> Self {
        Self::new(false, plaintext)
    }

    pub fn protected(plaintext: &[u8]) -> Self {
        Self::new(true, plaintext)
    }

    pub fn is_protected(&self) -> bool {
        self.protect
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decode into a transient buffer, wiped on drop.
    pub fn reveal(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(self.data.clone());
        if self.protect {
            apply_pad(&self.nonce, &mut out);
        }
        out
    }

    /// Raw obfuscated bytes (for tests asserting the value is not resident
    /// in the clear).
    #[cfg(test)]
    pub(crate) fn resident_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl PartialEq for ProtectedBinary {
    fn eq(&self, other: &Self) -> bool {
        *self.reveal() == *other.reveal()
    }
}

impl Eq for ProtectedBinary {}

impl fmt::Debug for ProtectedBinary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectedBinary")
            .field("protect", &self.protect)
            .field("len", &self.data.len())
            .finish()
    }
}

/// UTF-8 variant of [`ProtectedBinary`] for string fields.
#[derive(Clone)]
pub struct ProtectedString {
    inner: ProtectedBinary,
}

impl ProtectedString {
    pub fn new(protect: bool, value: &str) -> Self {
        Self {
            inner: ProtectedBinary::new(protect, value.as_bytes()),
        }
    }

    pub fn plain(value: &str) -> Self {
        Self::new(false, value)
    }

    pub fn protected(value: &str) -> Self {
        Self::new(true, value)
    }

    pub fn is_protected(&self) -> bool {
        self.inner.is_protected()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Decode into a transient string, wiped on drop.
    pub fn read(&self) -> Zeroizing<String> {
        let bytes = self.inner.reveal();
        Zeroizing::new(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn reveal(&self) -> Zeroizing<Vec<u8>> {
        self.inner.reveal()
    }
}

impl PartialEq for ProtectedString {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Eq for ProtectedString {}

impl Default for ProtectedString {
    fn default() -> Self {
        Self::plain("")
    }
}

impl fmt::Debug for ProtectedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_protected() {
            write!(f, "ProtectedString(***)")
        } else {
            write!(f, "ProtectedString({:?})", self.read().as_str())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_value_is_not_resident_in_clear() {
        let secret = b"correct horse battery staple";
        let value = ProtectedBinary::protected(secret);
        assert_ne!(value.resident_bytes(), secret.as_slice());
        assert_eq!(&*value.reveal(), secret.as_slice());
    }

    #[test]
    fn unprotected_value_stays_plain() {
        let value = ProtectedBinary::plain(b"visible");
        assert_eq!(value.resident_bytes(), b"visible");
    }

    #[test]
    fn equality_is_by_content_not_obfuscation_state() {
        let a = ProtectedString::protected("swordfish");
        let b = ProtectedString::protected("swordfish");
        let c = ProtectedString::plain("swordfish");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, ProtectedString::protected("tunafish"));
    }

    #[test]
    fn clone_preserves_content() {
        let a = ProtectedString::protected("secret");
        let b = a.clone();
        assert_eq!(*a.read(), *b.read());
    }
}
