//! The composite key: heterogeneous credential factors combined into one
//! 256-bit symmetric key.

use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use super::factor::UserKey;
use super::transform::transform_key;
use crate::error::Result;

/// Combines zero or more user key factors. Factor order matters: the raw
/// material is concatenated in insertion order before hashing.
#[derive(Default)]
pub struct CompositeKey {
    keys: Vec<UserKey>,
}

impl CompositeKey {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a factor.
    ///
    /// Panics when the combination violates the factor contract: more than
    /// one OS-account factor, or mixing an exclusive provider with anything
    /// else. Those are programming errors, caught fast.
    pub fn add_user_key(&mut self, key: UserKey) {
        assert!(
            !(key.is_user_account() && self.keys.iter().any(UserKey::is_user_account)),
            "only one OS-account key factor may be present"
        );
        assert!(
            !key.is_exclusive() || self.keys.is_empty(),
            "an exclusive key provider cannot be combined with other factors"
        );
        assert!(
            !self.keys.iter().any(UserKey::is_exclusive),
            "an exclusive key provider cannot be combined with other factors"
        );
        self.keys.push(key);
    }

    /// Remove and return the factor at `index`.
    ///
    /// Panics when out of range — caller bug.
    pub fn remove_user_key(&mut self, index: usize) -> UserKey {
        assert!(index < self.keys.len(), "key factor index out of range");
        self.keys.remove(index)
    }

    pub fn user_keys(&self) -> &[UserKey] {
        &self.keys
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn contains_user_account(&self) -> bool {
        self.keys.iter().any(UserKey::is_user_account)
    }

    /// 32-byte raw composite: SHA-256 over the concatenated factor material,
    /// in insertion order. A direct-key provider's 32 bytes are used as-is.
    fn raw_key32(&self) -> Result<Zeroizing<[u8; 32]>> {
        if let Some(direct) = self.keys.iter().find(|k| k.is_direct()) {
            let data = direct.key_data();
            let mut out = Zeroizing::new([0u8; 32]);
            out.copy_from_slice(&data);
            return Ok(out);
        }
        let mut hasher = Sha256::new();
        for key in &self.keys {
            let data = key.key_data();
            hasher.update(&*data);
        }
        let digest = hasher.finalize();
        let mut out = Zeroizing::new([0u8; 32]);
        out.copy_from_slice(&digest);
        Ok(out)
    }

    /// Derive the final 256-bit key: hash the factors, stretch through
    /// `rounds` of the seeded block transform, hash again. A pure function
    /// of (factors, seed, rounds).
    pub fn generate_key32(&self, seed: &[u8; 32], rounds: u64) -> Result<Zeroizing<[u8; 32]>> {
        let raw = self.raw_key32()?;
        let mut transformed = transform_key(&raw, seed, rounds);
        let out = Zeroizing::new(transformed);
        transformed.zeroize();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::factor::{
        CustomKey, KeyProvider, KeyProviderContext, PasswordKey, UserAccountKey,
    };

    fn password_only(p: &str) -> CompositeKey {
        let mut key = CompositeKey::new();
        key.add_user_key(UserKey::Password(PasswordKey::new(p)));
        key
    }

    #[test]
    fn generation_is_deterministic() {
        let seed = [3u8; 32];
        let a = password_only("p").generate_key32(&seed, 100).unwrap();
        let b = password_only("p").generate_key32(&seed, 100).unwrap();
        assert_eq!(*a, *b);
    }

    #[test]
    fn every_input_perturbs_the_key() {
        let seed = [3u8; 32];
        let base = password_only("p").generate_key32(&seed, 100).unwrap();

        assert_ne!(*base, *password_only("q").generate_key32(&seed, 100).unwrap());
        assert_ne!(*base, *password_only("p").generate_key32(&seed, 101).unwrap());
        let mut seed2 = seed;
        seed2[7] ^= 0x80;
        assert_ne!(*base, *password_only("p").generate_key32(&seed2, 100).unwrap());
    }

    #[test]
    fn factor_order_matters() {
        let seed = [0u8; 32];
        let mut ab = CompositeKey::new();
        ab.add_user_key(UserKey::Password(PasswordKey::new("a")));
        ab.add_user_key(UserKey::UserAccount(UserAccountKey::from_raw(b"b")));
        let mut ba = CompositeKey::new();
        ba.add_user_key(UserKey::UserAccount(UserAccountKey::from_raw(b"b")));
        ba.add_user_key(UserKey::Password(PasswordKey::new("a")));
        assert_ne!(
            *ab.generate_key32(&seed, 10).unwrap(),
            *ba.generate_key32(&seed, 10).unwrap()
        );
    }

    #[test]
    #[should_panic(expected = "only one OS-account key factor")]
    fn second_user_account_factor_panics() {
        let mut key = CompositeKey::new();
        key.add_user_key(UserKey::UserAccount(UserAccountKey::from_raw(b"one")));
        key.add_user_key(UserKey::UserAccount(UserAccountKey::from_raw(b"two")));
    }

    struct DirectProvider;

    impl KeyProvider for DirectProvider {
        fn name(&self) -> &str {
            "token"
        }
        fn direct_key(&self) -> bool {
            true
        }
        fn key_data(&self, _ctx: &KeyProviderContext) -> crate::error::Result<Vec<u8>> {
            Ok(vec![0x42; 32])
        }
    }

    #[test]
    fn direct_provider_bypasses_first_hash() {
        let custom =
            CustomKey::from_provider(&DirectProvider, &KeyProviderContext::default()).unwrap();
        let mut key = CompositeKey::new();
        key.add_user_key(UserKey::Custom(custom));

        let seed = [5u8; 32];
        let got = key.generate_key32(&seed, 16).unwrap();
        let expected = crate::keys::transform::transform_key(&[0x42; 32], &seed, 16);
        assert_eq!(*got, expected);
    }

    #[test]
    #[should_panic(expected = "exclusive key provider")]
    fn exclusive_provider_refuses_company() {
        let custom =
            CustomKey::from_provider(&DirectProvider, &KeyProviderContext::default()).unwrap();
        let mut key = CompositeKey::new();
        key.add_user_key(UserKey::Custom(custom));
        key.add_user_key(UserKey::Password(PasswordKey::new("p")));
    }
}
