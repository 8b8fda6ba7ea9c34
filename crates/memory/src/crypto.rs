//! Per-user encryption contract.
//!
//! Memory content is stored encrypted. The production deployment injects a
//! client for the external authenticated-encryption service; the
//! [`PlaintextCipher`] stands in for the single binary and for tests.

use cortex_domain::Result;

pub trait EncryptionService: Send + Sync {
    fn encrypt(&self, user_id: &str, plaintext: &str) -> Result<String>;
    fn decrypt(&self, user_id: &str, ciphertext: &str) -> Result<String>;
}

/// Identity cipher. Development fallback only.
#[derive(Default)]
pub struct PlaintextCipher;

impl EncryptionService for PlaintextCipher {
    fn encrypt(&self, _user_id: &str, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_owned())
    }

    fn decrypt(&self, _user_id: &str, ciphertext: &str) -> Result<String> {
        Ok(ciphertext.to_owned())
    }
}
