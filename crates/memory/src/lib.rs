//! Long-term memory: extraction, selection, decay, and the encryption
//! contract that keeps stored content opaque.

pub mod crypto;
pub mod engine;
pub mod hash;

pub use crypto::{EncryptionService, PlaintextCipher};
pub use engine::{compute_engagement, decay_score, MemoryEngine};
pub use hash::{content_hash, normalize};
