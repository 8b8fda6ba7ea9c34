//! Document stores for the Cortex orchestrator.
//!
//! Every store keeps its working set behind a `parking_lot::RwLock` and
//! optionally persists to a JSON file under the configured state path (the
//! production deployment swaps these for a document database behind the
//! same method contracts). All operations are scoped to `user_id`.

pub mod apikeys;
pub mod chats;
pub mod codec;
pub mod daemons;
pub mod engrams;
pub mod memories;
pub mod persist;
pub mod projects;
pub mod sessions;
pub mod tasks;

pub use apikeys::{ApiKeyRecord, ApiKeyStore};
pub use chats::{Chat, ChatFields, ChatMessage, ChatStore};
pub use daemons::DaemonStore;
pub use engrams::EngramStore;
pub use memories::MemoryStore;
pub use projects::{Project, ProjectStore};
pub use sessions::SessionStore;
pub use tasks::TaskStore;
