mod bridge;
pub mod channel;
pub mod logging;
mod options;
mod settings;
mod store;

pub use bridge::*;
pub use options::*;
pub use settings::{MqttSettings, Settings};
pub use store::{FileStore, MemoryStore, OPTIONS_KEY, PersistentStore, StoreError};
