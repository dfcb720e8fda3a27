pub mod config;
pub mod db;
pub mod engine;
pub mod models;
pub mod reader;
pub mod sync;

pub use config::{SettingsStore, SyncSettings};
pub use db::Database;
pub use engine::{EngineSnapshot, EngineState, FocusEngine, FocusSignal};
pub use models::{AppIdentity, BrowserContext, FocusContext, Session};
pub use reader::ContextReader;
pub use sync::{SyncClient, SyncError, SyncOutcome, SyncService, Uploader};
