//! In-memory stand-ins for the engine's collaborators. Enable the `test_utils` feature to use them from other crates.
mod memory_store;
pub mod prepare_env;
mod scripted_provider;
mod scripted_watcher;

pub use memory_store::{MemoryRecordStore, WriteRecord};
pub use scripted_provider::{ScriptedProvider, ScriptedSession};
pub use scripted_watcher::{PageScript, ScriptedWatcher};
