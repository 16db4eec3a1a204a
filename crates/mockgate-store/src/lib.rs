//! Preset response queues, bypass configuration, and their on-disk state.

pub mod bypass_config;
pub mod error;
pub mod persist;
pub mod preset;
pub mod validate;

pub use bypass_config::{BypassConfig, BypassConfigStore, BypassConfigUpdate, BypassConfigView};
pub use error::StoreError;
pub use persist::{PersistConfig, PersistReport};
pub use preset::{PresetItem, PresetQueue};
