//! # mockgate-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`MockSettings::default()`]
//! 2. **Settings file**: `mockgate.json` or `$MOCKGATE_SETTINGS` (deep-merged over defaults)
//! 3. **Environment variables**: `MOCKGATE_*` overrides (highest priority)
//!
//! ```no_run
//! let settings = mockgate_settings::load_settings().unwrap_or_default();
//! println!("manual timeout: {:?}", settings.manual.timeout());
//! ```

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
