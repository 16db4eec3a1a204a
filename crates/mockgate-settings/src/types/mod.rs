//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`
//! so a settings file may specify any subset of fields.

mod server;

pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "manual": { "timeoutSecs": 120 }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MockSettings {
    pub server: ServerSettings,
    pub manual: ManualSettings,
    pub storage: StorageSettings,
    pub logging: LoggingSettings,
}
