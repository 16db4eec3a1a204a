pub mod errors;
pub mod events;
pub mod ids;
pub mod request;
pub mod security;

pub use errors::{ProtocolViolation, UpstreamError};
pub use events::ControlEvent;
pub use ids::{BypassCallId, ConsumerId, PresetId, RequestId};
pub use request::{CompletedRequest, Headers, PendingRequest, RequestStatus};
