//! Forwarding of intercepted requests to a real upstream in bypass mode.

pub mod forwarder;
pub mod headers;
pub mod mock;

pub use forwarder::{build_url, ForwardTarget, ForwardedResponse, Forwarder, HttpForwarder};
pub use headers::prepare_headers;
pub use mock::{MockForwarder, MockReply};
