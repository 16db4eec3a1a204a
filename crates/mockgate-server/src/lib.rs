pub mod api;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod handlers;
pub mod hub;
pub mod server;
pub mod watcher;

pub use coordinator::{CoordinatorConfig, CoordinatorSnapshot, RequestCoordinator, ResolutionOutcome};
pub use hub::BroadcastHub;
pub use server::{build_router, start, AppState, ServerConfig, ServerDeps, ServerHandle};
