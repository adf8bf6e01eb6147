pub mod blob;
pub mod clock;
pub mod engine;
pub mod gate;
pub mod handlers;
pub mod server;
pub mod stats;
pub mod store;
pub mod sweeper;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<engine::Lifecycle>,
    /// Local blob directory; also signs and checks blob URLs.
    pub blobs: Arc<blob::LocalBlobStore>,
}

pub use engine::{Lifecycle, LifecycleConfig, LifecycleError};
pub use server::{open_services, resolve_data_dir, run, ServerConfig, Services};
pub use sweeper::{SweepReport, Sweeper};
