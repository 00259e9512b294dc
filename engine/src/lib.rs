pub mod backend;
pub mod config;
pub mod store;
pub mod sync;
pub mod timer;

pub use backend::{
    AiRegenerate, AiStreamStop, BackendError, BackendEvent, ImBackend, LoopbackBackend,
};
pub use config::EngineConfig;
pub use sync::{
    CacheEvent, CachedMessage, EngineError, EngineResult, HistoryRequest, MessageSyncEngine,
    SendRequest,
};

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
