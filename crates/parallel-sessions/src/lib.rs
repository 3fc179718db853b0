// parallel-sessions/crates/parallel-sessions/src/lib.rs

pub mod config;
pub mod error;
pub mod events;
pub mod memory_db;
pub mod metrics;
pub mod promotion;
pub mod sessions;
pub mod telemetry;
pub mod work_queue;

// Public API exports
pub use config::ParallelSessionsConfig;
pub use error::{Error, Result};
pub use events::{EventBus, HibernateReason, SessionEvent};
pub use memory_db::{BackendConfig, SharedMemoryBackend};
pub use sessions::{
    IsolationMode, ManagerStats, ParallelSessionManager, SaveMemoryParams, SessionHandle,
    SessionRequest,
};
pub use work_queue::{ScheduleWorkParams, WorkQueue};
