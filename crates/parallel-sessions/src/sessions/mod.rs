//! Session isolation, residency and briefings.

pub mod briefing;
pub mod isolation;
pub mod manager;
pub mod registry;

pub use briefing::render_briefing;
pub use isolation::{derive_session_key, IsolationMode, SessionRequest, DEFAULT_AGENT_ID};
pub use manager::{ManagerStats, ParallelSessionManager, SaveMemoryParams, SessionHandle};
pub use registry::ResidentSet;
