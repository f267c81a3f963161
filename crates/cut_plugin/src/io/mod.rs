//! Line-based run input formats: the model resource list and recorded
//! camera sessions.

pub mod resource;
pub mod session;

pub use resource::{ModelEntry, ResourceError, ResourceList};
pub use session::{load_session, next_session_path, parse_session, SessionError, SessionRecorder};
