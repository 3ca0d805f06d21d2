pub mod rate_limit;
pub mod session_state;
pub mod validator;

pub use rate_limit::{ConnectionId, MessageKind, RateLimitError, RateLimiter, RejectionCounts};
pub use session_state::{AddTrackOutcome, SessionStateLoader, SessionStateStore, StoredSession};
pub use validator::{extract_session_id, truncate_payload, SignalingValidator, ValidationError};
