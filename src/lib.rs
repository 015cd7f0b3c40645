//! News ingest library
//!
//! Subscribes to a real-time news feed and stores every news item exactly
//! once in PostgreSQL. The binary in `main.rs` wires these modules together;
//! they are exposed here for integration tests.

pub mod config;
pub mod endpoints;
pub mod metrics;
pub mod probe;
pub mod session;
pub mod sink;
pub mod state;
pub mod streaming;
pub mod structured_logging;
pub mod supervisor;
pub mod types;
pub mod validator;

pub use config::Config;
pub use session::{EventOutcome, SessionEnd, SessionStats, SubscriptionSession};
pub use sink::{PersistError, PersistenceSink};
pub use state::{SessionState, StateHandle};
pub use supervisor::{ExitReason, Supervisor};
pub use types::{NewsEvent, RawMessage, SubscriptionScope};
