pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{FailureKind, RelayError};
pub use types::{Command, CommandKind, CommandOrigin, Outcome, OutcomeStatus};
