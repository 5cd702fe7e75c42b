//! Causeway - ordered event dispatch and reply correlation for CQRS/ES
//!
//! The infrastructure between a command handler and its callers:
//! - [`context`] tracks the aggregates one command execution touches
//! - [`dispatch`] applies event streams per aggregate in version order,
//!   exactly once, over an at-least-once transport
//! - [`correlator`] matches asynchronous replies to the callers awaiting them
//! - [`transport`] carries replies over TCP

pub mod config;
pub mod context;
pub mod correlator;
pub mod dispatch;
pub mod interfaces;
pub mod messages;
pub mod storage;
pub mod transport;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use context::{CommandContext, ContextError, ContextServices};
pub use correlator::{CommandService, CorrelatorError, ReplyCorrelator, ReplyInbox};
pub use dispatch::{EventStreamProcessor, ProcessingEventStream, ProcessingMessage};
