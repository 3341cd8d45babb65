//! Remote execution
//!
//! Transports that run scripts on hosts, the idempotency state store, and the
//! executor that ties them together.

pub mod executor;
pub mod state;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use executor::{ExecutionStatus, RemoteExecutor, StepOutcome};
pub use state::{AppliedRecord, FileStateStore, MemoryStateStore, StateStore, StepKey};
pub use transport::{
    CommandOutput, ConnectRetry, LocalTransport, RemoteTransport, RetryingTransport, SshTransport,
};
