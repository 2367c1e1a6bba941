//! Tracked background operations.
//!
//! A request handler validates its input, builds an [`OperationHandler`] that
//! performs the actual mutation, and hands it to the [`OperationRegistry`].
//! The registry returns immediately with a `Pending` operation and drives the
//! handler on its own tokio task.

mod channel;
mod operation;
mod registry;

pub use channel::{Channel, CHANNEL_BUFFER_SIZE};
pub use operation::{
    handler_fn, Connector, NewOperation, Operation, OperationClass, OperationContext,
    OperationHandler, OperationKind, OperationStatus, OperationType, OperationView,
};
pub use registry::{OperationRegistry, RegistryConfig};

pub use hostd_common::{HostdError, Result};
