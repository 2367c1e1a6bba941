//! Snapshot lifecycle and migration on top of an [`InstanceStore`].

pub mod controller;
pub mod migration;
pub mod store;
pub mod transport;

pub use controller::{snapshot_etag, RequestContext, SnapshotController, SnapshotListing};
pub use migration::{negotiate, Direction, MigrationPlan, MigrationSource};
pub use store::{InMemoryStore, InstanceArgs, InstanceRecord, InstanceStore, InstanceType};
pub use transport::{
    JsonTransport, MigrationTransport, PullChannels, TransferAck, TransferEnvelope, SECRET_HEADER,
};

pub use hostd_common::{HostdError, Result};
