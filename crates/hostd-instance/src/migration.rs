//! Snapshot migration sessions.
//!
//! [`negotiate`] checks the request and builds a [`MigrationSource`]. A
//! source with a target pushes to it from a Task operation. Without a target
//! the source issues one secret per channel and waits, as a Websocket
//! operation, for a remote puller to connect all of them.

use async_trait::async_trait;
use hostd_common::api::{snapshot_resources, MigrationTarget, Resources};
use hostd_common::names::split_snapshot_name;
use hostd_common::{HostdError, Result};
use hostd_operations::{
    Channel, Connector, NewOperation, OperationContext, OperationHandler, OperationType,
};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, instrument};

use crate::store::InstanceRecord;
use crate::transport::{MigrationTransport, PullChannels, TransferEnvelope};

pub const CONTROL_CHANNEL: &str = "control";
pub const FS_CHANNEL: &str = "fs";
pub const STATE_CHANNEL: &str = "state";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Direction {
    Push(MigrationTarget),
    Pull,
}

/// 32 random bytes, hex encoded.
fn generate_secret() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

struct Slot {
    secret: String,
    channel: Option<Channel>,
    used: bool,
}

#[derive(Default)]
struct PullState {
    slots: BTreeMap<&'static str, Slot>,
    cancelled: bool,
}

/// Source side of one snapshot transfer.
pub struct MigrationSource {
    snapshot: InstanceRecord,
    live: bool,
    snapshot_only: bool,
    direction: Direction,
    transport: Arc<dyn MigrationTransport>,
    secrets: BTreeMap<&'static str, String>,
    state: Mutex<PullState>,
    all_connected: watch::Sender<bool>,
    streaming: AtomicBool,
}

impl MigrationSource {
    fn new(
        snapshot: InstanceRecord,
        live: bool,
        snapshot_only: bool,
        direction: Direction,
        transport: Arc<dyn MigrationTransport>,
    ) -> Self {
        let mut state = PullState::default();
        let mut secrets = BTreeMap::new();

        if direction == Direction::Pull {
            let mut channels = vec![CONTROL_CHANNEL, FS_CHANNEL];
            if live {
                channels.push(STATE_CHANNEL);
            }
            for name in channels {
                let secret = generate_secret();
                secrets.insert(name, secret.clone());
                state.slots.insert(
                    name,
                    Slot {
                        secret,
                        channel: None,
                        used: false,
                    },
                );
            }
        }

        let (all_connected, _) = watch::channel(false);
        Self {
            snapshot,
            live,
            snapshot_only,
            direction,
            transport,
            secrets,
            state: Mutex::new(state),
            all_connected,
            streaming: AtomicBool::new(false),
        }
    }

    pub fn direction(&self) -> &Direction {
        &self.direction
    }

    pub fn live(&self) -> bool {
        self.live
    }

    /// Channel name -> secret. Empty for push sessions.
    pub fn secrets(&self) -> HashMap<String, String> {
        self.secrets
            .iter()
            .map(|(name, secret)| (name.to_string(), secret.clone()))
            .collect()
    }

    fn metadata(&self, progress: Option<u64>) -> serde_json::Value {
        let mut metadata = serde_json::Map::new();
        for (name, secret) in &self.secrets {
            metadata.insert(name.to_string(), serde_json::Value::String(secret.clone()));
        }
        if let Some(sent) = progress {
            metadata.insert("fs_progress".to_string(), serde_json::json!(format!("{sent} B")));
        }
        serde_json::Value::Object(metadata)
    }

    fn envelope(&self) -> Result<TransferEnvelope> {
        Ok(TransferEnvelope {
            name: self.snapshot.name.clone(),
            args: self.snapshot.args(),
            snapshot: self.snapshot.render()?,
            live: self.live,
            snapshot_only: self.snapshot_only,
        })
    }

    async fn take_channels(&self) -> Result<PullChannels> {
        let mut state = self.state.lock().await;
        if state.cancelled {
            return Err(HostdError::internal("Migration was cancelled"));
        }
        self.streaming.store(true, Ordering::SeqCst);

        let mut take = |name: &str| {
            state
                .slots
                .get_mut(name)
                .and_then(|slot| slot.channel.take())
                .ok_or_else(|| HostdError::internal(format!("Missing {name} websocket")))
        };
        let control = take(CONTROL_CHANNEL)?;
        let fs = take(FS_CHANNEL)?;
        let state_channel = if self.live {
            Some(take(STATE_CHANNEL)?)
        } else {
            None
        };

        Ok(PullChannels {
            control,
            fs,
            state: state_channel,
        })
    }
}

#[async_trait]
impl OperationHandler for MigrationSource {
    #[instrument(skip_all, fields(snapshot = %self.snapshot.name))]
    async fn run(&self, ctx: &OperationContext) -> Result<()> {
        let envelope = self.envelope()?;

        let sent = match &self.direction {
            Direction::Push(target) => {
                self.streaming.store(true, Ordering::SeqCst);
                self.transport.push(&envelope, target).await?
            }
            Direction::Pull => {
                let channels = self.take_channels().await?;
                self.transport.stream(&envelope, channels).await?
            }
        };

        ctx.set_metadata(self.metadata(Some(sent)));
        info!("Transferred {} bytes", sent);
        Ok(())
    }

    fn may_cancel(&self) -> bool {
        self.direction == Direction::Pull && !self.streaming.load(Ordering::SeqCst)
    }

    async fn cancel(&self) -> Result<()> {
        if self.direction != Direction::Pull {
            return Err(HostdError::bad_request("This operation can't be cancelled"));
        }

        let mut state = self.state.lock().await;
        if self.streaming.load(Ordering::SeqCst) {
            return Err(HostdError::bad_request(
                "Migration is already streaming and can't be cancelled",
            ));
        }
        state.cancelled = true;
        for slot in state.slots.values_mut() {
            // Dropping our end closes the peer's websocket.
            slot.channel = None;
        }
        debug!("Migration of {} cancelled", self.snapshot.name);
        Ok(())
    }
}

#[async_trait]
impl Connector for MigrationSource {
    async fn connect(&self, secret: &str, channel: Channel) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.cancelled {
            return Err(HostdError::bad_request("Migration was cancelled"));
        }

        let slot = state
            .slots
            .values_mut()
            .find(|slot| slot.secret == secret)
            .ok_or_else(|| HostdError::Forbidden("Invalid websocket secret".to_string()))?;
        if slot.used {
            return Err(HostdError::Conflict(
                "Websocket secret already used".to_string(),
            ));
        }
        slot.used = true;
        slot.channel = Some(channel);

        if state.slots.values().all(|slot| slot.used) {
            self.all_connected.send_replace(true);
        }
        Ok(())
    }

    async fn connected(&self) {
        let mut rx = self.all_connected.subscribe();
        let _ = rx.wait_for(|ready| *ready).await.map(|_| ());
    }
}

/// A negotiated session plus its resource tags.
pub struct MigrationPlan {
    pub source: Arc<MigrationSource>,
    pub resources: Resources,
}

impl MigrationPlan {
    /// Operation wrapping this session: Task for push, Websocket for pull.
    pub fn into_operation(self, project: &str) -> NewOperation {
        if matches!(self.source.direction(), Direction::Push(_)) {
            NewOperation::task(
                project,
                OperationType::SnapshotTransfer,
                self.resources,
                self.source,
            )
        } else {
            NewOperation::websocket(
                project,
                OperationType::SnapshotTransfer,
                self.resources,
                self.source.metadata(None),
                self.source.clone(),
                self.source,
            )
        }
    }
}

/// Prepare the transfer of `snapshot`.
///
/// A live transfer cannot rename: `requested_name` must equal the snapshot's
/// parent name.
pub fn negotiate(
    snapshot: InstanceRecord,
    live: bool,
    snapshot_only: bool,
    requested_name: &str,
    target: Option<MigrationTarget>,
    transport: Arc<dyn MigrationTransport>,
) -> Result<MigrationPlan> {
    let (parent, leaf) = match split_snapshot_name(&snapshot.name) {
        (parent, Some(leaf)) => (parent.to_string(), leaf.to_string()),
        (_, None) => {
            return Err(HostdError::bad_request(format!(
                "Instance '{}' is not a snapshot",
                snapshot.name
            )))
        }
    };

    if live && parent != requested_name {
        return Err(HostdError::bad_request(
            "Instance name cannot be changed during stateful copy",
        ));
    }

    let direction = match target {
        Some(target) => Direction::Push(target),
        None => Direction::Pull,
    };
    let source = MigrationSource::new(snapshot, live, snapshot_only, direction, transport);

    Ok(MigrationPlan {
        source: Arc::new(source),
        resources: snapshot_resources(&parent, &leaf),
    })
}
