use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostd_common::api::Resources;
use hostd_common::{HostdError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::Channel;

/// Operation flavor, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    /// Runs to completion and is polled for status.
    Task,
    /// Parks until peers connect with the issued secrets, then streams.
    Websocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    SnapshotCreate,
    SnapshotRename,
    SnapshotDelete,
    SnapshotUpdate,
    SnapshotTransfer,
}

impl OperationType {
    pub fn description(&self) -> &'static str {
        match self {
            OperationType::SnapshotCreate => "Snapshotting instance",
            OperationType::SnapshotRename => "Renaming snapshot",
            OperationType::SnapshotDelete => "Deleting snapshot",
            OperationType::SnapshotUpdate => "Updating snapshot",
            OperationType::SnapshotTransfer => "Transferring snapshot",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl OperationStatus {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OperationStatus::Success | OperationStatus::Failure | OperationStatus::Cancelled
        )
    }

    pub fn code(&self) -> u16 {
        match self {
            OperationStatus::Pending => 105,
            OperationStatus::Running => 103,
            OperationStatus::Success => 200,
            OperationStatus::Failure => 400,
            OperationStatus::Cancelled => 401,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The work behind an operation.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn run(&self, ctx: &OperationContext) -> Result<()>;

    /// Whether [`cancel`](OperationHandler::cancel) is supported.
    fn may_cancel(&self) -> bool {
        false
    }

    /// Release whatever the operation acquired so far. Never called once
    /// `run` has returned.
    async fn cancel(&self) -> Result<()> {
        Err(HostdError::bad_request("This operation can't be cancelled"))
    }
}

/// Peer side of a websocket operation.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Bind `channel` to the slot identified by `secret`.
    async fn connect(&self, secret: &str, channel: Channel) -> Result<()>;

    /// Resolves once every expected peer is connected.
    async fn connected(&self);
}

/// Class-specific parts of an operation.
#[derive(Clone)]
pub enum OperationKind {
    Task,
    Websocket(Arc<dyn Connector>),
}

impl OperationKind {
    pub fn class(&self) -> OperationClass {
        match self {
            OperationKind::Task => OperationClass::Task,
            OperationKind::Websocket(_) => OperationClass::Websocket,
        }
    }
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OperationKind::Task => "Task",
            OperationKind::Websocket(_) => "Websocket",
        })
    }
}

/// Everything the registry needs to create an operation.
pub struct NewOperation {
    pub project: String,
    pub op_type: OperationType,
    pub resources: Resources,
    pub metadata: Option<serde_json::Value>,
    pub handler: Arc<dyn OperationHandler>,
    pub kind: OperationKind,
    pub requestor: Option<String>,
}

impl NewOperation {
    pub fn task(
        project: impl Into<String>,
        op_type: OperationType,
        resources: Resources,
        handler: Arc<dyn OperationHandler>,
    ) -> Self {
        Self {
            project: project.into(),
            op_type,
            resources,
            metadata: None,
            handler,
            kind: OperationKind::Task,
            requestor: None,
        }
    }

    /// Websocket operations publish `metadata` (the connection secrets)
    /// before the handle is returned to the caller.
    pub fn websocket(
        project: impl Into<String>,
        op_type: OperationType,
        resources: Resources,
        metadata: serde_json::Value,
        handler: Arc<dyn OperationHandler>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            project: project.into(),
            op_type,
            resources,
            metadata: Some(metadata),
            handler,
            kind: OperationKind::Websocket(connector),
            requestor: None,
        }
    }

    pub fn with_requestor(mut self, requestor: impl Into<String>) -> Self {
        self.requestor = Some(requestor.into());
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct OperationState {
    pub(crate) status: OperationStatus,
    pub(crate) err: Option<String>,
    pub(crate) metadata: Option<serde_json::Value>,
    pub(crate) updated_at: DateTime<Utc>,
}

/// One tracked unit of background work.
pub struct Operation {
    id: Uuid,
    project: String,
    op_type: OperationType,
    resources: Resources,
    location: String,
    requestor: Option<String>,
    created_at: DateTime<Utc>,
    kind: OperationKind,
    handler: Arc<dyn OperationHandler>,
    state: watch::Sender<OperationState>,
}

impl Operation {
    pub(crate) fn new(new: NewOperation, location: &str) -> Self {
        let now = Utc::now();
        let (state, _) = watch::channel(OperationState {
            status: OperationStatus::Pending,
            err: None,
            metadata: new.metadata,
            updated_at: now,
        });

        Self {
            id: Uuid::new_v4(),
            project: new.project,
            op_type: new.op_type,
            resources: new.resources,
            location: location.to_string(),
            requestor: new.requestor,
            created_at: now,
            kind: new.kind,
            handler: new.handler,
            state,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    pub fn op_type(&self) -> OperationType {
        self.op_type
    }

    pub fn class(&self) -> OperationClass {
        self.kind.class()
    }

    pub fn kind(&self) -> &OperationKind {
        &self.kind
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn status(&self) -> OperationStatus {
        self.state.borrow().status
    }

    pub fn err(&self) -> Option<String> {
        self.state.borrow().err.clone()
    }

    pub fn metadata(&self) -> Option<serde_json::Value> {
        self.state.borrow().metadata.clone()
    }

    pub fn may_cancel(&self) -> bool {
        self.handler.may_cancel()
    }

    pub(crate) fn handler(&self) -> &Arc<dyn OperationHandler> {
        &self.handler
    }

    pub(crate) fn updated_at(&self) -> DateTime<Utc> {
        self.state.borrow().updated_at
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<OperationState> {
        self.state.subscribe()
    }

    /// Move to `status` unless a terminal status was already reached.
    pub(crate) fn transition(&self, status: OperationStatus, err: Option<String>) -> bool {
        self.state.send_if_modified(|state| {
            if state.status.is_final() {
                return false;
            }
            state.status = status;
            state.err = err;
            state.updated_at = Utc::now();
            true
        })
    }

    pub(crate) fn set_metadata(&self, metadata: serde_json::Value) {
        self.state.send_modify(|state| {
            state.metadata = Some(metadata);
            state.updated_at = Utc::now();
        });
    }

    /// The client-observable shape of this operation.
    pub fn view(&self) -> OperationView {
        let state = self.state.borrow().clone();
        OperationView {
            id: self.id.to_string(),
            class: self.class(),
            description: self.op_type.description().to_string(),
            created_at: self.created_at,
            updated_at: state.updated_at,
            status: state.status,
            status_code: state.status.code(),
            resources: self.resources.clone(),
            metadata: state.metadata,
            may_cancel: self.may_cancel() && !state.status.is_final(),
            err: state.err.unwrap_or_default(),
            location: self.location.clone(),
            project: self.project.clone(),
            requestor: self.requestor.clone(),
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("project", &self.project)
            .field("op_type", &self.op_type)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

/// Public response shape of an operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationView {
    pub id: String,
    pub class: OperationClass,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub status_code: u16,
    pub resources: Resources,
    pub metadata: Option<serde_json::Value>,
    pub may_cancel: bool,
    pub err: String,
    pub location: String,
    pub project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requestor: Option<String>,
}

/// Handed to [`OperationHandler::run`].
#[derive(Clone)]
pub struct OperationContext {
    op: Arc<Operation>,
}

impl OperationContext {
    pub(crate) fn new(op: Arc<Operation>) -> Self {
        Self { op }
    }

    pub fn id(&self) -> Uuid {
        self.op.id
    }

    pub fn project(&self) -> &str {
        &self.op.project
    }

    /// Replace the operation metadata, e.g. with progress information.
    pub fn set_metadata(&self, metadata: serde_json::Value) {
        self.op.set_metadata(metadata);
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn(OperationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn run(&self, ctx: &OperationContext) -> Result<()> {
        (self.0)(ctx.clone()).await
    }
}

/// Wrap an async closure as a non-cancellable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn OperationHandler>
where
    F: Fn(OperationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
