use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostd_common::api::{
    decode_body, snapshot_resources, snapshot_url, with_project, InstanceSnapshot, SnapshotPost,
    SnapshotPut, SnapshotsPost,
};
use hostd_common::etag::{check_if_match, etag_hash};
use hostd_common::expiry::{default_snapshot_expiry, PATTERN_KEY};
use hostd_common::names::{
    next_snapshot_name, snapshot_full_name, validate_instance_name, validate_url_segment,
    DEFAULT_SNAPSHOT_PATTERN,
};
use hostd_common::{HostdError, Result};
use hostd_operations::{
    NewOperation, Operation, OperationContext, OperationHandler, OperationRegistry, OperationType,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::migration::negotiate;
use crate::store::{InstanceArgs, InstanceRecord, InstanceStore};
use crate::transport::MigrationTransport;

/// Who is asking, and on behalf of which project.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub project: String,
    pub requestor: Option<String>,
}

impl RequestContext {
    pub fn new(project: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            requestor: None,
        }
    }

    pub fn with_requestor(mut self, requestor: impl Into<String>) -> Self {
        self.requestor = Some(requestor.into());
        self
    }

    fn attach(&self, op: NewOperation) -> NewOperation {
        match &self.requestor {
            Some(requestor) => op.with_requestor(requestor.clone()),
            None => op,
        }
    }
}

/// Result of listing an instance's snapshots.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum SnapshotListing {
    Urls(Vec<String>),
    Full(Vec<InstanceSnapshot>),
}

/// ETag of a snapshot: covers the expiry only, the one mutable field.
pub fn snapshot_etag(record: &InstanceRecord) -> Result<String> {
    etag_hash(&[record.expires_at])
}

enum SnapshotMutation {
    Create {
        instance: String,
        name: String,
        expires_at: Option<DateTime<Utc>>,
        stateful: bool,
    },
    Rename {
        parent: String,
        from: String,
        to: String,
    },
    Delete {
        name: String,
    },
    /// `None` means nothing to change.
    Update {
        name: String,
        args: Option<InstanceArgs>,
    },
}

struct SnapshotTask {
    store: Arc<dyn InstanceStore>,
    project: String,
    mutation: SnapshotMutation,
}

#[async_trait]
impl OperationHandler for SnapshotTask {
    async fn run(&self, _ctx: &OperationContext) -> Result<()> {
        let project = self.project.as_str();
        match &self.mutation {
            SnapshotMutation::Create {
                instance,
                name,
                expires_at,
                stateful,
            } => {
                let record = self
                    .store
                    .create_snapshot(project, instance, name, *expires_at, *stateful)
                    .await?;
                info!("Created snapshot {}", record.name);
            }
            SnapshotMutation::Rename { parent, from, to } => {
                let from_full = snapshot_full_name(parent, from);
                let to_full = snapshot_full_name(parent, to);
                if self.store.exists(project, &to_full).await? {
                    return Err(HostdError::Conflict(format!(
                        "Name '{to_full}' already in use"
                    )));
                }
                self.store
                    .rename_instance(project, &from_full, &to_full)
                    .await?;
                info!("Renamed snapshot {} to {}", from_full, to_full);
            }
            SnapshotMutation::Delete { name } => {
                self.store.delete_instance(project, name).await?;
                info!("Deleted snapshot {}", name);
            }
            SnapshotMutation::Update { name, args } => match args {
                Some(args) => {
                    self.store
                        .update_instance(project, name, args.clone(), false)
                        .await?;
                    debug!("Updated snapshot {}", name);
                }
                None => debug!("Nothing to update on snapshot {}", name),
            },
        }
        Ok(())
    }
}

/// Validates snapshot requests and turns them into operations.
pub struct SnapshotController {
    store: Arc<dyn InstanceStore>,
    registry: Arc<OperationRegistry>,
    transport: Arc<dyn MigrationTransport>,
}

impl SnapshotController {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        registry: Arc<OperationRegistry>,
        transport: Arc<dyn MigrationTransport>,
    ) -> Self {
        Self {
            store,
            registry,
            transport,
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    fn submit(
        &self,
        ctx: &RequestContext,
        op_type: OperationType,
        resources: hostd_common::api::Resources,
        mutation: SnapshotMutation,
    ) -> Result<Arc<Operation>> {
        let task = SnapshotTask {
            store: self.store.clone(),
            project: ctx.project.clone(),
            mutation,
        };
        self.registry.create(ctx.attach(NewOperation::task(
            ctx.project.as_str(),
            op_type,
            resources,
            Arc::new(task),
        )))
    }

    async fn load_snapshot(
        &self,
        ctx: &RequestContext,
        instance: &str,
        snapshot: &str,
    ) -> Result<InstanceRecord> {
        validate_instance_name(instance)?;
        self.store
            .load(&ctx.project, &snapshot_full_name(instance, snapshot))
            .await
    }

    /// Snapshot URLs, or rendered snapshots when `recursive`.
    ///
    /// Snapshots that fail to load or render are left out.
    #[instrument(skip(self, ctx), fields(project = %ctx.project))]
    pub async fn list(
        &self,
        ctx: &RequestContext,
        instance: &str,
        recursive: bool,
    ) -> Result<SnapshotListing> {
        validate_instance_name(instance)?;
        self.store.load(&ctx.project, instance).await?;
        let names = self.store.snapshot_names(&ctx.project, instance).await?;

        if !recursive {
            let urls = names
                .iter()
                .map(|leaf| with_project(snapshot_url(instance, leaf), &ctx.project))
                .collect();
            return Ok(SnapshotListing::Urls(urls));
        }

        let mut snapshots = Vec::with_capacity(names.len());
        for leaf in &names {
            let full = snapshot_full_name(instance, leaf);
            let rendered = match self.store.load(&ctx.project, &full).await {
                Ok(record) => record.render(),
                Err(e) => Err(e),
            };
            match rendered {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!("Skipping snapshot {}: {}", full, e),
            }
        }
        Ok(SnapshotListing::Full(snapshots))
    }

    /// Rendered snapshot plus its ETag.
    #[instrument(skip(self, ctx), fields(project = %ctx.project))]
    pub async fn get(
        &self,
        ctx: &RequestContext,
        instance: &str,
        snapshot: &str,
    ) -> Result<(InstanceSnapshot, String)> {
        let record = self.load_snapshot(ctx, instance, snapshot).await?;
        Ok((record.render()?, snapshot_etag(&record)?))
    }

    #[instrument(skip(self, ctx, req), fields(project = %ctx.project))]
    pub async fn create(
        &self,
        ctx: &RequestContext,
        instance: &str,
        req: SnapshotsPost,
    ) -> Result<Arc<Operation>> {
        validate_instance_name(instance)?;
        let parent = self.store.load(&ctx.project, instance).await?;

        let name = if req.name.is_empty() {
            let pattern = parent
                .expanded_config
                .get(PATTERN_KEY)
                .filter(|p| !p.is_empty())
                .map(String::as_str)
                .unwrap_or(DEFAULT_SNAPSHOT_PATTERN);
            let existing = self.store.snapshot_names(&ctx.project, instance).await?;
            next_snapshot_name(pattern, &existing)?
        } else {
            req.name
        };
        validate_url_segment(&name)?;

        let expires_at = match req.expires_at {
            Some(expiry) => Some(expiry),
            None => default_snapshot_expiry(&parent.expanded_config, Utc::now()).unwrap_or_else(
                |e| {
                    warn!("Ignoring invalid snapshot expiry policy on {}: {}", instance, e);
                    None
                },
            ),
        };

        let resources = snapshot_resources(instance, &name);
        self.submit(
            ctx,
            OperationType::SnapshotCreate,
            resources,
            SnapshotMutation::Create {
                instance: instance.to_string(),
                name,
                expires_at,
                stateful: req.stateful,
            },
        )
    }

    /// PUT and PATCH. The `If-Match` precondition is checked before the body
    /// is decoded.
    #[instrument(skip(self, ctx, if_match, body), fields(project = %ctx.project))]
    pub async fn update(
        &self,
        ctx: &RequestContext,
        instance: &str,
        snapshot: &str,
        if_match: Option<&str>,
        body: &[u8],
    ) -> Result<Arc<Operation>> {
        let record = self.load_snapshot(ctx, instance, snapshot).await?;
        check_if_match(if_match, &[record.expires_at])?;

        let req: SnapshotPut = decode_body(body)?;
        let args = req.expires_at.map(|expiry| InstanceArgs {
            expires_at: Some(expiry),
            ..record.args()
        });

        self.submit(
            ctx,
            OperationType::SnapshotUpdate,
            snapshot_resources(instance, snapshot),
            SnapshotMutation::Update {
                name: record.name,
                args,
            },
        )
    }

    /// Rename, or migrate when the body asks for it.
    #[instrument(skip(self, ctx, req), fields(project = %ctx.project))]
    pub async fn post(
        &self,
        ctx: &RequestContext,
        instance: &str,
        snapshot: &str,
        req: SnapshotPost,
    ) -> Result<Arc<Operation>> {
        let record = self.load_snapshot(ctx, instance, snapshot).await?;

        if req.migration {
            let plan = negotiate(
                record,
                req.live,
                true,
                &req.name,
                req.target,
                self.transport.clone(),
            )?;
            return self
                .registry
                .create(ctx.attach(plan.into_operation(&ctx.project)));
        }

        if req.name.is_empty() {
            return Err(HostdError::bad_request(
                "A new name for the snapshot must be provided",
            ));
        }
        validate_url_segment(&req.name)?;

        let target = snapshot_full_name(instance, &req.name);
        if self.store.exists(&ctx.project, &target).await? {
            return Err(HostdError::Conflict(format!(
                "Name '{target}' already in use"
            )));
        }

        self.submit(
            ctx,
            OperationType::SnapshotRename,
            snapshot_resources(instance, snapshot),
            SnapshotMutation::Rename {
                parent: instance.to_string(),
                from: snapshot.to_string(),
                to: req.name,
            },
        )
    }

    #[instrument(skip(self, ctx), fields(project = %ctx.project))]
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        instance: &str,
        snapshot: &str,
    ) -> Result<Arc<Operation>> {
        let record = self.load_snapshot(ctx, instance, snapshot).await?;
        self.submit(
            ctx,
            OperationType::SnapshotDelete,
            snapshot_resources(instance, snapshot),
            SnapshotMutation::Delete { name: record.name },
        )
    }
}
