use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hostd_common::api::InstanceSnapshot;
use hostd_common::names::{snapshot_full_name, split_snapshot_name};
use hostd_common::{HostdError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    #[default]
    Container,
    VirtualMachine,
}

/// An instance or snapshot as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub project: String,
    pub name: String,
    pub instance_type: InstanceType,
    pub architecture: String,
    pub config: HashMap<String, String>,
    /// Local config merged with profile config.
    pub expanded_config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
    pub ephemeral: bool,
    pub profiles: Vec<String>,
    pub description: String,
    pub stateful: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            name: name.into(),
            instance_type: InstanceType::Container,
            architecture: "x86_64".to_string(),
            config: HashMap::new(),
            expanded_config: HashMap::new(),
            devices: HashMap::new(),
            ephemeral: false,
            profiles: vec!["default".to_string()],
            description: String::new(),
            stateful: false,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_expanded_config(mut self, key: &str, value: &str) -> Self {
        self.expanded_config.insert(key.to_string(), value.to_string());
        self
    }

    pub fn is_snapshot(&self) -> bool {
        split_snapshot_name(&self.name).1.is_some()
    }

    /// Parent instance name, which for a non-snapshot is the name itself.
    pub fn parent_name(&self) -> &str {
        split_snapshot_name(&self.name).0
    }

    /// The writable subset of this record.
    pub fn args(&self) -> InstanceArgs {
        InstanceArgs {
            project: self.project.clone(),
            instance_type: self.instance_type,
            architecture: self.architecture.clone(),
            config: self.config.clone(),
            devices: self.devices.clone(),
            ephemeral: self.ephemeral,
            profiles: self.profiles.clone(),
            description: self.description.clone(),
            snapshot: self.is_snapshot(),
            stateful: self.stateful,
            expires_at: self.expires_at,
        }
    }

    /// Client-facing view of a snapshot record.
    pub fn render(&self) -> Result<InstanceSnapshot> {
        let leaf = match split_snapshot_name(&self.name) {
            (_, Some(leaf)) => leaf,
            (_, None) => {
                return Err(HostdError::internal(format!(
                    "Instance '{}' is not a snapshot",
                    self.name
                )))
            }
        };

        Ok(InstanceSnapshot {
            name: leaf.to_string(),
            architecture: self.architecture.clone(),
            config: self.config.clone(),
            devices: self.devices.clone(),
            ephemeral: self.ephemeral,
            profiles: self.profiles.clone(),
            description: self.description.clone(),
            stateful: self.stateful,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

/// Arguments written back through [`InstanceStore::update_instance`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceArgs {
    pub project: String,
    pub instance_type: InstanceType,
    pub architecture: String,
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
    pub ephemeral: bool,
    pub profiles: Vec<String>,
    pub description: String,
    pub snapshot: bool,
    pub stateful: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Instance runtime and persistent store.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Load an instance or snapshot by full name. Missing -> `NotFound`.
    async fn load(&self, project: &str, name: &str) -> Result<InstanceRecord>;

    async fn exists(&self, project: &str, name: &str) -> Result<bool>;

    /// Leaf names of an instance's snapshots, oldest first.
    async fn snapshot_names(&self, project: &str, instance: &str) -> Result<Vec<String>>;

    /// Take a snapshot. A name already in use -> `Conflict`.
    async fn create_snapshot(
        &self,
        project: &str,
        instance: &str,
        leaf: &str,
        expires_at: Option<DateTime<Utc>>,
        stateful: bool,
    ) -> Result<InstanceRecord>;

    /// Rename by full name. A target name already in use -> `Conflict`.
    async fn rename_instance(&self, project: &str, name: &str, new_name: &str) -> Result<()>;

    async fn delete_instance(&self, project: &str, name: &str) -> Result<()>;

    /// Write back `args`. With `structural` unset only metadata-level fields
    /// are expected to change and no device reconfiguration happens.
    async fn update_instance(
        &self,
        project: &str,
        name: &str,
        args: InstanceArgs,
        structural: bool,
    ) -> Result<()>;
}

// In-memory store implementation for development/testing
#[derive(Clone, Default)]
pub struct InMemoryStore {
    instances: Arc<RwLock<HashMap<(String, String), InstanceRecord>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is.
    pub async fn insert(&self, record: InstanceRecord) {
        self.instances
            .write()
            .await
            .insert((record.project.clone(), record.name.clone()), record);
    }

    fn key(project: &str, name: &str) -> (String, String) {
        (project.to_string(), name.to_string())
    }

    fn not_found(name: &str) -> HostdError {
        HostdError::NotFound(format!("Instance '{name}' not found"))
    }

    fn in_use(name: &str) -> HostdError {
        HostdError::Conflict(format!("Name '{name}' already in use"))
    }
}

#[async_trait]
impl InstanceStore for InMemoryStore {
    async fn load(&self, project: &str, name: &str) -> Result<InstanceRecord> {
        self.instances
            .read()
            .await
            .get(&Self::key(project, name))
            .cloned()
            .ok_or_else(|| Self::not_found(name))
    }

    async fn exists(&self, project: &str, name: &str) -> Result<bool> {
        Ok(self
            .instances
            .read()
            .await
            .contains_key(&Self::key(project, name)))
    }

    async fn snapshot_names(&self, project: &str, instance: &str) -> Result<Vec<String>> {
        let instances = self.instances.read().await;
        let mut snapshots: Vec<&InstanceRecord> = instances
            .values()
            .filter(|record| record.project == project)
            .filter(|record| matches!(split_snapshot_name(&record.name), (parent, Some(_)) if parent == instance))
            .collect();
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));

        Ok(snapshots
            .into_iter()
            .filter_map(|record| split_snapshot_name(&record.name).1.map(str::to_string))
            .collect())
    }

    async fn create_snapshot(
        &self,
        project: &str,
        instance: &str,
        leaf: &str,
        expires_at: Option<DateTime<Utc>>,
        stateful: bool,
    ) -> Result<InstanceRecord> {
        let mut instances = self.instances.write().await;
        let parent = instances
            .get(&Self::key(project, instance))
            .cloned()
            .ok_or_else(|| Self::not_found(instance))?;

        let name = snapshot_full_name(instance, leaf);
        let key = Self::key(project, &name);
        if instances.contains_key(&key) {
            return Err(Self::in_use(&name));
        }

        let snapshot = InstanceRecord {
            name,
            stateful,
            created_at: Utc::now(),
            expires_at,
            ..parent
        };
        instances.insert(key, snapshot.clone());
        Ok(snapshot)
    }

    async fn rename_instance(&self, project: &str, name: &str, new_name: &str) -> Result<()> {
        let mut instances = self.instances.write().await;
        let new_key = Self::key(project, new_name);
        if instances.contains_key(&new_key) {
            return Err(Self::in_use(new_name));
        }

        let mut record = instances
            .remove(&Self::key(project, name))
            .ok_or_else(|| Self::not_found(name))?;
        record.name = new_name.to_string();
        instances.insert(new_key, record);
        Ok(())
    }

    async fn delete_instance(&self, project: &str, name: &str) -> Result<()> {
        let mut instances = self.instances.write().await;
        instances
            .remove(&Self::key(project, name))
            .ok_or_else(|| Self::not_found(name))?;

        // Snapshots go with their parent.
        instances.retain(|(p, n), _| {
            p != project || !matches!(split_snapshot_name(n), (parent, Some(_)) if parent == name)
        });
        Ok(())
    }

    async fn update_instance(
        &self,
        project: &str,
        name: &str,
        args: InstanceArgs,
        _structural: bool,
    ) -> Result<()> {
        let mut instances = self.instances.write().await;
        let record = instances
            .get_mut(&Self::key(project, name))
            .ok_or_else(|| Self::not_found(name))?;

        record.instance_type = args.instance_type;
        record.architecture = args.architecture;
        record.config = args.config;
        record.devices = args.devices;
        record.ephemeral = args.ephemeral;
        record.profiles = args.profiles;
        record.description = args.description;
        record.stateful = args.stateful;
        record.expires_at = args.expires_at;
        Ok(())
    }
}
