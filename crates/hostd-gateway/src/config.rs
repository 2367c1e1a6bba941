use hostd_operations::RegistryConfig;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {var} entry '{entry}', expected project/instance=address")]
    InvalidPlacement { var: &'static str, entry: String },

    #[error("Invalid {var} entry '{entry}', expected project/instance")]
    InvalidInstance { var: &'static str, entry: String },
}

/// Where an instance lives, as configured for the static directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub project: String,
    pub instance: String,
    pub address: String,
}

/// Gateway configuration, read from `HOSTD_*` environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub node_name: String,
    pub advertise_address: String,
    pub operation_retention: Duration,
    pub prune_interval: Duration,
    pub websocket_connect_timeout: Duration,
    pub cluster_members: Vec<Placement>,
    /// `(project, instance)` pairs created in the in-memory store at boot.
    pub seed_instances: Vec<(String, String)>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8443,
            node_name: "local".to_string(),
            advertise_address: "http://127.0.0.1:8443".to_string(),
            operation_retention: Duration::from_secs(300),
            prune_interval: Duration::from_secs(60),
            websocket_connect_timeout: Duration::from_secs(30),
            cluster_members: Vec::new(),
            seed_instances: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source; unset or unparsable numbers
    /// fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        Ok(Self {
            host: lookup("HOSTD_HOST").unwrap_or(defaults.host),
            port: lookup("HOSTD_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(defaults.port),
            node_name: lookup("HOSTD_NODE_NAME").unwrap_or(defaults.node_name),
            advertise_address: lookup("HOSTD_ADVERTISE_ADDRESS")
                .unwrap_or(defaults.advertise_address),
            operation_retention: secs(
                "HOSTD_OPERATION_RETENTION_SECS",
                defaults.operation_retention,
            ),
            prune_interval: secs("HOSTD_PRUNE_INTERVAL_SECS", defaults.prune_interval),
            websocket_connect_timeout: secs(
                "HOSTD_WEBSOCKET_CONNECT_TIMEOUT_SECS",
                defaults.websocket_connect_timeout,
            ),
            cluster_members: parse_placements(
                "HOSTD_CLUSTER_MEMBERS",
                &lookup("HOSTD_CLUSTER_MEMBERS").unwrap_or_default(),
            )?,
            seed_instances: parse_instances(
                "HOSTD_INSTANCES",
                &lookup("HOSTD_INSTANCES").unwrap_or_default(),
            )?,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            location: self.node_name.clone(),
            retention: self.operation_retention,
            connect_timeout: self.websocket_connect_timeout,
        }
    }
}

fn entries(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|e| !e.is_empty())
}

fn split_instance(entry: &str) -> Option<(String, String)> {
    let (project, instance) = entry.split_once('/')?;
    if project.is_empty() || instance.is_empty() || instance.contains('/') {
        return None;
    }
    Some((project.to_string(), instance.to_string()))
}

fn parse_placements(var: &'static str, value: &str) -> Result<Vec<Placement>, ConfigError> {
    entries(value)
        .map(|entry| {
            let invalid = || ConfigError::InvalidPlacement {
                var,
                entry: entry.to_string(),
            };
            let (target, address) = entry.split_once('=').ok_or_else(invalid)?;
            let (project, instance) = split_instance(target.trim()).ok_or_else(invalid)?;
            let address = address.trim();
            if address.is_empty() {
                return Err(invalid());
            }
            Ok(Placement {
                project,
                instance,
                address: address.to_string(),
            })
        })
        .collect()
}

fn parse_instances(var: &'static str, value: &str) -> Result<Vec<(String, String)>, ConfigError> {
    entries(value)
        .map(|entry| {
            split_instance(entry).ok_or_else(|| ConfigError::InvalidInstance {
                var,
                entry: entry.to_string(),
            })
        })
        .collect()
}
