//! Request/response types shared by the controller and the HTTP layer.

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::{HostdError, Result, API_VERSION, DEFAULT_PROJECT};

/// Resource category -> URLs touched by an operation.
pub type Resources = BTreeMap<String, Vec<String>>;

pub const RESOURCE_INSTANCES: &str = "instances";
pub const RESOURCE_INSTANCE_SNAPSHOTS: &str = "instances_snapshots";

/// Bytes escaped inside one path segment: everything except unreserved
/// characters and the sub-delimiters a segment may carry verbatim.
const SEGMENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b':')
    .remove(b'=')
    .remove(b'@');

/// Percent-encode one URL path segment.
pub fn escape_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT_SET).to_string()
}

/// Build `/<api-version>/<segment>/...` with every segment escaped.
pub fn api_path(segments: &[&str]) -> String {
    let mut path = format!("/{API_VERSION}");
    for segment in segments {
        path.push('/');
        path.push_str(&escape_segment(segment));
    }
    path
}

pub fn instance_url(name: &str) -> String {
    api_path(&["instances", name])
}

pub fn snapshot_url(parent: &str, leaf: &str) -> String {
    api_path(&["instances", parent, "snapshots", leaf])
}

pub fn operation_url(id: &str) -> String {
    api_path(&["operations", id])
}

/// Append the project query parameter for non-default projects.
pub fn with_project(url: String, project: &str) -> String {
    if project == DEFAULT_PROJECT {
        url
    } else {
        let project: String = url::form_urlencoded::byte_serialize(project.as_bytes()).collect();
        format!("{url}?project={project}")
    }
}

/// Resource tags for any operation acting on one snapshot.
pub fn snapshot_resources(parent: &str, leaf: &str) -> Resources {
    let mut resources = Resources::new();
    resources.insert(RESOURCE_INSTANCES.to_string(), vec![instance_url(parent)]);
    resources.insert(
        RESOURCE_INSTANCE_SNAPSHOTS.to_string(),
        vec![snapshot_url(parent, leaf)],
    );
    resources
}

/// Decode a request body, treating an empty body as `{}`.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let body = if body.iter().all(u8::is_ascii_whitespace) {
        b"{}".as_slice()
    } else {
        body
    };
    serde_json::from_slice(body).map_err(|e| HostdError::bad_request(e.to_string()))
}

/// Body of `POST /1.0/instances/{name}/snapshots`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotsPost {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stateful: bool,
}

/// Body of `PUT`/`PATCH /1.0/instances/{name}/snapshots/{snapshot}`.
///
/// `expires_at` being `None` means the client did not ask for a change.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotPut {
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Body of `POST /1.0/instances/{name}/snapshots/{snapshot}`: rename, or
/// migrate when `migration` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotPost {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub migration: bool,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub target: Option<MigrationTarget>,
}

/// Push-mode destination: the target server's operation plus the secrets it
/// issued for each channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTarget {
    #[serde(default)]
    pub certificate: String,
    pub operation: String,
    #[serde(default, alias = "websockets")]
    pub secrets: HashMap<String, String>,
}

/// Rendered snapshot as returned by GET and recursive listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub architecture: String,
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
    pub ephemeral: bool,
    pub profiles: Vec<String>,
    pub description: String,
    pub stateful: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}
