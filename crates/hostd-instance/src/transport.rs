use async_trait::async_trait;
use hostd_common::api::{InstanceSnapshot, MigrationTarget};
use hostd_common::{HostdError, Result};
use hostd_operations::Channel;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::InstanceArgs;

/// Header sent to the receiving side ahead of any data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferEnvelope {
    /// Full `parent/leaf` name on the source.
    pub name: String,
    pub args: InstanceArgs,
    pub snapshot: InstanceSnapshot,
    pub live: bool,
    pub snapshot_only: bool,
}

/// Reply read back on the control channel once the peer has the data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferAck {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

/// Channels bound by the peers of a pull session.
#[derive(Debug)]
pub struct PullChannels {
    pub control: Channel,
    pub fs: Channel,
    /// Present only for live transfers.
    pub state: Option<Channel>,
}

/// Wire format of a snapshot transfer. Returns the number of bytes sent.
#[async_trait]
pub trait MigrationTransport: Send + Sync {
    /// Dial `target` and send the snapshot to it.
    async fn push(&self, envelope: &TransferEnvelope, target: &MigrationTarget) -> Result<u64>;

    /// Stream the snapshot to peers that connected to a pull session.
    async fn stream(&self, envelope: &TransferEnvelope, channels: PullChannels) -> Result<u64>;
}

/// Header name carrying the control secret on push requests.
pub const SECRET_HEADER: &str = "X-Hostd-Secret";

/// Reference transport framing everything as JSON.
#[derive(Clone, Default)]
pub struct JsonTransport {
    client: reqwest::Client,
}

impl JsonTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MigrationTransport for JsonTransport {
    async fn push(&self, envelope: &TransferEnvelope, target: &MigrationTarget) -> Result<u64> {
        let secret = target
            .secrets
            .get("control")
            .ok_or_else(|| HostdError::bad_request("Migration target is missing a control secret"))?;
        let body = serde_json::to_vec(envelope)?;
        let size = body.len() as u64;

        info!("Pushing snapshot {} to {}", envelope.name, target.operation);
        let response = self
            .client
            .post(&target.operation)
            .header(SECRET_HEADER, secret)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                HostdError::internal(format!(
                    "Failed to reach migration target {}: {}",
                    target.operation, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HostdError::internal(format!(
                "Migration target rejected transfer ({status}): {text}"
            )));
        }

        Ok(size)
    }

    async fn stream(&self, envelope: &TransferEnvelope, channels: PullChannels) -> Result<u64> {
        let PullChannels {
            mut control,
            fs,
            state,
        } = channels;

        let header = serde_json::to_vec(envelope)?;
        let payload = serde_json::to_vec(&envelope.snapshot)?;
        let mut sent = (header.len() + payload.len()) as u64;

        control.send(header).await?;
        fs.send(payload).await?;
        if let Some(state) = &state {
            let checkpoint = serde_json::to_vec(&serde_json::json!({ "stateful": envelope.args.stateful }))?;
            sent += checkpoint.len() as u64;
            state.send(checkpoint).await?;
        }
        debug!("Sent {} bytes for {}, waiting for ack", sent, envelope.name);

        let reply = control
            .recv()
            .await
            .ok_or_else(|| HostdError::internal("Migration peer closed the control channel"))?;
        let ack: TransferAck = serde_json::from_slice(&reply)
            .map_err(|e| HostdError::internal(format!("Invalid migration ack: {e}")))?;
        if !ack.success {
            return Err(HostdError::internal(format!(
                "Migration peer failed: {}",
                ack.message
            )));
        }

        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InstanceRecord;

    fn envelope() -> TransferEnvelope {
        let record = InstanceRecord::new("default", "c1/snap0");
        TransferEnvelope {
            name: record.name.clone(),
            args: record.args(),
            snapshot: record.render().unwrap(),
            live: false,
            snapshot_only: true,
        }
    }

    #[tokio::test]
    async fn test_stream_waits_for_ack() {
        let (control, mut peer_control) = Channel::pair();
        let (fs, mut peer_fs) = Channel::pair();

        let peer = tokio::spawn(async move {
            let header = peer_control.recv().await.unwrap();
            let received: TransferEnvelope = serde_json::from_slice(&header).unwrap();
            let data = peer_fs.recv().await.unwrap();
            let snapshot: InstanceSnapshot = serde_json::from_slice(&data).unwrap();
            let ack = TransferAck {
                success: true,
                message: String::new(),
            };
            peer_control
                .send(serde_json::to_vec(&ack).unwrap())
                .await
                .unwrap();
            (received, snapshot)
        });

        let sent = JsonTransport::new()
            .stream(
                &envelope(),
                PullChannels {
                    control,
                    fs,
                    state: None,
                },
            )
            .await
            .unwrap();
        assert!(sent > 0);

        let (received, snapshot) = peer.await.unwrap();
        assert_eq!(received, envelope());
        assert_eq!(snapshot.name, "snap0");
    }

    #[tokio::test]
    async fn test_stream_fails_on_negative_ack() {
        let (control, mut peer_control) = Channel::pair();
        let (fs, _peer_fs) = Channel::pair();

        tokio::spawn(async move {
            peer_control.recv().await;
            let ack = TransferAck {
                success: false,
                message: "disk full".to_string(),
            };
            let _ = peer_control.send(serde_json::to_vec(&ack).unwrap()).await;
        });

        let err = JsonTransport::new()
            .stream(
                &envelope(),
                PullChannels {
                    control,
                    fs,
                    state: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Internal Error: Migration peer failed: disk full");
    }

    #[tokio::test]
    async fn test_push_requires_control_secret() {
        let target = MigrationTarget {
            operation: "http://127.0.0.1:1/1.0/operations/x".to_string(),
            ..Default::default()
        };
        let err = JsonTransport::new().push(&envelope(), &target).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
