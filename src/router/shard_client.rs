//! Transport to the shard-local write executors

use crate::command::{ShardWriteReply, ShardWriteRequest};
use crate::common::{Error, Result, ShardConfig};
use crate::router::targeter::ShardId;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Sends one child request to one shard
#[async_trait]
pub trait ShardClient: Send + Sync {
    /// `Err` means no reply was received; per-op failures travel inside the
    /// reply.
    async fn bulk_write(
        &self,
        shard: &ShardId,
        request: &ShardWriteRequest,
    ) -> Result<ShardWriteReply>;
}

/// JSON over HTTP: `POST {url}/bulkWrite`
pub struct HttpShardClient {
    client: Client,
    urls: HashMap<ShardId, String>,
}

impl HttpShardClient {
    pub fn new(shards: &[ShardConfig], timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let urls = shards
            .iter()
            .map(|s| (ShardId::new(s.id.clone()), s.url.trim_end_matches('/').to_string()))
            .collect();
        Ok(Self { client, urls })
    }
}

#[async_trait]
impl ShardClient for HttpShardClient {
    async fn bulk_write(
        &self,
        shard: &ShardId,
        request: &ShardWriteRequest,
    ) -> Result<ShardWriteReply> {
        let base = self
            .urls
            .get(shard)
            .ok_or_else(|| Error::ShardNotFound(shard.to_string()))?;
        let url = format!("{}/bulkWrite", base);

        debug!(%shard, ops = request.ops.len(), "POST {}", url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::ConnectionFailed {
                shard: shard.to_string(),
                reason: e.to_string(),
            })?;

        match response.status() {
            status if status.is_success() => Ok(response.json::<ShardWriteReply>().await?),
            StatusCode::SERVICE_UNAVAILABLE => Err(Error::Shutdown(format!(
                "shard {} is shutting down",
                shard
            ))),
            status => Err(Error::Http(format!("shard {} answered {}", shard, status))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{NamespaceInfo, WriteOperation};
    use serde_json::json;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_unknown_shard() {
        let client = HttpShardClient::new(
            &[ShardConfig {
                id: "shard-a".into(),
                url: "http://127.0.0.1:1/".into(),
            }],
            Duration::from_millis(200),
        )
        .unwrap();
        let request = ShardWriteRequest {
            ops: vec![WriteOperation::insert(0, json!({"x": 1}))],
            ns_info: vec![NamespaceInfo::new("foo.bar")],
            ordered: true,
            bypass_document_validation: false,
            let_params: None,
            stmt_ids: None,
            correlation_id: Uuid::new_v4(),
        };

        let err = client
            .bulk_write(&ShardId::new("shard-z"), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ShardNotFound(_)));

        // Nothing listens on port 1
        let err = client
            .bulk_write(&ShardId::new("shard-a"), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert!(err.is_retryable());
    }
}
