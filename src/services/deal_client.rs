//! src/services/deal_client.rs
//!
//! Client for the deal network's JSON-RPC service. Every call is a
//! `{"jsonrpc":"2.0","method","params","id"}` POST to `<server>/rpc/v0`,
//! authenticated by the static `api-key` / `api-token` headers. The RPC result
//! is itself an envelope `{code, message, data}`; any code other than
//! `"success"` is an error carrying `message`.

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, instrument};

const RPC_PATH: &str = "/rpc/v0";
const SUCCESS_CODE: &str = "success";

#[derive(Debug, Error)]
pub enum DealError {
    #[error("deal network is not configured: {0}")]
    Config(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("deal network transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("deal network rpc error: {0}")]
    Rpc(String),
    #[error("deal network rejected the call: {0}")]
    Remote(String),
    #[error("malformed deal network response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type DealResult<T> = Result<T, DealError>;

/// One payload handed to the network for backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileData {
    pub source_name: String,
    pub data_size: i64,
    pub is_directory: bool,
    /// Pre-authenticated URL the network pulls the payload from.
    pub download_url: String,
}

/// Backup status as reported by `meta.DatasetDeal`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DatasetDeal {
    pub dataset_id: i64,
    pub dataset_name: String,
    /// Human-readable status, stored as the backup's status message.
    pub dataset_status: String,
    pub status: i32,
    pub payload_cid: String,
    pub payload_url: String,
    pub task_id: String,
    pub task_name: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub file_desc_list: Vec<FileDesc>,
}

/// One slice of a backup payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct FileDesc {
    pub uuid: String,
    pub source_file_name: String,
    pub source_file_size: i64,
    pub car_file_name: String,
    pub car_file_url: String,
    pub car_file_size: i64,
    pub payload_cid: String,
    pub piece_cid: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub deals: Vec<DealInfo>,
}

/// A storage provider's deal for one slice.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct DealInfo {
    pub deal_id: i64,
    pub deal_cid: String,
    pub miner_fid: String,
    pub start_epoch: i64,
    pub cost: String,
    pub storage_status: String,
}

/// Rebuild progress as reported by `meta.DatasetRebuild`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RebuildResp {
    pub status: i32,
    pub payload_cid: String,
    pub payload_url: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub providers: Vec<String>,
    pub due_at: i64,
    pub created_at: i64,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Operations the pipelines need from the deal network.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait DealNetwork: Send + Sync {
    /// Submit payloads for backup under `name`, paid by `wallet`. Returns the job handle.
    async fn submit_backup(
        &self,
        name: String,
        wallet: String,
        files: Vec<FileData>,
    ) -> DealResult<i64>;

    /// Current status, slices and deals of a backup job.
    async fn backup_deal_status(&self, job_id: i64) -> DealResult<DatasetDeal>;

    /// Request (or poll) retrieval of `object` from a backup job.
    async fn rebuild(&self, job_id: i64, object: String) -> DealResult<RebuildResp>;
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<CommonResp>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct CommonResp {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct RebuildParams<'a> {
    dataset_id: i64,
    object: &'a str,
}

/// HTTP JSON-RPC implementation of [`DealNetwork`].
pub struct MetaClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    api_token: String,
    next_id: AtomicU64,
}

impl std::fmt::Debug for MetaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaClient")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl MetaClient {
    pub fn new(server: &str, api_key: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self::with_http(reqwest::Client::new(), server, api_key, api_token)
    }

    pub fn with_http(
        http: reqwest::Client,
        server: &str,
        api_key: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            endpoint: rpc_endpoint(server),
            api_key: api_key.into(),
            api_token: api_token.into(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(skip(self, params), fields(endpoint = %self.endpoint))]
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> DealResult<T> {
        if self.endpoint == RPC_PATH {
            return Err(DealError::Config("META_SERVER is empty"));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .http
            .post(&self.endpoint)
            .header("api-key", &self.api_key)
            .header("api-token", &self.api_token)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let envelope: RpcResponse = response.json().await?;
        if let Some(err) = envelope.error.filter(|e| !e.is_null()) {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| err.to_string());
            return Err(DealError::Rpc(message));
        }
        let result = envelope
            .result
            .ok_or_else(|| DealError::Rpc("response carries neither result nor error".into()))?;
        if result.code != SUCCESS_CODE {
            return Err(DealError::Remote(result.message));
        }
        debug!(method, "deal network call succeeded");
        Ok(serde_json::from_value(result.data)?)
    }
}

/// Append `/rpc/v0` unless the server already ends with it.
fn rpc_endpoint(server: &str) -> String {
    if server.ends_with(RPC_PATH) {
        server.to_string()
    } else {
        format!("{}{}", server.trim_end_matches('/'), RPC_PATH)
    }
}

#[async_trait]
impl DealNetwork for MetaClient {
    async fn submit_backup(
        &self,
        name: String,
        wallet: String,
        files: Vec<FileData>,
    ) -> DealResult<i64> {
        if files.is_empty() {
            return Err(DealError::InvalidRequest("at least one file is required"));
        }
        self.call("meta.Backup", json!([name, files, wallet])).await
    }

    async fn backup_deal_status(&self, job_id: i64) -> DealResult<DatasetDeal> {
        if job_id <= 0 {
            return Err(DealError::InvalidRequest("job id must be positive"));
        }
        self.call("meta.DatasetDeal", json!([job_id])).await
    }

    async fn rebuild(&self, job_id: i64, object: String) -> DealResult<RebuildResp> {
        let params = RebuildParams {
            dataset_id: job_id,
            object: &object,
        };
        self.call("meta.DatasetRebuild", json!([params])).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_path_is_appended_once() {
        assert_eq!(rpc_endpoint("http://meta:8080"), "http://meta:8080/rpc/v0");
        assert_eq!(rpc_endpoint("http://meta:8080/"), "http://meta:8080/rpc/v0");
        assert_eq!(rpc_endpoint("http://meta:8080/rpc/v0"), "http://meta:8080/rpc/v0");
    }

    #[test]
    fn dataset_deal_decodes_pascal_case_slices() {
        let raw = json!({
            "dataset_id": 7,
            "dataset_status": "DealActive",
            "status": 45,
            "payload_cid": "bafy-root",
            "file_desc_list": [{
                "Uuid": "u1",
                "PayloadCid": "bafy-1",
                "CarFileName": "one.car",
                "CarFileUrl": "http://car/one.car",
                "SourceFileSize": 12,
                "Deals": [
                    {"DealId": 3, "DealCid": "d3", "MinerFid": "f01", "Cost": "0.1", "StorageStatus": "StorageDealActive"},
                    {"DealId": 0, "MinerFid": "f02"}
                ]
            }, {
                "PayloadCid": "bafy-2",
                "Deals": null
            }]
        });
        let deal: DatasetDeal = serde_json::from_value(raw).unwrap();
        assert_eq!(deal.status, 45);
        assert_eq!(deal.file_desc_list.len(), 2);
        assert_eq!(deal.file_desc_list[0].deals[0].miner_fid, "f01");
        assert_eq!(deal.file_desc_list[0].deals[0].storage_status, "StorageDealActive");
        assert!(deal.file_desc_list[0].deals[1].storage_status.is_empty());
        assert!(deal.file_desc_list[1].deals.is_empty());
    }

    #[tokio::test]
    async fn empty_submission_is_rejected_before_any_call() {
        let client = MetaClient::new("http://127.0.0.1:9", "k", "t");
        let err = client
            .submit_backup("b-x-20240101000000".into(), "wallet".into(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DealError::InvalidRequest(_)));
    }
}
