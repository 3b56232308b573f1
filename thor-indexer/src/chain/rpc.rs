//! Tendermint RPC client
//!
//! Implements only the three endpoints block acquisition needs: `status`,
//! `blockchain` for headers and `block_results` for events.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use crate::config::ChainConfig;
use crate::core::{Block, ChainPort, FetchError, RawEvent, TxResult};

/// `blockchain` returns at most this many headers per call
const HEADERS_PER_CALL: i64 = 20;

/// RPC response wrapper
#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// RPC error structure
#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusResult {
    sync_info: SyncInfo,
}

#[derive(Debug, Deserialize)]
struct SyncInfo {
    #[serde(deserialize_with = "string_i64")]
    latest_block_height: i64,
}

#[derive(Debug, Deserialize)]
struct BlockchainResult {
    block_metas: Vec<BlockMeta>,
}

#[derive(Debug, Deserialize)]
struct BlockMeta {
    block_id: BlockId,
    header: Header,
}

#[derive(Debug, Deserialize)]
struct BlockId {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct Header {
    #[serde(deserialize_with = "string_i64")]
    height: i64,
    time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct BlockResults {
    #[serde(deserialize_with = "string_i64")]
    height: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    txs_results: Vec<TxResult>,
    #[serde(default, deserialize_with = "null_as_empty")]
    begin_block_events: Vec<RawEvent>,
    #[serde(default, deserialize_with = "null_as_empty")]
    end_block_events: Vec<RawEvent>,
    /// Newer nodes merge begin and end events, tagging each with `mode`
    #[serde(default, deserialize_with = "null_as_empty")]
    finalize_block_events: Vec<RawEvent>,
}

impl BlockResults {
    fn into_phases(self) -> (Vec<RawEvent>, Vec<TxResult>, Vec<RawEvent>) {
        let mut begin = self.begin_block_events;
        let mut end = self.end_block_events;
        for mut event in self.finalize_block_events {
            let mode = event
                .attributes
                .iter()
                .position(|a| a.key == "mode")
                .map(|i| event.attributes.remove(i).value);
            match mode.as_deref() {
                Some("BeginBlock") => begin.push(event),
                _ => end.push(event),
            }
        }
        (begin, self.txs_results, end)
    }
}

fn string_i64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(i64),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        Raw::Number(n) => Ok(n),
    }
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

pub struct TendermintClient {
    http: reqwest::Client,
    base_url: String,
    parallelism: usize,
    timeout: Duration,
}

impl TendermintClient {
    pub fn new(config: &ChainConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            base_url: config.rpc_url.trim_end_matches('/').to_string(),
            parallelism: config.fetch_parallelism.max(1),
            timeout: config.request_timeout(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T, FetchError> {
        let url = format!("{}/{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchError::Timeout(self.timeout)
                } else {
                    FetchError::from(e)
                }
            })?;
        let body = response.bytes().await?;
        let parsed: RpcResponse<T> = serde_json::from_slice(&body)?;
        if let Some(error) = parsed.error {
            let message = match error.data {
                Some(data) if !data.is_empty() => format!("{}: {}", error.message, data),
                _ => error.message,
            };
            return Err(FetchError::Rpc {
                code: error.code,
                message,
            });
        }
        parsed
            .result
            .ok_or_else(|| FetchError::Decode(format!("{} returned neither result nor error", path)))
    }

    async fn headers(&self, from: i64, to: i64) -> Result<HashMap<i64, BlockMeta>, FetchError> {
        let mut metas = HashMap::new();
        let mut low = from;
        while low <= to {
            let high = (low + HEADERS_PER_CALL - 1).min(to);
            let result: BlockchainResult = self
                .call(
                    "blockchain",
                    &[("minHeight", low.to_string()), ("maxHeight", high.to_string())],
                )
                .await?;
            for meta in result.block_metas {
                metas.insert(meta.header.height, meta);
            }
            low = high + 1;
        }
        Ok(metas)
    }

    async fn block_results(&self, height: i64) -> Result<BlockResults, FetchError> {
        let results: BlockResults = self
            .call("block_results", &[("height", height.to_string())])
            .await?;
        if results.height != height {
            return Err(FetchError::HeightGap {
                expected: height,
                got: results.height,
            });
        }
        Ok(results)
    }
}

#[async_trait]
impl ChainPort for TendermintClient {
    async fn latest_height(&self) -> Result<i64, FetchError> {
        let status: StatusResult = self.call("status", &[]).await?;
        Ok(status.sync_info.latest_block_height)
    }

    async fn fetch_blocks(&self, from: i64, to: i64) -> Result<Vec<Block>, FetchError> {
        if to < from {
            return Ok(Vec::new());
        }
        debug!(from, to, "Fetching blocks over RPC");
        let mut headers = self.headers(from, to).await?;
        let results: Vec<BlockResults> = stream::iter(from..=to)
            .map(|height| self.block_results(height))
            .buffered(self.parallelism)
            .try_collect()
            .await?;

        let mut blocks = Vec::with_capacity(results.len());
        for results in results {
            let height = results.height;
            let meta = headers
                .remove(&height)
                .ok_or_else(|| FetchError::Decode(format!("no header for height {}", height)))?;
            let hash = hex::decode(&meta.block_id.hash)
                .map_err(|e| FetchError::Decode(format!("block hash at {}: {}", height, e)))?;
            let (begin_events, txs, end_events) = results.into_phases();
            blocks.push(Block {
                height,
                timestamp: meta.header.time,
                hash,
                begin_events,
                txs,
                end_events,
            });
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_results_with_nulls_and_finalize_events() {
        let json = r#"{
            "jsonrpc": "2.0", "id": -1,
            "result": {
                "height": "17",
                "txs_results": null,
                "begin_block_events": null,
                "finalize_block_events": [
                    {"type": "rewards", "attributes": [{"key": "bond_reward", "value": "1"}, {"key": "mode", "value": "BeginBlock"}]},
                    {"type": "pool", "attributes": [{"key": "mode", "value": "EndBlock"}]}
                ]
            }
        }"#;
        let parsed: RpcResponse<BlockResults> = serde_json::from_str(json).unwrap();
        let results = parsed.result.unwrap();
        assert_eq!(results.height, 17);
        let (begin, txs, end) = results.into_phases();
        assert_eq!(begin.len(), 1);
        assert_eq!(begin[0].attributes.len(), 1);
        assert!(txs.is_empty());
        assert_eq!(end[0].kind, "pool");
    }

    #[test]
    fn status_and_headers() {
        let status: RpcResponse<StatusResult> = serde_json::from_str(
            r#"{"result": {"sync_info": {"latest_block_height": "123456"}}}"#,
        )
        .unwrap();
        assert_eq!(status.result.unwrap().sync_info.latest_block_height, 123456);

        let chain: RpcResponse<BlockchainResult> = serde_json::from_str(
            r#"{"result": {"block_metas": [{"block_id": {"hash": "AB01"}, "header": {"height": "9", "time": "2021-04-01T00:00:00.123456789Z"}}]}}"#,
        )
        .unwrap();
        let meta = &chain.result.unwrap().block_metas[0];
        assert_eq!(meta.header.height, 9);
        assert_eq!(meta.header.time.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn rpc_errors_are_surfaced() {
        let parsed: RpcResponse<StatusResult> = serde_json::from_str(
            r#"{"error": {"code": -32603, "message": "Internal error", "data": "height 9 must be less than or equal to 8"}}"#,
        )
        .unwrap();
        let error = parsed.error.unwrap();
        assert_eq!(error.code, -32603);
        assert!(error.data.unwrap().contains("height 9"));
    }
}
