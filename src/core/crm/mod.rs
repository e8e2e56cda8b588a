pub mod batch;
mod client;

pub use batch::BatchItemResult;
pub use client::CrmClient;

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::BTreeMap;

use crate::core::error::Result;

/// Payload of one successful REST call.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse {
    pub result: Value,
    /// Pagination cursor for list methods.
    pub next: Option<u64>,
    /// Total matching items, when the portal reports it.
    pub total: Option<u64>,
}

impl RemoteResponse {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            next: None,
            total: None,
        }
    }
}

/// Seam between the deal pipeline and the portal transport.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Call one REST method with the given parameters (a JSON object).
    async fn invoke(&self, method: &str, params: Value) -> Result<RemoteResponse>;

    /// Run pre-encoded sub-calls in one `batch` round trip. Partial failures
    /// come back per key; only a failure of the batch call itself is an error.
    async fn invoke_batch(
        &self,
        commands: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, BatchItemResult>> {
        let response = self
            .invoke("batch", json!({ "halt": 0, "cmd": commands }))
            .await?;
        Ok(batch::parse_batch_reply(commands.keys(), &response.result))
    }
}
