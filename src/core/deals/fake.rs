//! In-memory portal used by the deal service tests.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::pipeline::PROVIDER_PAGE_SIZE;
use crate::core::crm::{CrmApi, RemoteResponse};
use crate::core::error::{BatcherError, Result};

pub struct FakeCrm {
    deals: Vec<Value>,
    lists: HashMap<String, Value>,
    pages_with_next: Option<usize>,
    failing_list_start: Option<u64>,
    failing_updates: HashSet<String>,
    failing_batch_id: Option<String>,
    batch_auth_expired: bool,
    calls: Mutex<Vec<(String, Value)>>,
    updates: Mutex<Vec<(String, String)>>,
}

impl FakeCrm {
    /// Portal holding deals with ids `1..=deal_count`.
    pub fn new(deal_count: usize) -> Self {
        Self {
            deals: Self::deals(deal_count),
            lists: HashMap::new(),
            pages_with_next: None,
            failing_list_start: None,
            failing_updates: HashSet::new(),
            failing_batch_id: None,
            batch_auth_expired: false,
            calls: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
        }
    }

    pub fn deals(count: usize) -> Vec<Value> {
        (1..=count)
            .map(|id| json!({ "ID": id.to_string(), "TITLE": format!("Deal {}", id) }))
            .collect()
    }

    pub fn with_list(mut self, method: &str, result: Value) -> Self {
        self.lists.insert(method.to_string(), result);
        self
    }

    /// Only the first `pages` list pages carry a `next` cursor.
    pub fn without_next_after(mut self, pages: usize) -> Self {
        self.pages_with_next = Some(pages);
        self
    }

    pub fn failing_list_at(mut self, start: u64) -> Self {
        self.failing_list_start = Some(start);
        self
    }

    /// The portal answers `false` for this deal's update.
    pub fn failing_update(mut self, id: &str) -> Self {
        self.failing_updates.insert(id.to_string());
        self
    }

    /// Any batch containing this deal fails as a whole.
    pub fn failing_batch_containing(mut self, id: &str) -> Self {
        self.failing_batch_id = Some(id.to_string());
        self
    }

    pub fn expired_batch_auth(mut self) -> Self {
        self.batch_auth_expired = true;
        self
    }

    pub fn calls_to(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params.clone())
            .collect()
    }

    /// Confirmed `(id, value)` writes, in submission order.
    pub fn updates(&self) -> Vec<(String, String)> {
        self.updates.lock().unwrap().clone()
    }

    fn list_page(&self, params: &Value) -> Result<RemoteResponse> {
        let start = params["start"].as_u64().unwrap_or(0);
        if self.failing_list_start == Some(start) {
            return Err(BatcherError::Remote(
                "INTERNAL_SERVER_ERROR: list failed".to_string(),
            ));
        }

        let from = (start as usize).min(self.deals.len());
        let to = (from + PROVIDER_PAGE_SIZE).min(self.deals.len());
        let page_index = from / PROVIDER_PAGE_SIZE;
        let has_next = to < self.deals.len()
            && self.pages_with_next.is_none_or(|pages| page_index < pages);

        Ok(RemoteResponse {
            result: Value::Array(self.deals[from..to].to_vec()),
            next: has_next.then_some(to as u64),
            total: Some(self.deals.len() as u64),
        })
    }

    fn run_batch(&self, params: &Value) -> Result<RemoteResponse> {
        if self.batch_auth_expired {
            return Err(BatcherError::Auth("expired_token: token expired".to_string()));
        }
        let commands = params["cmd"].as_object().cloned().unwrap_or_default();
        let parsed: Vec<(String, String, String)> = commands
            .iter()
            .filter_map(|(key, cmd)| {
                let (id, value) = parse_update(cmd.as_str()?)?;
                Some((key.clone(), id, value))
            })
            .collect();

        if let Some(bad) = &self.failing_batch_id
            && parsed.iter().any(|(_, id, _)| id == bad)
        {
            return Err(BatcherError::Remote(
                "QUERY_LIMIT_EXCEEDED: Too many requests".to_string(),
            ));
        }

        let mut results = Map::new();
        let mut updates = self.updates.lock().unwrap();
        for (key, id, value) in parsed {
            let ok = !self.failing_updates.contains(&id);
            if ok {
                updates.push((id, value));
            }
            results.insert(key, Value::Bool(ok));
        }
        Ok(RemoteResponse::new(
            json!({ "result": results, "result_error": [] }),
        ))
    }
}

/// `crm.deal.update?id=1&FIELDS[X]=v` -> `("1", "v")`.
fn parse_update(cmd: &str) -> Option<(String, String)> {
    let (_, query) = cmd.split_once('?')?;
    let mut id = None;
    let mut value = None;
    for pair in query.split('&') {
        let (key, raw) = pair.split_once('=')?;
        let decoded = urlencoding::decode(raw).ok()?.into_owned();
        if key == "id" {
            id = Some(decoded);
        } else if key.starts_with("FIELDS[") {
            value = Some(decoded);
        }
    }
    Some((id?, value?))
}

#[async_trait]
impl CrmApi for FakeCrm {
    async fn invoke(&self, method: &str, params: Value) -> Result<RemoteResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        match method {
            "crm.deal.list" => self.list_page(&params),
            "batch" => self.run_batch(&params),
            other => Ok(RemoteResponse::new(
                self.lists.get(other).cloned().unwrap_or_else(|| json!([])),
            )),
        }
    }
}
