//! Encoding of `batch` sub-calls and decoding of the per-command reply.
//!
//! Each sub-call is a query-string-like line: the method name, `?`, then
//! `KEY=value` pairs joined by `&`. Nested field updates use
//! `FIELDS[<name>]=<value>`. Values are always percent-encoded; the portal
//! rejects raw reserved characters inside a command.

use serde_json::Value;
use std::collections::BTreeMap;

/// Most sub-calls the portal accepts in a single `batch` request.
pub const MAX_BATCH_COMMANDS: usize = 50;

/// Outcome of one sub-call inside a batch reply.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItemResult {
    pub result: Value,
    pub error: Option<String>,
}

impl BatchItemResult {
    /// Only a literal boolean `true` counts as success.
    pub fn is_success(&self) -> bool {
        self.result == Value::Bool(true)
    }

    pub fn failure_reason(&self) -> String {
        match &self.error {
            Some(error) => error.clone(),
            None => format!("update not confirmed (result: {})", self.result),
        }
    }
}

pub fn encode_command(method: &str, args: &[(&str, &str)]) -> String {
    let query = args
        .iter()
        .map(|(key, value)| format!("{}={}", key, urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{}?{}", method, query)
}

/// Single-field `crm.deal.update` sub-call.
pub fn deal_update_command(id: &str, field_name: &str, value: &str) -> String {
    let field_key = format!("FIELDS[{}]", field_name);
    encode_command("crm.deal.update", &[("id", id), (&field_key, value)])
}

pub fn command_key(id: &str) -> String {
    format!("deal_{}", id)
}

/// Map the `batch` result (`{result: {..}, result_error: {..}}`) back onto
/// the submitted keys. Keys the portal did not answer are failures.
pub fn parse_batch_reply<'a>(
    keys: impl IntoIterator<Item = &'a String>,
    reply: &Value,
) -> BTreeMap<String, BatchItemResult> {
    let results = reply.get("result");
    let errors = reply.get("result_error");

    keys.into_iter()
        .map(|key| {
            let result = results
                .and_then(|r| r.get(key.as_str()))
                .cloned()
                .unwrap_or(Value::Null);
            let error = errors
                .and_then(|e| e.get(key.as_str()))
                .map(describe_error)
                .or_else(|| {
                    results
                        .and_then(|r| r.get(key.as_str()))
                        .is_none()
                        .then(|| "no result returned".to_string())
                });
            (key.clone(), BatchItemResult { result, error })
        })
        .collect()
}

fn describe_error(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => {
            let code = map.get("error").and_then(Value::as_str).unwrap_or("error");
            let description = map
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            format!("{}: {}", code, description)
        }
        other => other.to_string(),
    }
}
