pub mod fields;
pub mod pipeline;

#[cfg(test)]
pub(crate) mod fake;

pub use fields::{CustomField, EnumChoice, FieldKind};
pub use pipeline::{
    ItemFailure, JobParams, JobSummary, ProgressEvent, ProgressSink, TagValues,
};

use serde_json::{Value, json};
use tracing::debug;

use crate::core::crm::CrmApi;
use crate::core::error::{BatcherError, Result};

/// Id of the default funnel, which the category list does not return.
pub const DEFAULT_CATEGORY_ID: &str = "0";

#[derive(Debug, Clone, PartialEq)]
pub struct Category {
    pub id: String,
    pub name: String,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Stage {
    /// Value used in the `STAGE_ID` deal filter.
    pub status_id: String,
    pub name: String,
    pub raw: Value,
}

/// Deal-level operations against the portal.
pub struct DealService<C> {
    client: C,
}

impl<C: CrmApi> DealService<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    #[cfg(test)]
    pub fn client(&self) -> &C {
        &self.client
    }

    pub async fn get_categories(&self) -> Result<Vec<Category>> {
        let response = self.client.invoke("crm.dealcategory.list", json!({})).await?;
        let mut categories: Vec<Category> = as_list(&response.result, "crm.dealcategory.list")?
            .iter()
            .filter_map(|raw| {
                Some(Category {
                    id: value_as_id(raw.get("ID")?)?,
                    name: raw
                        .get("NAME")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    raw: raw.clone(),
                })
            })
            .collect();

        if !categories.iter().any(|c| c.id == DEFAULT_CATEGORY_ID) {
            categories.insert(
                0,
                Category {
                    id: DEFAULT_CATEGORY_ID.to_string(),
                    name: "General".to_string(),
                    raw: json!({ "ID": DEFAULT_CATEGORY_ID, "NAME": "General" }),
                },
            );
        }
        Ok(categories)
    }

    pub async fn get_stages(&self, category_id: &str) -> Result<Vec<Stage>> {
        let id: i64 = category_id.parse().map_err(|_| {
            BatcherError::Validation(format!("Category id must be numeric: {}", category_id))
        })?;
        let response = self
            .client
            .invoke("crm.dealcategory.stage.list", json!({ "id": id }))
            .await?;
        Ok(as_list(&response.result, "crm.dealcategory.stage.list")?
            .iter()
            .filter_map(|raw| {
                let status_id = raw
                    .get("STATUS_ID")
                    .or_else(|| raw.get("ID"))
                    .and_then(value_as_id)?;
                Some(Stage {
                    status_id,
                    name: raw
                        .get("NAME")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    raw: raw.clone(),
                })
            })
            .collect())
    }

    /// Deal user fields that can be tagged (single-valued enumeration or string).
    pub async fn get_deal_user_fields(&self) -> Result<Vec<CustomField>> {
        let response = self.client.invoke("crm.deal.userfield.list", json!({})).await?;
        let fields: Vec<CustomField> = as_list(&response.result, "crm.deal.userfield.list")?
            .iter()
            .filter_map(CustomField::from_raw)
            .filter(|f| !f.multiple)
            .collect();
        debug!("{} taggable deal fields", fields.len());
        Ok(fields)
    }
}

fn as_list<'a>(result: &'a Value, method: &str) -> Result<&'a Vec<Value>> {
    result
        .as_array()
        .ok_or_else(|| BatcherError::Remote(format!("{}: expected a list result", method)))
}

/// Portal ids arrive as strings or numbers depending on the method.
pub fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
