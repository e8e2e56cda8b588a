use serde_json::Value;
use std::fmt;
use tracing::debug;

use super::value_as_id;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumChoice {
    pub id: String,
    pub value: String,
}

/// Field type, decided once when the field list is fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Enumeration { choices: Vec<EnumChoice> },
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomField {
    /// `UF_CRM_*` name used in updates.
    pub name: String,
    pub label: Option<String>,
    pub kind: FieldKind,
    pub multiple: bool,
}

impl CustomField {
    /// Normalize a raw `crm.deal.userfield.list` entry. Types other than
    /// `enumeration` and `string` yield `None`.
    pub fn from_raw(raw: &Value) -> Option<Self> {
        let name = raw.get("FIELD_NAME").and_then(Value::as_str)?.to_string();
        let type_id = raw
            .get("USER_TYPE_ID")
            .or_else(|| raw.get("TYPE"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let kind = match type_id {
            "enumeration" => FieldKind::Enumeration {
                choices: raw
                    .get("LIST")
                    .and_then(Value::as_array)
                    .map(|list| list.iter().filter_map(parse_choice).collect())
                    .unwrap_or_default(),
            },
            "string" => FieldKind::Text,
            other => {
                debug!("Skipping field {} of unsupported type '{}'", name, other);
                return None;
            }
        };

        Some(Self {
            name,
            label: label_of(raw),
            kind,
            multiple: raw.get("MULTIPLE").and_then(Value::as_str) == Some("Y"),
        })
    }

    pub fn choices(&self) -> &[EnumChoice] {
        match &self.kind {
            FieldKind::Enumeration { choices } => choices,
            FieldKind::Text => &[],
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            FieldKind::Enumeration { .. } => "enumeration",
            FieldKind::Text => "string",
        }
    }
}

impl fmt::Display for CustomField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.label {
            Some(label) => write!(f, "{} - {} ({})", self.name, label, self.type_name()),
            None => write!(f, "{} ({})", self.name, self.type_name()),
        }
    }
}

impl fmt::Display for EnumChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ID={} -> {}", self.id, self.value)
    }
}

fn parse_choice(raw: &Value) -> Option<EnumChoice> {
    let id = value_as_id(raw.get("ID")?)?;
    let value = raw
        .get("VALUE")
        .or_else(|| raw.get("NAME"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Some(EnumChoice { id, value })
}

/// Labels come either as plain strings or as per-language maps.
fn label_of(raw: &Value) -> Option<String> {
    ["EDIT_FORM_LABEL", "LIST_COLUMN_LABEL", "NAME"]
        .iter()
        .filter_map(|key| raw.get(*key))
        .find_map(|label| match label {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(map) => map
                .values()
                .filter_map(Value::as_str)
                .find(|s| !s.is_empty())
                .map(str::to_string),
            _ => None,
        })
}
