// src/normalize/mod.rs

mod numeric;

use numeric::to_decimal;

use crate::response::RawRecord;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, warn};

/// Placeholder for any text field the model did not supply.
pub const SENTINEL: &str = "N/A";

const DOCUMENT_ID_KEYS: &[&str] = &["document_id", "id", "number"];
const NAME_KEYS: &[&str] = &["name", "contractor", "supplier", "client"];
const DESCRIPTION_KEYS: &[&str] = &["description", "desc"];
const LINE_ITEMS_KEYS: &[&str] = &["line_items", "items"];

const ITEM_KEYS: &[&str] = &["item", "description", "name"];
const QUANTITY_KEYS: &[&str] = &["quantity", "qty"];
const UNIT_PRICE_KEYS: &[&str] = &["unit_price", "price", "unit"];
const TOTAL_KEYS: &[&str] = &["total", "amount"];

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static pattern"));

/// A single invoice line item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineItem {
    pub item: String,
    pub quantity: Decimal,
    pub unit_price: Decimal,
    pub total: Decimal,
}

/// One extracted source record with every field resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CanonicalDocument {
    pub document_id: String,
    pub name: String,
    pub description: String,
    pub line_items: Vec<LineItem>,
}

/// What to do when a numeric field is present but cannot be coerced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumericPolicy {
    /// Substitute zero silently.
    #[default]
    Lossy,
    /// Substitute zero and emit a warning per field.
    Warn,
}

/// Result of normalizing one record.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub document: CanonicalDocument,
    /// Numeric fields that were present but replaced by zero.
    pub defaulted_fields: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    policy: NumericPolicy,
}

impl Normalizer {
    pub fn new(policy: NumericPolicy) -> Self {
        Self { policy }
    }

    /// Map an untyped record onto the canonical schema. Never fails.
    pub fn document(&self, input: &str, record: &RawRecord) -> Normalized {
        let mut defaulted_fields = 0;

        let line_items = match first_present(record, LINE_ITEMS_KEYS) {
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .filter_map(|(idx, item)| match item {
                    Value::Object(fields) => {
                        Some(self.line_item(input, idx, fields, &mut defaulted_fields))
                    }
                    _ => {
                        debug!(input, idx, "Skipping non-object line item");
                        None
                    }
                })
                .collect(),
            _ => Vec::new(),
        };

        Normalized {
            document: CanonicalDocument {
                document_id: text_field(record, DOCUMENT_ID_KEYS),
                name: text_field(record, NAME_KEYS),
                description: text_field(record, DESCRIPTION_KEYS),
                line_items,
            },
            defaulted_fields,
        }
    }

    fn line_item(
        &self,
        input: &str,
        idx: usize,
        fields: &RawRecord,
        defaulted: &mut usize,
    ) -> LineItem {
        let mut number = |field: &'static str, keys: &[&str]| -> Decimal {
            let Some(raw) = first_present(fields, keys) else {
                return Decimal::ZERO;
            };
            if raw.is_null() {
                return Decimal::ZERO;
            }
            match to_decimal(raw) {
                Some(value) => value,
                None => {
                    *defaulted += 1;
                    match self.policy {
                        NumericPolicy::Lossy => {
                            debug!(input, idx, field, raw = %raw, "Numeric field defaulted to 0")
                        }
                        NumericPolicy::Warn => {
                            warn!(input, idx, field, raw = %raw, "Unparseable numeric field, using 0")
                        }
                    }
                    Decimal::ZERO
                }
            }
        };

        let quantity = number("quantity", QUANTITY_KEYS);
        let unit_price = number("unit_price", UNIT_PRICE_KEYS);
        let total = number("total", TOTAL_KEYS);

        LineItem {
            item: text_field(fields, ITEM_KEYS),
            quantity,
            unit_price,
            total,
        }
    }
}

/// The value of the first alias present as a key, even if that value is null.
fn first_present<'a>(record: &'a RawRecord, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| record.get(*k))
}

fn text_field(record: &RawRecord, keys: &[&str]) -> String {
    first_present(record, keys)
        .map(clean_text)
        .unwrap_or_else(|| SENTINEL.to_string())
}

/// Collapse whitespace and trim.
///
/// Null, `false`, zero, empty strings, empty arrays and empty objects all
/// become [`SENTINEL`].
pub fn clean_text(value: &Value) -> String {
    let raw = match value {
        Value::Null | Value::Bool(false) => return SENTINEL.to_string(),
        Value::Number(n) if n.as_f64() == Some(0.0) => return SENTINEL.to_string(),
        Value::Array(a) if a.is_empty() => return SENTINEL.to_string(),
        Value::Object(o) if o.is_empty() => return SENTINEL.to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };

    let cleaned = WHITESPACE.replace_all(raw.trim(), " ");
    if cleaned.is_empty() || cleaned == SENTINEL {
        SENTINEL.to_string()
    } else {
        cleaned.into_owned()
    }
}
