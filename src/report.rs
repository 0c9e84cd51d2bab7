// src/report.rs

//! Executive summary generation from the current store contents.
//!
//! The report is produced by a second model call and treated as opaque text;
//! only surrounding code fences are stripped before it is written out.

use crate::config::StoreConfig;
use crate::error::ReportError;
use crate::llm::{ChatClient, ChatMessage};
use crate::response::strip_fences;
use crate::store::{DocumentStore, Snapshot};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

const TOP_N: usize = 5;

const REPORT_RULES: &str = r#"RULES:
- The title needs to be "Executive Report".
- It needs to be an executive report, easy to understand and concise.
- Use ONLY article class and basic tabular.
- ALL tables in the LaTeX code must have MAXIMUM 3 columns.
- Replace special characters: # with NUM, & with AND, $ with USD, % with PCT.
- Keep it simple and clean.
Return ONLY compilable LaTeX code."#;

/// Turns a store snapshot into report text.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn generate(&self, snapshot: &Snapshot) -> Result<String, ReportError>;
}

pub struct LlmReporter {
    chat: ChatClient,
    max_tokens: u32,
}

impl LlmReporter {
    pub fn new(chat: ChatClient, max_tokens: u32) -> Self {
        Self { chat, max_tokens }
    }
}

#[async_trait]
impl Reporter for LlmReporter {
    async fn generate(&self, snapshot: &Snapshot) -> Result<String, ReportError> {
        let messages = [ChatMessage::user(build_prompt(snapshot)?)];
        let text = self.chat.complete(&messages, self.max_tokens).await?;
        Ok(strip_fences(&text).to_string())
    }
}

/// Aggregates the report asks the model to present.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub total_documents: usize,
    pub total_value: Decimal,
    pub top_suppliers: Vec<(String, Decimal)>,
    pub top_items: Vec<(String, Decimal)>,
}

impl Summary {
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, ReportError> {
        let names: HashMap<i64, &str> = snapshot
            .documents
            .iter()
            .map(|d| (d.id, d.name.as_str()))
            .collect();

        let mut total_value = Decimal::ZERO;
        let mut by_supplier: HashMap<&str, Decimal> = HashMap::new();
        let mut by_item: HashMap<&str, Decimal> = HashMap::new();
        for li in &snapshot.line_items {
            total_value = add_total(total_value, li.total)?;
            if let Some(name) = names.get(&li.document_id) {
                let entry = by_supplier.entry(*name).or_default();
                *entry = add_total(*entry, li.total)?;
            }
            let entry = by_item.entry(li.item.as_str()).or_default();
            *entry = add_total(*entry, li.total)?;
        }

        Ok(Self {
            total_documents: snapshot.documents.len(),
            total_value,
            top_suppliers: top_n(by_supplier),
            top_items: top_n(by_item),
        })
    }
}

fn add_total(acc: Decimal, value: Decimal) -> Result<Decimal, ReportError> {
    acc.checked_add(value).ok_or(ReportError::TotalOverflow)
}

/// Highest values first, ties broken by name.
fn top_n(totals: HashMap<&str, Decimal>) -> Vec<(String, Decimal)> {
    let mut ranked: Vec<(String, Decimal)> = totals
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(TOP_N);
    ranked
}

/// Render the snapshot and precomputed figures into the report prompt.
pub fn build_prompt(snapshot: &Snapshot) -> Result<String, ReportError> {
    let summary = Summary::from_snapshot(snapshot)?;
    let mut prompt = String::from("Generate a simple LaTeX report with this data:\n\nDocuments (id | filename | document_id | name | description):\n");

    for d in &snapshot.documents {
        let _ = writeln!(
            prompt,
            "{} | {} | {} | {} | {}",
            d.id, d.filename, d.document_id, d.name, d.description
        );
    }

    prompt.push_str("\nLine items (document | item | quantity | unit_price | total):\n");
    for li in &snapshot.line_items {
        let _ = writeln!(
            prompt,
            "{} | {} | {} | {} | {}",
            li.document_id, li.item, li.quantity, li.unit_price, li.total
        );
    }

    let _ = write!(
        prompt,
        "\nInclude: total documents ({}), total value ({}), top {TOP_N} suppliers, top {TOP_N} items.\n",
        summary.total_documents, summary.total_value
    );
    prompt.push_str("Top suppliers by value:\n");
    for (name, value) in &summary.top_suppliers {
        let _ = writeln!(prompt, "- {name}: {value}");
    }
    prompt.push_str("Top items by value:\n");
    for (name, value) in &summary.top_items {
        let _ = writeln!(prompt, "- {name}: {value}");
    }

    prompt.push('\n');
    prompt.push_str(REPORT_RULES);
    Ok(prompt)
}

/// Write the report, creating parent directories as needed.
pub fn save_report(text: &str, path: &Path) -> Result<(), ReportError> {
    let write_err = |source| ReportError::Write {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(write_err)?;
    }
    std::fs::write(path, text).map_err(write_err)?;
    info!(path = %path.display(), bytes = text.len(), "Report saved");
    Ok(())
}

/// Read the current store state on its own connection and produce the report.
pub async fn generate_report(
    store_config: &StoreConfig,
    reporter: &dyn Reporter,
    output_path: &Path,
) -> Result<PathBuf, ReportError> {
    let snapshot = {
        let store = DocumentStore::open(store_config)?;
        let snapshot = store.snapshot()?;
        store.close()?;
        snapshot
    };
    info!(
        documents = snapshot.documents.len(),
        line_items = snapshot.line_items.len(),
        "Generating report"
    );

    let text = reporter.generate(&snapshot).await?;
    save_report(&text, output_path)?;
    Ok(output_path.to_path_buf())
}
