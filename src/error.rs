// src/error.rs

//! Error types for the ETL pipeline.
//!
//! Per-input failures ([`ExtractError`], [`ResponseError`]) are recoverable at
//! batch granularity: the pipeline skips the input or aborts depending on the
//! configured [`crate::pipeline::FailurePolicy`]. A [`StoreError`] is always
//! fatal for the batch and rolls the whole load back.

use std::path::PathBuf;
use thiserror::Error;

/// The extraction collaborator could not produce raw text for one input.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("input image not found: '{path}'")]
    InputNotFound { path: PathBuf },

    #[error("failed to read input image '{path}': {source}")]
    InputRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Failures talking to the chat-completions endpoint.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("LLM API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("empty response from LLM")]
    EmptyResponse,

    #[error("LLM backend at {url} is not reachable")]
    Unreachable { url: String },
}

/// The raw model response did not contain usable structured data.
#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("no balanced JSON object found in response")]
    NoObjectFound,

    #[error("malformed JSON object in response: {source}")]
    MalformedObject {
        #[source]
        source: serde_json::Error,
    },
}

/// Why a single input produced no document.
#[derive(Debug, Error)]
pub enum InputError {
    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Response(#[from] ResponseError),
}

/// The relational store rejected an operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create store directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("LLM_API_KEY env var required for remote backend")]
    MissingApiKey,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("line item totals exceed the decimal range")]
    TotalOverflow,

    #[error("failed to write report '{path}': {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Batch-level failure. Any of these means nothing from the batch was committed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input '{input}' failed and the batch is configured to abort: {reason}")]
    InputAborted { input: String, reason: String },

    #[error("batch load failed and was rolled back: {0}")]
    Store(#[from] StoreError),
}
