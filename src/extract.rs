// src/extract.rs

use crate::config::ExtractConfig;
use crate::error::ExtractError;
use crate::llm::{ChatClient, ChatMessage};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::PathBuf;
use tracing::info;

/// The prompt that instructs the model to extract structured invoice data.
const SYSTEM_PROMPT: &str = r#"You are an invoice and receipt data extraction assistant.
Read the attached document image and return ONLY a JSON object with these fields:

{
  "document_id": "invoice number, receipt number or document ID",
  "name": "company, contractor, client or supplier name",
  "description": "main product or service description",
  "line_items": [
    {
      "item": "product or service name",
      "quantity": number of units,
      "unit_price": price per unit,
      "total": total amount for this line
    }
  ]
}

Notes:
- For "item" use the PRODUCT NAME or SERVICE DESCRIPTION, not item codes or SKU numbers.
- Ignore numeric codes unless they are the only identifier.
- Return only valid JSON, no additional text."#;

const USER_PROMPT: &str = "Extract the invoice data from this document.";

/// Produces the raw model answer for one named input.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, input: &str) -> Result<String, ExtractError>;
}

/// Sends `{input_dir}/{input}.{extension}` to a vision model.
pub struct VisionExtractor {
    chat: ChatClient,
    input_dir: PathBuf,
    extension: String,
    max_tokens: u32,
}

impl VisionExtractor {
    pub fn new(chat: ChatClient, config: &ExtractConfig, max_tokens: u32) -> Self {
        Self {
            chat,
            input_dir: config.input_dir.clone(),
            extension: config.extension.clone(),
            max_tokens,
        }
    }

    pub fn image_path(&self, input: &str) -> PathBuf {
        self.input_dir.join(format!("{input}.{}", self.extension))
    }

    async fn read_image(&self, input: &str) -> Result<String, ExtractError> {
        let path = self.image_path(input);
        let bytes = tokio::fs::read(&path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ExtractError::InputNotFound { path: path.clone() }
            } else {
                ExtractError::InputRead {
                    path: path.clone(),
                    source,
                }
            }
        })?;
        info!(path = %path.display(), bytes = bytes.len(), "Read input image");
        Ok(data_url(&self.extension, &bytes))
    }
}

#[async_trait]
impl Extractor for VisionExtractor {
    async fn extract(&self, input: &str) -> Result<String, ExtractError> {
        let image = self.read_image(input).await?;
        let messages = [
            ChatMessage::system(SYSTEM_PROMPT),
            ChatMessage::user_with_image(image, USER_PROMPT),
        ];
        let text = self.chat.complete(&messages, self.max_tokens).await?;
        info!(model = %self.chat.model(), chars = text.len(), "Extraction response received");
        Ok(text)
    }
}

fn media_type(extension: &str) -> &'static str {
    match extension.to_ascii_lowercase().as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
}

fn data_url(extension: &str, bytes: &[u8]) -> String {
    format!("data:{};base64,{}", media_type(extension), STANDARD.encode(bytes))
}
