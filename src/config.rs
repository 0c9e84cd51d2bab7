use crate::error::ConfigError;
use crate::normalize::NumericPolicy;
use crate::pipeline::FailurePolicy;
use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub llm: LlmSection,
    pub extract: ExtractConfig,
    pub normalize: NormalizeConfig,
    pub pipeline: PipelineConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("etl_store/invoices.db")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmBackend {
    Ollama,
    #[default]
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default)]
    pub backend: LlmBackend,
    #[serde(default = "default_ollama")]
    pub ollama: EndpointConfig,
    #[serde(default = "default_remote")]
    pub remote: EndpointConfig,
    #[serde(default = "default_extraction_max_tokens")]
    pub extraction_max_tokens: u32,
    #[serde(default = "default_report_max_tokens")]
    pub report_max_tokens: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            backend: LlmBackend::default(),
            ollama: default_ollama(),
            remote: default_remote(),
            extraction_max_tokens: default_extraction_max_tokens(),
            report_max_tokens: default_report_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub base_url: String,
    pub model: String,
}

fn default_ollama() -> EndpointConfig {
    EndpointConfig {
        base_url: "http://localhost:11434/v1".to_string(),
        model: "qwen2.5vl:7b".to_string(),
    }
}

fn default_remote() -> EndpointConfig {
    EndpointConfig {
        base_url: "https://api.openai.com/v1".to_string(),
        model: "gpt-4.1-mini".to_string(),
    }
}

fn default_extraction_max_tokens() -> u32 {
    2000
}

fn default_report_max_tokens() -> u32 {
    3000
}

fn default_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            input_dir: default_input_dir(),
            extension: default_extension(),
        }
    }
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("inputs")
}

fn default_extension() -> String {
    "jpg".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NormalizeConfig {
    #[serde(default)]
    pub numeric_policy: NumericPolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub on_input_error: FailurePolicy,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_inputs")]
    pub default_inputs: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            on_input_error: FailurePolicy::default(),
            concurrency: default_concurrency(),
            default_inputs: default_inputs(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_inputs() -> Vec<String> {
    vec!["000".to_string(), "001".to_string()]
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReportConfig {
    #[serde(default = "default_report_enabled")]
    pub enabled: bool,
    #[serde(default = "default_report_path")]
    pub output_path: PathBuf,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            enabled: default_report_enabled(),
            output_path: default_report_path(),
        }
    }
}

fn default_report_enabled() -> bool {
    true
}

fn default_report_path() -> PathBuf {
    PathBuf::from("reports/report.tex")
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg.store.db_path, PathBuf::from("etl_store/invoices.db"));
        assert_eq!(cfg.llm.backend, LlmBackend::Remote);
        assert_eq!(cfg.extract.extension, "jpg");
        assert_eq!(cfg.normalize.numeric_policy, NumericPolicy::Lossy);
        assert_eq!(cfg.pipeline.on_input_error, FailurePolicy::Skip);
        assert_eq!(cfg.pipeline.default_inputs, vec!["000", "001"]);
        assert!(cfg.report.enabled);
    }

    #[test]
    fn test_partial_sections() {
        let cfg = Config::from_toml(
            r#"
            [llm]
            backend = "ollama"

            [llm.ollama]
            base_url = "http://gpu-box:11434/v1"
            model = "llava"

            [normalize]
            numeric_policy = "warn"

            [pipeline]
            on_input_error = "abort"
            concurrency = 4
            "#,
        )
        .unwrap();
        assert_eq!(cfg.llm.backend, LlmBackend::Ollama);
        assert_eq!(cfg.llm.ollama.model, "llava");
        assert_eq!(cfg.llm.remote.model, "gpt-4.1-mini");
        assert_eq!(cfg.llm.report_max_tokens, 3000);
        assert_eq!(cfg.normalize.numeric_policy, NumericPolicy::Warn);
        assert_eq!(cfg.pipeline.on_input_error, FailurePolicy::Abort);
        assert_eq!(cfg.pipeline.concurrency, 4);
        assert_eq!(cfg.pipeline.default_inputs.len(), 2);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\ndb_path = \"/tmp/x.db\"").unwrap();
        let cfg = Config::load(file.path()).unwrap();
        assert_eq!(cfg.store.db_path, PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let err = Config::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[pipeline]\nconcurrency = \"many\"").unwrap();
        assert!(matches!(
            Config::load(file.path()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
