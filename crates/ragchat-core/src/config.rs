//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RagChatError, Result};
use crate::types::{ChatOptions, ChunkingStrategy, DocumentSet};

/// Environment variable that overrides `api.base_url`.
pub const BASE_URL_ENV: &str = "RAGCHAT_API_URL";

const DEFAULT_BASE_URL: &str = "http://localhost:7860";

/// Top-level ragchat configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api: Option<ApiConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatDefaults>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Connect timeout in seconds. Streaming reads are never timed out.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

/// Defaults applied to every chat request unless overridden on the command line.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_set: Option<DocumentSet>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<ChunkingStrategy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_reranking: Option<bool>,
}

/// Constraints checked by the front-end before a document upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Maximum file size in bytes (default: 1 MiB).
    #[serde(default = "default_max_upload_bytes")]
    pub max_bytes: u64,

    /// Allowed file extensions, without the dot (default: txt, md).
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_upload_bytes(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

fn default_max_upload_bytes() -> u64 {
    1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    vec!["txt".into(), "md".into()]
}

impl UploadConfig {
    /// Reject files the backend would refuse anyway.
    pub fn validate(&self, filename: &str, size: u64) -> Result<()> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        let allowed = ext
            .as_deref()
            .is_some_and(|e| self.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(e)));
        if !allowed {
            return Err(RagChatError::Upload(format!(
                "unsupported file type for {filename} (allowed: {})",
                self.allowed_extensions.join(", ")
            )));
        }
        if size > self.max_bytes {
            return Err(RagChatError::Upload(format!(
                "{filename} is {size} bytes, limit is {}",
                self.max_bytes
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "ragchat_client=trace").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

static ENV_REF: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex"));

/// Substitute `${ENV_VAR}` patterns with their environment values (empty if unset).
fn substitute_env_vars(input: &str) -> String {
    ENV_REF
        .replace_all(input, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        debug!(path = %path.display(), "Loading config");
        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted).map_err(|e| RagChatError::Config(e.to_string()))
    }

    /// Default config file location.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Backend base URL: `RAGCHAT_API_URL`, then the config file, then the default.
    pub fn base_url(&self) -> String {
        let from_env = std::env::var(BASE_URL_ENV).ok().filter(|v| !v.is_empty());
        let url = from_env
            .or_else(|| self.api.as_ref().and_then(|a| a.base_url.clone()))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        url.trim_end_matches('/').to_string()
    }

    pub fn request_timeout_secs(&self) -> Option<u64> {
        self.api.as_ref().and_then(|a| a.request_timeout_secs)
    }

    pub fn chat_options(&self) -> ChatOptions {
        let defaults = self.chat.clone().unwrap_or_default();
        ChatOptions {
            document_set: defaults.document_set,
            strategy: defaults.strategy,
            use_reranking: defaults.use_reranking,
        }
    }

    pub fn upload(&self) -> UploadConfig {
        self.upload.clone().unwrap_or_default()
    }

    /// Check values that parse fine but cannot work.
    pub fn validate(&self) -> Result<()> {
        let url = self.base_url();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(RagChatError::Config(format!(
                "base URL must start with http:// or https://, got {url}"
            )));
        }
        if let Some(logging) = &self.logging {
            if !matches!(logging.format.as_str(), "plain" | "json") {
                return Err(RagChatError::Config(format!(
                    "unknown log format: {}",
                    logging.format
                )));
            }
        }
        Ok(())
    }
}

/// Base directory for ragchat data: `~/.ragchat/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ragchat")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, variable name unique to this test
        unsafe { std::env::set_var("TEST_RAGCHAT_SUB", "http://example.test") };
        let result = substitute_env_vars(r#"{"url": "${TEST_RAGCHAT_SUB}", "other": "plain"}"#);
        assert!(result.contains("http://example.test"));
        assert!(result.contains("plain"));
        unsafe { std::env::remove_var("TEST_RAGCHAT_SUB") };
    }

    #[test]
    fn test_env_var_missing() {
        let result = substitute_env_vars(r#"{"key": "${NONEXISTENT_VAR_RAGCHAT_TEST}"}"#);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let config = Config::load(Path::new("/nonexistent/ragchat.json")).unwrap();
        assert!(config.api.is_none());
        assert_eq!(config.upload().max_bytes, 1024 * 1024);
    }

    #[test]
    fn test_load_json5_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are fine in JSON5
                api: { base_url: "https://rag.example.com/" },
                chat: { strategy: "large", use_reranking: true },
                upload: { max_bytes: 10 },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(
            config.api.as_ref().unwrap().base_url.as_deref(),
            Some("https://rag.example.com/")
        );
        let opts = config.chat_options();
        assert_eq!(opts.strategy, Some(ChunkingStrategy::Large));
        assert_eq!(opts.use_reranking, Some(true));
        assert!(opts.document_set.is_none());
        assert_eq!(config.upload().max_bytes, 10);
        assert_eq!(config.upload().allowed_extensions, vec!["txt", "md"]);
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ api: ").unwrap();
        assert!(matches!(Config::load(&path), Err(RagChatError::Config(_))));
    }

    #[test]
    fn test_upload_validation() {
        let upload = UploadConfig::default();
        assert!(upload.validate("notes.txt", 100).is_ok());
        assert!(upload.validate("README.MD", 100).is_ok());
        assert!(matches!(
            upload.validate("image.png", 100),
            Err(RagChatError::Upload(_))
        ));
        assert!(matches!(
            upload.validate("no_extension", 100),
            Err(RagChatError::Upload(_))
        ));
        assert!(matches!(
            upload.validate("big.txt", 2 * 1024 * 1024),
            Err(RagChatError::Upload(_))
        ));
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_logging_default_matches_serde_default() {
        let built = LoggingConfig::default();
        let parsed: LoggingConfig = json5::from_str("{}").unwrap();
        assert_eq!(built.format, parsed.format);
        assert_eq!(built.output, parsed.output);
        assert_eq!(built.format, "plain");
        assert_eq!(built.output, "stderr");

        let config = Config {
            logging: Some(LoggingConfig::default()),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_unknown_log_format() {
        let config: Config = json5::from_str(
            r#"{ api: { base_url: "http://localhost:1" }, logging: { format: "xml" } }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
