use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub vision: VisionConfig,
    pub llm: LlmConfig,
    pub validation: ValidationConfig,
    pub concurrency: ConcurrencyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection string, e.g. "sqlite://data/radiotag.db"
    pub path: String,
}

/// Vision model mode: local in-process inference, a remote HTTP
/// endpoint, or a canned mock for tests and local demos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionMode {
    Local,
    Remote,
    Mock,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Auto,
    Cpu,
    Gpu,
    Accelerator,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub mode: VisionMode,
    /// Local mode only: HF-style model identifier.
    pub model_id: String,
    /// Local mode only.
    pub device: Device,
    /// Local mode only: where weights are cached on disk.
    pub cache_dir: String,
    /// Remote mode only.
    pub endpoint_url: String,
    /// Remote mode only, default 600s.
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub request_timeout_seconds: u64,
    /// Remote mode only.
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub structured_output_model: String,
    pub summary_model: String,
    pub chat_model: String,
    /// Per-call timeout for Validator/Enhancer/SummaryGenerator/ChatTool calls, default 60s.
    #[serde(deserialize_with = "deserialize_duration_secs")]
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// `max_attempts` passed to `Validator::validate`, default 2.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// VisionTool worker-pool bound, default 1 (one model replica).
    pub vision_worker_pool_size: usize,
    /// Concurrent remote LLM call bound.
    pub llm_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Command line arguments for configuration overrides.
#[derive(Parser, Debug, Clone)]
#[command(name = "radiotag")]
#[command(version, about = "Medical image annotation pipeline")]
pub struct CommandLineArgs {
    /// Path to configuration file.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<String>,

    /// Database path (overrides config file), e.g. "sqlite://data/radiotag.db".
    #[arg(long, value_name = "URL", global = true)]
    pub database_path: Option<String>,

    /// Vision tool mode: local, remote, or mock (overrides config file).
    #[arg(long, value_name = "MODE", global = true)]
    pub vision_mode: Option<String>,

    /// Vision remote endpoint URL (overrides config file).
    #[arg(long, value_name = "URL", global = true)]
    pub vision_endpoint_url: Option<String>,

    /// LLM API key (overrides config file).
    #[arg(long, value_name = "KEY", global = true)]
    pub llm_api_key: Option<String>,

    /// Validation retry count (overrides config file).
    #[arg(long, value_name = "N", global = true)]
    pub max_attempts: Option<u32>,

    /// Logging level, e.g. "info,radiotag=debug" (overrides config file).
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<crate::cli::Command>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file
    /// support. Priority, highest first: CLI args > env vars (`RADIOTAG_*`) >
    /// config file > defaults.
    pub fn load(cli_args: &CommandLineArgs) -> anyhow::Result<Self> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Supported environment variables:
    /// - `RADIOTAG_DATABASE_PATH`
    /// - `RADIOTAG_VISION_MODE`
    /// - `RADIOTAG_VISION_ENDPOINT_URL`
    /// - `RADIOTAG_LLM_API_KEY`
    /// - `RADIOTAG_MAX_ATTEMPTS`
    /// - `RADIOTAG_LOG_LEVEL`
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RADIOTAG_DATABASE_PATH") {
            self.database.path = v;
        }
        if let Ok(v) = std::env::var("RADIOTAG_VISION_MODE") {
            match parse_vision_mode(&v) {
                Ok(mode) => self.vision.mode = mode,
                Err(e) => tracing::warn!("invalid RADIOTAG_VISION_MODE '{}': {}", v, e),
            }
        }
        if let Ok(v) = std::env::var("RADIOTAG_VISION_ENDPOINT_URL") {
            self.vision.endpoint_url = v;
        }
        if let Ok(v) = std::env::var("RADIOTAG_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("RADIOTAG_MAX_ATTEMPTS")
            && let Ok(n) = v.parse()
        {
            self.validation.max_attempts = n;
        }
        if let Ok(v) = std::env::var("RADIOTAG_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(v) = &args.database_path {
            self.database.path = v.clone();
        }
        if let Some(v) = &args.vision_mode {
            match parse_vision_mode(v) {
                Ok(mode) => self.vision.mode = mode,
                Err(e) => tracing::warn!("invalid --vision-mode '{}': {}", v, e),
            }
        }
        if let Some(v) = &args.vision_endpoint_url {
            self.vision.endpoint_url = v.clone();
        }
        if let Some(v) = &args.llm_api_key {
            self.llm.api_key = Some(v.clone());
        }
        if let Some(v) = args.max_attempts {
            self.validation.max_attempts = v;
        }
        if let Some(v) = &args.log_level {
            self.logging.level = v.clone();
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.database.path.is_empty() {
            anyhow::bail!("database.path cannot be empty");
        }
        if self.validation.max_attempts == 0 {
            anyhow::bail!("validation.max_attempts must be >= 1");
        }
        if self.concurrency.vision_worker_pool_size == 0 {
            anyhow::bail!("concurrency.vision_worker_pool_size must be >= 1");
        }
        if self.concurrency.llm_concurrency == 0 {
            anyhow::bail!("concurrency.llm_concurrency must be >= 1");
        }
        if self.vision.mode == VisionMode::Remote && self.vision.endpoint_url.is_empty() {
            anyhow::bail!("vision.endpoint_url is required when vision.mode = remote");
        }
        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths = ["conf/config.toml", "config.toml", "./conf/config.toml"];
        possible_paths.iter().find(|p| Path::new(p).exists()).map(|p| p.to_string())
    }

    fn from_toml(path: &str) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

fn parse_vision_mode(s: &str) -> Result<VisionMode, String> {
    match s.to_lowercase().as_str() {
        "local" => Ok(VisionMode::Local),
        "remote" => Ok(VisionMode::Remote),
        "mock" => Ok(VisionMode::Mock),
        other => Err(format!("unsupported vision mode: {other}")),
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "sqlite://data/radiotag.db".to_string() }
    }
}

impl Default for VisionMode {
    fn default() -> Self {
        Self::Mock
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::Auto
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            mode: VisionMode::default(),
            model_id: "llava-med-v1.5".to_string(),
            device: Device::default(),
            cache_dir: "data/models".to_string(),
            endpoint_url: String::new(),
            request_timeout_seconds: 600,
            auth_token: None,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://api.openai.com/v1".to_string(),
            structured_output_model: "gpt-4o-mini".to_string(),
            summary_model: "gpt-4o-mini".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            request_timeout_seconds: 60,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self { max_attempts: 2 }
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { vision_worker_pool_size: 1, llm_concurrency: 4 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info,radiotag=debug".to_string(), file: None }
    }
}

// =========================
// Helpers for parsing values
// =========================

fn parse_duration_to_secs(input: &str) -> Result<u64, String> {
    if let Ok(val) = input.parse::<u64>() {
        return Ok(val);
    }

    let s = input.trim().to_lowercase();
    let (num_str, unit) = s.split_at(s.chars().take_while(|c| c.is_ascii_digit()).count());
    if num_str.is_empty() || unit.is_empty() {
        return Err("missing number or unit".into());
    }
    let n: u64 = num_str.parse().map_err(|_| "invalid number".to_string())?;
    match unit {
        "s" | "sec" | "secs" | "second" | "seconds" => Ok(n),
        "m" | "min" | "mins" | "minute" | "minutes" => Ok(n * 60),
        "h" | "hr" | "hour" | "hours" => Ok(n * 60 * 60),
        _ => Err(format!("unsupported unit: {unit}")),
    }
}

fn deserialize_duration_secs<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct Visitor;
    impl<'de> serde::de::Visitor<'de> for Visitor {
        type Value = u64;
        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "a number of seconds or a string like '30s', '5m', '1h'")
        }
        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }
        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            if v >= 0 { Ok(v as u64) } else { Err(E::custom("negative not allowed")) }
        }
        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(v).map_err(E::custom)
        }
        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            parse_duration_to_secs(&v).map_err(E::custom)
        }
    }
    deserializer.deserialize_any(Visitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn remote_mode_requires_endpoint() {
        let mut config = Config::default();
        config.vision.mode = VisionMode::Remote;
        assert!(config.validate().is_err());
        config.vision.endpoint_url = "https://vision.example.com".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration_to_secs("30").unwrap(), 30);
        assert_eq!(parse_duration_to_secs("5m").unwrap(), 300);
        assert_eq!(parse_duration_to_secs("1h").unwrap(), 3600);
        assert!(parse_duration_to_secs("bogus").is_err());
    }
}
