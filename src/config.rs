use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Main configuration structure loaded from qna_session.toml and environment variables
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub delegate: DelegateConfig,
    pub events: EventsConfig,
    /// Runtime configuration loaded from environment variables
    #[serde(skip)]
    pub runtime: RuntimeConfig,
}

/// HTTP listener and static asset settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub static_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8820)),
            static_dir: PathBuf::from("public"),
        }
    }
}

/// On-disk layout of the session. Relative paths resolve against `data_dir`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub questions_dir: PathBuf,
    pub answers_dir: PathBuf,
    pub state_file: PathBuf,
    pub context_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            questions_dir: PathBuf::from("questions"),
            answers_dir: PathBuf::from("answers"),
            state_file: PathBuf::from("state.json"),
            context_file: PathBuf::from("context_state.json"),
        }
    }
}

impl StorageConfig {
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }
}

/// How the delegate's stdout is turned into an identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    TrailingLine,
    JsonLine,
}

impl std::str::FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trailing_line" => Ok(OutputFormat::TrailingLine),
            "json_line" | "json" => Ok(OutputFormat::JsonLine),
            other => anyhow::bail!(
                "unknown delegate output format '{}' (expected trailing_line or json_line)",
                other
            ),
        }
    }
}

/// External delegate program settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DelegateConfig {
    pub program: PathBuf,
    pub timeout_ms: u64,
    /// Run at most one delegate invocation at a time
    pub serialize: bool,
    pub output_format: OutputFormat,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("./core_script.sh"),
            timeout_ms: 120_000,
            serialize: false,
            output_format: OutputFormat::TrailingLine,
        }
    }
}

/// Event log settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventsConfig {
    pub log_dir: PathBuf,
    pub debug: bool,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            debug: false,
        }
    }
}

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub log_level: String,
    /// TOML file that was looked for
    pub config_file: PathBuf,
    /// False when the file was absent and defaults were used
    pub config_file_found: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "qna_session=info,tower_http=info".to_string(),
            config_file: PathBuf::from("qna_session.toml"),
            config_file_found: false,
        }
    }
}

impl RuntimeConfig {
    pub fn load_from_env() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "qna_session=info,tower_http=info".to_string()),
            ..Self::default()
        }
    }
}

impl Config {
    /// Load configuration from TOML file and environment variables
    /// Uses QNA_CONFIG environment variable or defaults to "qna_session.toml"
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(None)
    }

    /// Like [`Config::load`], with an explicit config file taking precedence over QNA_CONFIG
    pub fn load_from(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Ok(env_path) = std::env::var("QNA_ENV_FILE") {
            let _ = dotenvy::from_path(env_path);
        } else {
            let _ = dotenvy::from_path(".env");
        }

        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => PathBuf::from(
                std::env::var("QNA_CONFIG").unwrap_or_else(|_| "qna_session.toml".to_string()),
            ),
        };

        // Logging is not up yet; main reports a missing file from `runtime`.
        let content = std::fs::read_to_string(&config_path).ok();
        let mut config: Config = match content.as_deref() {
            Some(content) => toml::from_str(content)?,
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        config.runtime = RuntimeConfig {
            config_file: config_path,
            config_file_found: content.is_some(),
            ..RuntimeConfig::load_from_env()
        };
        config.validate()?;

        Ok(config)
    }

    /// Apply QNA_* environment overrides (env-first)
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(v) = std::env::var("QNA_BIND") {
            self.server.bind = v
                .parse()
                .map_err(|e| anyhow::anyhow!("QNA_BIND '{}' is not a socket address: {}", v, e))?;
        }
        if let Ok(v) = std::env::var("QNA_STATIC_DIR") {
            self.server.static_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("QNA_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("QNA_DELEGATE") {
            self.delegate.program = PathBuf::from(v);
        }
        if let Some(ms) = std::env::var("QNA_DELEGATE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.delegate.timeout_ms = ms;
        }
        if let Ok(v) = std::env::var("QNA_SERIALIZE_DELEGATE") {
            self.delegate.serialize = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("QNA_OUTPUT_FORMAT") {
            self.delegate.output_format = v.parse()?;
        }
        if let Ok(v) = std::env::var("QNA_LOG_DIR") {
            self.events.log_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("QNA_DEBUG") {
            self.events.debug = v == "1" || v.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.delegate.timeout_ms == 0 {
            anyhow::bail!("delegate.timeout_ms must be > 0");
        }
        if self.delegate.program.as_os_str().is_empty() {
            anyhow::bail!("delegate.program cannot be empty");
        }
        Ok(())
    }

    pub fn questions_dir(&self) -> PathBuf {
        self.storage.resolve(&self.storage.questions_dir)
    }

    pub fn answers_dir(&self) -> PathBuf {
        self.storage.resolve(&self.storage.answers_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        self.storage.resolve(&self.storage.state_file)
    }

    pub fn context_file(&self) -> PathBuf {
        self.storage.resolve(&self.storage.context_file)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.storage.resolve(&self.events.log_dir)
    }
}
