use std::env;

use serde::Deserialize;

/// Top-level flagpanel.toml configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct PanelConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_hostname")]
    pub hostname: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sled,
    Http,
}

/// Where the flag document is kept.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage")]
    pub backend: StorageBackend,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub region: Option<String>,
    #[serde(default = "default_object_key")]
    pub object_key: String,
    /// Bearer token for unsigned object stores.
    pub token: Option<String>,
    /// With both keys set, object store requests are SigV4-signed.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// An operator allowed to sign in. `password_hash` is an Argon2 PHC string
/// as printed by `flagpanel hash-password`.
#[derive(Debug, Deserialize, Clone)]
pub struct OperatorConfig {
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    #[serde(default)]
    pub api_tokens: Vec<String>,
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Mark the session cookie `Secure`; turn off only for plain-HTTP setups.
    #[serde(default = "default_true")]
    pub cookie_secure: bool,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
    /// Filter directives used when `RUST_LOG` is not set.
    pub filter: Option<String>,
}

/// Where the CLI's remote commands send requests.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct RemoteConfig {
    pub url: Option<String>,
    pub token: Option<String>,
}

// ── Default value functions ──────────────────────────

fn default_port() -> u16 {
    8080
}

fn default_hostname() -> String {
    "0.0.0.0".to_string()
}

fn default_storage() -> StorageBackend {
    StorageBackend::Sled
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_object_key() -> String {
    "feature-flags.json".to_string()
}

fn default_session_ttl() -> u64 {
    12 * 60 * 60
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            hostname: default_hostname(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage(),
            data_dir: default_data_dir(),
            endpoint: None,
            bucket: None,
            region: None,
            object_key: default_object_key(),
            token: None,
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_tokens: Vec::new(),
            operators: Vec::new(),
            session_ttl_secs: default_session_ttl(),
            cookie_secure: default_true(),
        }
    }
}

impl AuthConfig {
    /// With no API tokens and no operators nobody can authenticate.
    pub fn is_configured(&self) -> bool {
        !self.api_tokens.is_empty() || !self.operators.is_empty()
    }
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl PanelConfig {
    /// Load configuration from a TOML file, falling back to defaults if the file
    /// doesn't exist or cannot be parsed.
    pub fn load(path: &str) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                eprintln!("Warning: failed to parse {}: {}", path, e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(val) = var("FP_PORT") {
            match val.parse::<u16>() {
                Ok(port) => self.server.port = port,
                Err(_) => eprintln!("Warning: invalid FP_PORT value: {}", val),
            }
        }
        if let Some(val) = var("FP_HOSTNAME") {
            self.server.hostname = val;
        }

        if let Some(val) = var("FP_STORAGE") {
            match val.to_lowercase().as_str() {
                "memory" => self.storage.backend = StorageBackend::Memory,
                "sled" => self.storage.backend = StorageBackend::Sled,
                "http" => self.storage.backend = StorageBackend::Http,
                other => eprintln!("Warning: unknown FP_STORAGE value: {}", other),
            }
        }
        if let Some(val) = var("FP_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Some(val) = var("FP_STORAGE_ENDPOINT") {
            self.storage.endpoint = Some(val);
        }
        if let Some(val) = var("FP_BUCKET") {
            self.storage.bucket = Some(val);
        }
        if let Some(val) = var("FP_REGION") {
            self.storage.region = Some(val);
        }
        if let Some(val) = var("FP_OBJECT_KEY") {
            self.storage.object_key = val;
        }
        if let Some(val) = var("FP_STORAGE_TOKEN") {
            self.storage.token = Some(val);
        }
        if let Some(val) = var("FP_ACCESS_KEY_ID").or_else(|| var("AWS_ACCESS_KEY_ID")) {
            self.storage.access_key_id = Some(val);
        }
        if let Some(val) = var("FP_SECRET_ACCESS_KEY").or_else(|| var("AWS_SECRET_ACCESS_KEY")) {
            self.storage.secret_access_key = Some(val);
        }

        // FP_API_TOKENS: comma separated
        if let Some(val) = var("FP_API_TOKENS") {
            self.auth.api_tokens = split_list(&val);
        }
        if let Some(val) = var("FP_SESSION_TTL_SECS") {
            match val.parse::<u64>() {
                Ok(ttl) => self.auth.session_ttl_secs = ttl,
                Err(_) => eprintln!("Warning: invalid FP_SESSION_TTL_SECS value: {}", val),
            }
        }

        if let Some(val) = var("FP_LOG_FORMAT") {
            match val.to_lowercase().as_str() {
                "pretty" => self.logging.format = LogFormat::Pretty,
                "json" => self.logging.format = LogFormat::Json,
                other => eprintln!("Warning: unknown FP_LOG_FORMAT value: {}", other),
            }
        }

        if let Some(val) = var("FP_URL") {
            self.remote.url = Some(val);
        }
    }
}
