use envconfig::Envconfig;
use std::net::SocketAddr;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Log level used when RUST_LOG is not set
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Path to the pipeline configuration file (JSON); defaults apply
    /// when unset
    #[envconfig(from = "PIPELINE_CONFIG")]
    pub pipeline_config: Option<String>,

    /// Journal file for crash recovery; durability is disabled when unset
    #[envconfig(from = "STORAGE_PATH")]
    pub storage_path: Option<String>,

    /// Scope ingest rate-limit keys per client address
    #[envconfig(from = "PER_CLIENT_KEYS", default = "false")]
    pub per_client_keys: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }
}
