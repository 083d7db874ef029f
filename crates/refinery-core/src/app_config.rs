use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Test,
    Production,
}

impl Environment {
    #[must_use]
    pub fn is_development(self) -> bool {
        matches!(self, Environment::Development | Environment::Test)
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Test => write!(f, "test"),
            Environment::Production => write!(f, "production"),
        }
    }
}

/// Where pipeline state is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    /// Process-local; state is lost on restart.
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Postgres => write!(f, "postgres"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    pub store_backend: StoreBackend,
    /// Present whenever `store_backend` is `Postgres`.
    pub database_url: Option<String>,
    pub env: Environment,
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub ingest_hmac_secret: Option<String>,
    pub pipeline_token: Option<String>,
    pub api_keys: Vec<String>,
    pub pro_api_keys: Vec<String>,
    pub anthropic_api_key: Option<String>,
    pub llm_base_url: Option<String>,
    pub scrubber_model: String,
    pub strategist_model: String,
    pub llm_request_timeout_secs: u64,
    pub llm_max_retries: u32,
    pub llm_retry_backoff_ms: u64,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub pipeline_cron: String,
    pub cleanup_cron: String,
}

fn redact<T>(value: Option<&T>) -> Option<&'static str> {
    value.map(|_| "[redacted]")
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("store_backend", &self.store_backend)
            .field("database_url", &redact(self.database_url.as_ref()))
            .field("env", &self.env)
            .field("bind_addr", &self.bind_addr)
            .field("log_level", &self.log_level)
            .field(
                "ingest_hmac_secret",
                &redact(self.ingest_hmac_secret.as_ref()),
            )
            .field("pipeline_token", &redact(self.pipeline_token.as_ref()))
            .field("api_keys", &format_args!("[{} redacted]", self.api_keys.len()))
            .field(
                "pro_api_keys",
                &format_args!("[{} redacted]", self.pro_api_keys.len()),
            )
            .field("anthropic_api_key", &redact(self.anthropic_api_key.as_ref()))
            .field("llm_base_url", &self.llm_base_url)
            .field("scrubber_model", &self.scrubber_model)
            .field("strategist_model", &self.strategist_model)
            .field("llm_request_timeout_secs", &self.llm_request_timeout_secs)
            .field("llm_max_retries", &self.llm_max_retries)
            .field("llm_retry_backoff_ms", &self.llm_retry_backoff_ms)
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field("scheduler_enabled", &self.scheduler_enabled)
            .field("pipeline_cron", &self.pipeline_cron)
            .field("cleanup_cron", &self.cleanup_cron)
            .finish()
    }
}
