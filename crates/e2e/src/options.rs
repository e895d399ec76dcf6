//! Harness options and SUT config rendering

use std::path::{Path, PathBuf};
use std::time::Duration;

use arbor_common::config::{
    AuthConfig, BotConfig, DatabaseConfig, FederationConfig, InstanceConfig, ListenConfig,
    LlmConfig,
};
use arbor_common::{ServerConfig, FLOWS_DB_FILE, METRICS_DB_FILE, NODES_DB_FILE, RESULTS_DB_FILE};

use crate::error::{E2eError, E2eResult};

/// Environment variable overriding the SUT binary location
pub const SUT_BIN_ENV: &str = "ARBOR_SUT_BIN";
pub const ANTHROPIC_KEY_ENV: &str = "ANTHROPIC_API_KEY";
pub const GEMINI_KEY_ENV: &str = "GEMINI_API_KEY";

/// Where the SUT binary lives when nothing overrides it, relative to the
/// workspace root.
pub const DEFAULT_SUT_BINARY: &str = "target/debug/arbor";

/// Everything the harness needs to start a SUT
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Path to the SUT binary (None = env override, then default location)
    pub binary_path: Option<PathBuf>,

    pub jwt_secret: String,
    pub token_expiry_min: i64,
    pub instance_id: String,
    pub instance_name: String,
    pub bot: BotConfig,

    /// Empty keys disable the provider
    pub anthropic_api_key: String,
    pub gemini_api_key: String,

    /// Deadline for the SUT to answer its health endpoint
    pub startup_timeout: Duration,

    /// Grace period between SIGTERM and kill
    pub shutdown_timeout: Duration,

    /// Per-request HTTP timeout
    pub request_timeout: Duration,

    /// Results database; kept outside the temp dir so it survives runs
    pub results_path: PathBuf,

    /// Forward the SUT's stdout/stderr to ours
    pub forward_output: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            binary_path: None,
            jwt_secret: "arbor-e2e-test-secret-do-not-use-in-production".to_string(),
            token_expiry_min: 60,
            instance_id: "e2e-instance".to_string(),
            instance_name: "Arbor E2E".to_string(),
            bot: BotConfig::default(),
            anthropic_api_key: String::new(),
            gemini_api_key: String::new(),
            startup_timeout: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(60),
            results_path: PathBuf::from(RESULTS_DB_FILE),
            forward_output: true,
        }
    }
}

impl HarnessOptions {
    /// Defaults plus `ARBOR_SUT_BIN` and the LLM provider keys.
    pub fn from_env() -> Self {
        let env = |key: &str| std::env::var(key).unwrap_or_default();
        Self {
            binary_path: std::env::var_os(SUT_BIN_ENV).map(PathBuf::from),
            anthropic_api_key: env(ANTHROPIC_KEY_ENV),
            gemini_api_key: env(GEMINI_KEY_ENV),
            ..Self::default()
        }
    }

    pub fn with_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.binary_path = Some(path.into());
        self
    }

    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = path.into();
        self
    }

    /// True when any LLM provider key is configured.
    pub fn has_llm(&self) -> bool {
        !self.anthropic_api_key.is_empty() || !self.gemini_api_key.is_empty()
    }

    /// Resolve the SUT binary: explicit option, env override, default location.
    pub fn resolve_binary(&self) -> E2eResult<PathBuf> {
        let path = self
            .binary_path
            .clone()
            .or_else(|| std::env::var_os(SUT_BIN_ENV).map(PathBuf::from))
            .unwrap_or_else(|| workspace_root().join(DEFAULT_SUT_BINARY));

        if path.is_file() {
            Ok(path)
        } else {
            Err(E2eError::BinaryNotFound(path))
        }
    }

    /// Render the SUT config for a server listening on `port` with its
    /// databases inside `data_dir`.
    pub fn render_config(&self, port: u16, data_dir: &Path) -> ServerConfig {
        ServerConfig {
            server: ListenConfig {
                listen: format!("127.0.0.1:{}", port),
                cert_path: String::new(),
                key_path: String::new(),
            },
            database: DatabaseConfig {
                path: data_dir.join(NODES_DB_FILE),
                flows_path: data_dir.join(FLOWS_DB_FILE),
                metrics_path: data_dir.join(METRICS_DB_FILE),
            },
            auth: AuthConfig {
                jwt_secret: self.jwt_secret.clone(),
                token_expiry_min: self.token_expiry_min,
            },
            instance: InstanceConfig {
                id: self.instance_id.clone(),
                name: self.instance_name.clone(),
            },
            bot: self.bot.clone(),
            // Never federate out of a test run.
            federation: FederationConfig::default(),
            llm: LlmConfig {
                anthropic_api_key: self.anthropic_api_key.clone(),
                gemini_api_key: self.gemini_api_key.clone(),
            },
        }
    }
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(2)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}
