use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::pipeline::{CodecEndpoints, OrchestratorSettings, SchedulerSettings};

const ENDPOINT_PREFIX: &str = "FISCAL_ENDPOINT_";

/// Deployment stage read from `APP_ENV`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the worker.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub fiscal: FiscalConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            fiscal: FiscalConfig::from_env()?,
        })
    }
}

/// Bind address of the document and probe endpoints.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Ledger location, worker identity and timing of the submission pipeline.
#[derive(Debug, Clone)]
pub struct FiscalConfig {
    /// `None` keeps the ledger in memory.
    pub ledger_path: Option<PathBuf>,
    /// Where rendered source PDFs are read from.
    pub pdf_dir: PathBuf,
    pub worker_id: String,
    pub scheduler_interval: Duration,
    pub processing_deadline: Duration,
    pub lock_ttl: Duration,
    /// Base URLs keyed by codec family, e.g. `co-dian`.
    pub endpoints: Vec<(String, String)>,
}

impl FiscalConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let ledger_path = env::var("FISCAL_LEDGER_PATH")
            .ok()
            .filter(|path| !path.trim().is_empty() && path != ":memory:")
            .map(PathBuf::from);
        let pdf_dir = env::var("FISCAL_PDF_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("pdfs"));
        let worker_id = env::var("FISCAL_WORKER_ID")
            .ok()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("worker-{}", std::process::id()));

        let mut endpoints: Vec<(String, String)> = env::vars()
            .filter_map(|(key, value)| {
                let family = key.strip_prefix(ENDPOINT_PREFIX)?;
                Some((family.to_ascii_lowercase().replace('_', "-"), value))
            })
            .collect();
        endpoints.sort();

        Ok(Self {
            ledger_path,
            pdf_dir,
            worker_id,
            scheduler_interval: seconds("FISCAL_SCHEDULER_INTERVAL_SECS", 30)?,
            processing_deadline: seconds("FISCAL_PROCESSING_DEADLINE_SECS", 120)?,
            lock_ttl: seconds("FISCAL_LOCK_TTL_SECS", 300)?,
            endpoints,
        })
    }

    pub fn codec_endpoints(&self) -> CodecEndpoints {
        self.endpoints
            .iter()
            .fold(CodecEndpoints::new(), |endpoints, (family, url)| {
                endpoints.with(family, url.clone())
            })
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            worker_id: self.worker_id.clone(),
            deadline: self.processing_deadline,
            lock_ttl: self.lock_ttl,
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            tick: self.scheduler_interval,
            ..SchedulerSettings::default()
        }
    }
}

fn seconds(name: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let Ok(raw) = env::var(name) else {
        return Ok(Duration::from_secs(default));
    };
    match raw.trim().parse::<u64>() {
        Ok(0) | Err(_) => Err(ConfigError::InvalidDuration { name, value: raw }),
        Ok(secs) => Ok(Duration::from_secs(secs)),
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidDuration { name: &'static str, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidDuration { name, value } => {
                write!(f, "{name} must be a positive number of seconds, got '{value}'")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidPort | ConfigError::InvalidDuration { .. } => None,
            ConfigError::InvalidHost { source } => Some(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for key in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "FISCAL_LEDGER_PATH",
            "FISCAL_PDF_DIR",
            "FISCAL_WORKER_ID",
            "FISCAL_SCHEDULER_INTERVAL_SECS",
            "FISCAL_PROCESSING_DEADLINE_SECS",
            "FISCAL_LOCK_TTL_SECS",
        ] {
            env::remove_var(key);
        }
        for (key, _) in env::vars() {
            if key.starts_with(ENDPOINT_PREFIX) {
                env::remove_var(key);
            }
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.fiscal.ledger_path.is_none());
        assert_eq!(config.fiscal.pdf_dir, PathBuf::from("pdfs"));
        assert!(config.fiscal.worker_id.starts_with("worker-"));
        assert_eq!(config.fiscal.scheduler_interval, Duration::from_secs(30));
        assert_eq!(config.fiscal.processing_deadline, Duration::from_secs(120));
        assert_eq!(config.fiscal.lock_ttl, Duration::from_secs(300));
        assert!(config.fiscal.endpoints.is_empty());
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn fiscal_settings_follow_the_environment() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("FISCAL_LEDGER_PATH", "/var/lib/fiscal/ledger.db");
        env::set_var("FISCAL_WORKER_ID", "worker-a");
        env::set_var("FISCAL_PROCESSING_DEADLINE_SECS", "45");
        env::set_var("FISCAL_ENDPOINT_CO_DIAN", "https://vpfe-hab.dian.gov.co");

        let config = AppConfig::load().expect("config loads");
        assert_eq!(
            config.fiscal.ledger_path,
            Some(PathBuf::from("/var/lib/fiscal/ledger.db"))
        );
        let settings = config.fiscal.orchestrator_settings();
        assert_eq!(settings.worker_id, "worker-a");
        assert_eq!(settings.deadline, Duration::from_secs(45));
        assert_eq!(
            config.fiscal.codec_endpoints().base_url("co-dian", "https://default"),
            "https://vpfe-hab.dian.gov.co"
        );
        reset_env();
    }

    #[test]
    fn rejects_zero_and_garbage_durations() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("FISCAL_LOCK_TTL_SECS", "0");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidDuration { name: "FISCAL_LOCK_TTL_SECS", .. })
        ));

        env::set_var("FISCAL_LOCK_TTL_SECS", "five minutes");
        assert!(AppConfig::load().is_err());
        reset_env();
    }
}
