//! Daemon configuration from `CAIRN_*` environment variables

use cairn_core::application::queue::DEFAULT_LEASE_MS;
use cairn_core::application::recurring::DEFAULT_SCHEDULER_INTERVAL;
use cairn_core::error::{AppError, Result};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_DATABASE_URL: &str = "sqlite://~/.cairn/queue.db";
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_QUEUES: &str =
    "bookmark-processing,photo-processing,document-processing,note-processing,task-processing";
const DEFAULT_WORKERS_PER_QUEUE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Redis,
    Postgres,
    Sqlite,
}

impl Backend {
    /// Whether remote workers can share this backend
    pub fn is_distributed(&self) -> bool {
        !matches!(self, Backend::Sqlite)
    }
}

impl FromStr for Backend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Backend::Redis),
            "postgres" | "postgresql" => Ok(Backend::Postgres),
            "sqlite" => Ok(Backend::Sqlite),
            other => Err(AppError::Config(format!(
                "unknown queue backend '{}' (expected redis, postgres or sqlite)",
                other
            ))),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Backend::Redis => "redis",
            Backend::Postgres => "postgres",
            Backend::Sqlite => "sqlite",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceRole {
    /// Producer side only: recurring scheduler
    Api,
    /// Workers, lease recovery and governor sweeps
    Worker,
    All,
}

impl ServiceRole {
    pub fn runs_workers(&self) -> bool {
        matches!(self, ServiceRole::Worker | ServiceRole::All)
    }

    pub fn runs_scheduler(&self) -> bool {
        matches!(self, ServiceRole::Api | ServiceRole::All)
    }
}

impl FromStr for ServiceRole {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api" => Ok(ServiceRole::Api),
            "worker" => Ok(ServiceRole::Worker),
            "all" => Ok(ServiceRole::All),
            other => Err(AppError::Config(format!(
                "unknown service role '{}' (expected api, worker or all)",
                other
            ))),
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceRole::Api => "api",
            ServiceRole::Worker => "worker",
            ServiceRole::All => "all",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub backend: Backend,
    pub role: ServiceRole,
    pub database_url: String,
    pub redis_url: String,
    pub queues: Vec<String>,
    pub workers_per_queue: usize,
    pub lease_ms: i64,
    pub recurring_interval: Duration,
    pub log_format: LogFormat,
    pub log_dir: Option<String>,
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let backend = var("CAIRN_QUEUE_BACKEND")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(Backend::Sqlite);
        let role = var("CAIRN_SERVICE_ROLE")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or(ServiceRole::All);

        let database_url = expand_database_url(
            &var("CAIRN_DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
        );
        let redis_url = var("CAIRN_REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());

        let queues: Vec<String> = var("CAIRN_QUEUES")
            .unwrap_or_else(|| DEFAULT_QUEUES.to_string())
            .split(',')
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(String::from)
            .collect();

        let workers_per_queue =
            parse_number(var("CAIRN_WORKERS_PER_QUEUE"), "CAIRN_WORKERS_PER_QUEUE")?
                .unwrap_or(DEFAULT_WORKERS_PER_QUEUE);
        let lease_ms = parse_number(var("CAIRN_LEASE_MS"), "CAIRN_LEASE_MS")?
            .unwrap_or(DEFAULT_LEASE_MS);
        let recurring_interval = parse_number(
            var("CAIRN_RECURRING_INTERVAL_SECS"),
            "CAIRN_RECURRING_INTERVAL_SECS",
        )?
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SCHEDULER_INTERVAL);

        let log_format = match var("CAIRN_LOG_FORMAT").as_deref() {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };
        let log_dir = var("CAIRN_LOG_DIR").map(|dir| shellexpand::tilde(&dir).into_owned());

        let config = Self {
            backend,
            role,
            database_url,
            redis_url,
            queues,
            workers_per_queue,
            lease_ms,
            recurring_interval,
            log_format,
            log_dir,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backend.is_distributed() && self.role != ServiceRole::All {
            return Err(AppError::Config(format!(
                "backend '{}' cannot be shared across processes; use CAIRN_SERVICE_ROLE=all",
                self.backend
            )));
        }
        if self.role.runs_workers() && self.queues.is_empty() {
            return Err(AppError::Config("CAIRN_QUEUES is empty".to_string()));
        }
        if self.workers_per_queue == 0 {
            return Err(AppError::Config(
                "CAIRN_WORKERS_PER_QUEUE must be at least 1".to_string(),
            ));
        }
        if self.lease_ms < 1_000 {
            return Err(AppError::Config(
                "CAIRN_LEASE_MS must be at least 1000".to_string(),
            ));
        }
        if self.recurring_interval.is_zero() {
            return Err(AppError::Config(
                "CAIRN_RECURRING_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the relational URL points at PostgreSQL (otherwise SQLite)
    pub fn database_is_postgres(&self) -> bool {
        self.database_url.starts_with("postgres://") || self.database_url.starts_with("postgresql://")
    }
}

fn parse_number<T: FromStr>(value: Option<String>, name: &str) -> Result<Option<T>> {
    value
        .map(|v| {
            v.trim()
                .parse()
                .map_err(|_| AppError::Config(format!("{} is not a valid number: '{}'", name, v)))
        })
        .transpose()
}

/// Expand `~` in the path of a `sqlite://` URL
fn expand_database_url(url: &str) -> String {
    match url.strip_prefix("sqlite://") {
        Some(path) => format!("sqlite://{}", shellexpand::tilde(path)),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<DaemonConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.backend, Backend::Sqlite);
        assert_eq!(config.role, ServiceRole::All);
        assert_eq!(config.queues.len(), 5);
        assert_eq!(config.workers_per_queue, 2);
        assert_eq!(config.lease_ms, DEFAULT_LEASE_MS);
        assert_eq!(config.recurring_interval, Duration::from_secs(10));
        assert_eq!(config.log_format, LogFormat::Pretty);
        assert!(!config.database_is_postgres());
    }

    #[test]
    fn test_sqlite_requires_all_role() {
        let err = config_from(&[("CAIRN_SERVICE_ROLE", "worker")]).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        let config = config_from(&[
            ("CAIRN_QUEUE_BACKEND", "postgres"),
            ("CAIRN_SERVICE_ROLE", "worker"),
            ("CAIRN_DATABASE_URL", "postgres://localhost/cairn"),
        ])
        .unwrap();
        assert_eq!(config.role, ServiceRole::Worker);
        assert!(config.database_is_postgres());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(config_from(&[("CAIRN_QUEUE_BACKEND", "kafka")]).is_err());
        assert!(config_from(&[("CAIRN_WORKERS_PER_QUEUE", "many")]).is_err());
        assert!(config_from(&[("CAIRN_WORKERS_PER_QUEUE", "0")]).is_err());
        assert!(config_from(&[("CAIRN_LEASE_MS", "10")]).is_err());
    }

    #[test]
    fn test_queue_list_is_trimmed() {
        let config = config_from(&[("CAIRN_QUEUES", " note-processing , ,photo-processing")]).unwrap();
        assert_eq!(config.queues, vec!["note-processing", "photo-processing"]);
    }

    #[test]
    fn test_roles() {
        assert!(ServiceRole::All.runs_workers() && ServiceRole::All.runs_scheduler());
        assert!(!ServiceRole::Api.runs_workers());
        assert!(!ServiceRole::Worker.runs_scheduler());
        assert_eq!("REDIS".parse::<Backend>().unwrap(), Backend::Redis);
    }
}
