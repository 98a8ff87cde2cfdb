use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DroverError, Result};
use crate::payload::{Execute, Payload, XmlFilter, XslFilter};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

// ── Top-level config ────────────────────────────────────────────────

/// Full configuration for one scheduler run.
///
/// Parsed from `drover.toml` with support for environment variable overrides.
/// Constructed once and handed to the controller and the worker pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DroverConfig {
    /// Worker pool sizing and process launch settings.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Fixed delays and timeouts used by the controller and workers.
    #[serde(default)]
    pub timing: TimingConfig,

    /// Batch to submit. Empty means the default demonstration batch.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
}

// ── Section configs ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Address the workers bind to and the controller connects to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the first worker; the rest follow contiguously.
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Worker entry point, launched as
    /// `<worker_program> [worker_args..] <port> --host <host> --grace-ms <ms>`.
    #[serde(default = "default_worker_program")]
    pub worker_program: PathBuf,

    /// Leading arguments for launcher-style programs (`python worker.py`, `sh -c ...`).
    #[serde(default)]
    pub worker_args: Vec<String>,

    /// Pool size override. `None` = one worker per detected core.
    #[serde(default)]
    pub cores: Option<usize>,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_base_port() -> u16 {
    8800
}

fn default_worker_program() -> PathBuf {
    PathBuf::from("drover-worker")
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            base_port: default_base_port(),
            worker_program: default_worker_program(),
            worker_args: Vec::new(),
            cores: None,
        }
    }
}

/// Timing section. All values are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wait after spawning before the first connection attempt.
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,

    /// Interval at which `start()` re-checks whether the pool is connected.
    #[serde(default = "default_start_poll")]
    pub start_poll_ms: u64,

    /// Upper bound on establishing one worker connection.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Delay after Ready before the one-off status probe. 0 disables it.
    #[serde(default = "default_status_check_delay")]
    pub status_check_delay_ms: u64,

    /// How long a worker lingers after acknowledging `terminate`.
    #[serde(default = "default_terminate_grace")]
    pub terminate_grace_ms: u64,

    /// How long to wait for worker processes to exit before killing them.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

fn default_startup_delay() -> u64 {
    1000
}

fn default_start_poll() -> u64 {
    500
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_status_check_delay() -> u64 {
    3000
}

fn default_terminate_grace() -> u64 {
    500
}

fn default_shutdown_timeout() -> u64 {
    5000
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            startup_delay_ms: default_startup_delay(),
            start_poll_ms: default_start_poll(),
            connect_timeout_ms: default_connect_timeout(),
            status_check_delay_ms: default_status_check_delay(),
            terminate_grace_ms: default_terminate_grace(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

impl TimingConfig {
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    pub fn start_poll(&self) -> Duration {
        Duration::from_millis(self.start_poll_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// `None` when the status probe is disabled.
    pub fn status_check_delay(&self) -> Option<Duration> {
        (self.status_check_delay_ms > 0).then(|| Duration::from_millis(self.status_check_delay_ms))
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// One `[[tasks]]` entry: an optional display name plus the tagged payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(flatten)]
    pub payload: Payload,
}

// ── Loading & Validation ────────────────────────────────────────────

impl DroverConfig {
    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Named payloads to submit, in order.
    ///
    /// Falls back to the demonstration batch `xml_filter, xsl_filter, xml_filter`
    /// when the config lists no tasks. Unnamed tasks are called `<kind>-<index>`.
    pub fn batch(&self) -> Vec<(String, Payload)> {
        let specs: Vec<TaskSpec> = if self.tasks.is_empty() {
            vec![
                Payload::from(XmlFilter::default()),
                Payload::from(XslFilter::default()),
                Payload::from(XmlFilter::default()),
            ]
            .into_iter()
            .map(|payload| TaskSpec {
                name: None,
                payload,
            })
            .collect()
        } else {
            self.tasks.clone()
        };

        specs
            .into_iter()
            .enumerate()
            .map(|(idx, spec)| {
                let name = spec
                    .name
                    .unwrap_or_else(|| format!("{}-{idx}", spec.payload.label()));
                (name, spec.payload)
            })
            .collect()
    }

    // ── Environment variable overrides ──────────────────────────────

    /// Apply environment variable overrides.
    ///
    /// Convention: `DROVER_SECTION_KEY` overrides `section.key`.
    /// - `DROVER_POOL_HOST` → `pool.host`
    /// - `DROVER_POOL_BASE_PORT` → `pool.base_port`
    /// - `DROVER_POOL_CORES` → `pool.cores`
    /// - `DROVER_POOL_WORKER_PROGRAM` → `pool.worker_program`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup. Unparseable numbers are ignored.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("DROVER_POOL_HOST") {
            self.pool.host = v;
        }
        if let Some(v) = lookup("DROVER_POOL_BASE_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.pool.base_port = port;
            }
        }
        if let Some(v) = lookup("DROVER_POOL_CORES") {
            if let Ok(cores) = v.parse::<usize>() {
                self.pool.cores = Some(cores);
            }
        }
        if let Some(v) = lookup("DROVER_POOL_WORKER_PROGRAM") {
            self.pool.worker_program = PathBuf::from(v);
        }
    }

    /// Validate the config: pool override, ports, program path, poll interval.
    pub fn validate(&self) -> Result<()> {
        if self.pool.cores == Some(0) {
            return Err(DroverError::Config(
                "pool.cores must be positive when set".into(),
            ));
        }
        if self.pool.base_port == 0 {
            return Err(DroverError::Config("pool.base_port must be non-zero".into()));
        }
        if self.pool.worker_program.as_os_str().is_empty() {
            return Err(DroverError::Config("pool.worker_program is empty".into()));
        }
        if self.pool.host.is_empty() {
            return Err(DroverError::Config("pool.host is empty".into()));
        }
        if self.timing.start_poll_ms == 0 {
            return Err(DroverError::Config(
                "timing.start_poll_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  pool:    host={}, base_port={}, program={} {}, cores={}",
            self.pool.host,
            self.pool.base_port,
            self.pool.worker_program.display(),
            self.pool.worker_args.join(" "),
            self.pool
                .cores
                .map_or_else(|| "auto".to_string(), |c| c.to_string())
        );
        tracing::info!(
            "  timing:  startup={}ms, poll={}ms, connect_timeout={}ms, grace={}ms",
            self.timing.startup_delay_ms,
            self.timing.start_poll_ms,
            self.timing.connect_timeout_ms,
            self.timing.terminate_grace_ms
        );
        tracing::info!("  tasks:   {}", self.tasks.len());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn parse_empty_toml_gives_defaults() {
        let cfg: DroverConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.pool.host, "127.0.0.1");
        assert_eq!(cfg.pool.base_port, 8800);
        assert_eq!(cfg.pool.worker_program, PathBuf::from("drover-worker"));
        assert!(cfg.pool.cores.is_none());
        assert_eq!(cfg.timing.startup_delay(), Duration::from_secs(1));
        assert_eq!(cfg.timing.start_poll(), Duration::from_millis(500));
        assert_eq!(cfg.timing.terminate_grace(), Duration::from_millis(500));
        assert!(cfg.tasks.is_empty());
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[pool]
host = "0.0.0.0"
base_port = 9100
worker_program = "/usr/bin/python3"
worker_args = ["-m", "drover_worker"]
cores = 3

[timing]
startup_delay_ms = 10
status_check_delay_ms = 0

[[tasks]]
name = "first"
kind = "xml_filter"
iterations = 1000

[[tasks]]
kind = "xsl_filter"
max_angle_deg = 30
"#;
        let cfg: DroverConfig = toml::from_str(toml).unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.pool.base_port, 9100);
        assert_eq!(cfg.pool.cores, Some(3));
        assert_eq!(cfg.pool.worker_args, vec!["-m", "drover_worker"]);
        assert_eq!(cfg.timing.startup_delay(), Duration::from_millis(10));
        assert!(cfg.timing.status_check_delay().is_none());
        assert_eq!(cfg.timing.connect_timeout_ms, 5000); // default

        assert_eq!(cfg.tasks.len(), 2);
        assert_eq!(cfg.tasks[0].name.as_deref(), Some("first"));
        assert_eq!(cfg.tasks[0].payload, Payload::from(XmlFilter::new(1000)));
        match &cfg.tasks[1].payload {
            Payload::XslFilter(f) => {
                assert_eq!(f.max_angle_deg, 30);
                assert_eq!(f.iterations, 2_000_000);
            }
            other => panic!("expected xsl_filter, got {other:?}"),
        }
    }

    #[test]
    fn unknown_task_kind_is_rejected() {
        let toml = r#"
[[tasks]]
kind = "pdf_filter"
"#;
        assert!(toml::from_str::<DroverConfig>(toml).is_err());
    }

    #[test]
    fn zero_cores_is_invalid() {
        let mut cfg = DroverConfig::default();
        cfg.pool.cores = Some(0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("pool.cores"));
    }

    #[test]
    fn from_toml_validates() {
        let err = DroverConfig::from_toml("[pool]\ncores = 0").unwrap_err();
        assert!(matches!(err, DroverError::Config(_)));

        let cfg = DroverConfig::from_toml("[pool]\nbase_port = 9300").unwrap();
        assert_eq!(cfg.pool.base_port, 9300);
        assert!(cfg.pool.worker_args.is_empty());
    }

    #[test]
    fn zero_poll_interval_is_invalid() {
        let mut cfg = DroverConfig::default();
        cfg.timing.start_poll_ms = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("timing.start_poll_ms"));

        assert!(DroverConfig::from_toml("[timing]\nstart_poll_ms = 0").is_err());
    }

    #[test]
    fn empty_program_is_invalid() {
        let mut cfg = DroverConfig::default();
        cfg.pool.worker_program = PathBuf::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn overrides_apply_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("DROVER_POOL_HOST", "10.0.0.5"),
            ("DROVER_POOL_BASE_PORT", "9900"),
            ("DROVER_POOL_CORES", "6"),
            ("DROVER_POOL_WORKER_PROGRAM", "./target/debug/drover-worker"),
        ]);
        let mut cfg = DroverConfig::default();
        cfg.apply_overrides_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.pool.host, "10.0.0.5");
        assert_eq!(cfg.pool.base_port, 9900);
        assert_eq!(cfg.pool.cores, Some(6));
        assert_eq!(
            cfg.pool.worker_program,
            PathBuf::from("./target/debug/drover-worker")
        );
    }

    #[test]
    fn unparseable_override_is_ignored() {
        let mut cfg = DroverConfig::default();
        cfg.apply_overrides_from(|k| (k == "DROVER_POOL_BASE_PORT").then(|| "lots".to_string()));
        assert_eq!(cfg.pool.base_port, 8800);
    }

    #[test]
    fn default_batch_mirrors_demo_chain() {
        let batch = DroverConfig::default().batch();
        let names: Vec<&str> = batch.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["xml_filter-0", "xsl_filter-1", "xml_filter-2"]);
    }

    #[test]
    fn configured_batch_keeps_order_and_names() {
        let mut cfg = DroverConfig::default();
        cfg.tasks = vec![
            TaskSpec {
                name: None,
                payload: Payload::from(XslFilter::new(5)),
            },
            TaskSpec {
                name: Some("named".into()),
                payload: Payload::from(XmlFilter::new(5)),
            },
        ];
        let batch = cfg.batch();
        assert_eq!(batch[0].0, "xsl_filter-0");
        assert_eq!(batch[1].0, "named");
        assert_eq!(batch[1].1, Payload::from(XmlFilter::new(5)));
    }
}
