use serde::Deserialize;
use std::{env, fs, path::PathBuf, str::FromStr, time::Duration};

use crate::db::DatabaseConfig;

/// Optional on-disk overrides (`orca.json`). Every field may be omitted.
#[derive(Debug, Default, Deserialize)]
pub struct OrcaJsonConfig {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub db_url: Option<String>,
    #[serde(default)]
    pub health: Option<HealthJsonConfig>,
    #[serde(default)]
    pub dispatch_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HealthJsonConfig {
    #[serde(default)]
    pub interval_secs: Option<u64>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub failure_threshold: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Time between two polling rounds.
    pub interval: Duration,
    /// Bound on a single health check call.
    pub timeout: Duration,
    /// Consecutive failed checks before a processor is marked `UNKNOWN`.
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: seconds(env_parse("ORCA_HEALTH_INTERVAL_SECS", 10)),
            timeout: seconds(env_parse("ORCA_HEALTH_TIMEOUT_SECS", 2)),
            failure_threshold: env_parse("ORCA_HEALTH_FAILURE_THRESHOLD", 3u32).max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub bind: String,
    pub database: DatabaseConfig,
    pub health: HealthConfig,
    /// Bound on one `ExecuteDagPart` call, stream included.
    pub dispatch_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind: env::var("ORCA_BIND").unwrap_or_else(|_| "0.0.0.0:3335".to_string()),
            database: DatabaseConfig::default(),
            health: HealthConfig::default(),
            dispatch_timeout: seconds(env_parse("ORCA_DISPATCH_TIMEOUT_SECS", 300)),
        }
    }
}

impl CoordinatorConfig {
    /// Defaults from the environment, overlaid with `orca.json` when one is found.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Some(path) = resolve_orca_json_path() {
            let raw = fs::read_to_string(&path)?;
            let file: OrcaJsonConfig = serde_json::from_str(&expand_env_vars(&raw))?;
            tracing::info!("Loaded coordinator config from {}", path.display());
            config.apply(file);
        }
        Ok(config)
    }

    /// Overlay explicit settings. Zero durations and thresholds are raised to
    /// one second and one failure.
    pub fn apply(&mut self, file: OrcaJsonConfig) {
        if let Some(bind) = file.bind {
            self.bind = bind;
        }
        if let Some(url) = file.db_url {
            self.database.url = url;
        }
        if let Some(secs) = file.dispatch_timeout_secs {
            self.dispatch_timeout = seconds(secs);
        }
        if let Some(health) = file.health {
            if let Some(secs) = health.interval_secs {
                self.health.interval = seconds(secs);
            }
            if let Some(secs) = health.timeout_secs {
                self.health.timeout = seconds(secs);
            }
            if let Some(threshold) = health.failure_threshold {
                self.health.failure_threshold = threshold.max(1);
            }
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

// tokio intervals and timeouts need a non-zero period
fn seconds(secs: u64) -> Duration {
    Duration::from_secs(secs.max(1))
}

pub fn resolve_orca_json_path() -> Option<PathBuf> {
    if let Ok(p) = env::var("ORCA_CONFIG") {
        return Some(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("orca").join("orca.json");
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let candidate = PathBuf::from("orca.json");
    if candidate.exists() {
        return Some(candidate);
    }

    None
}

/// Replace `${NAME}` with the value of the environment variable `NAME`,
/// leaving unknown variables untouched.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next(); // consume '{'
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            if let Ok(val) = env::var(&name) {
                out.push_str(&val);
            } else {
                out.push_str("${");
                out.push_str(&name);
                out.push('}');
            }
        } else {
            out.push(ch);
        }
    }

    out
}
