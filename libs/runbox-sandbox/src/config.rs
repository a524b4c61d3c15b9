// Sandbox settings: backend selection and per-run resource limits

use runbox_common::config::{env_parse, env_var, ConfigError};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Per-stream capture limit for stdout and stderr
pub const DEFAULT_OUTPUT_LIMIT: usize = 1024 * 1024;

/// Which isolation strategy executes commands. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Host subprocess in a temp dir. No CPU/memory/network isolation; dev only.
    Direct,
    /// Network-less, resource-bounded container per run.
    Docker,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" | "local" | "process" => Ok(BackendKind::Direct),
            "docker" | "container" | "isolated" => Ok(BackendKind::Docker),
            other => Err(format!("unknown backend '{}' (expected direct or docker)", other)),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Direct => write!(f, "direct"),
            BackendKind::Docker => write!(f, "docker"),
        }
    }
}

/// Limits applied uniformly to every run. Memory, CPU and PIDs bound the
/// container; the output limit bounds host-side capture for both backends.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub cpus: f64,
    pub pids_limit: i64,
    pub output_limit_bytes: usize,
}

impl ResourceLimits {
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1_000_000_000.0) as i64
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 512 * 1024 * 1024,
            cpus: 0.5,
            pids_limit: 128,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub backend: BackendKind,
    pub timeout: Duration,
    pub limits: ResourceLimits,
    pub default_image: String,
    /// Per-language image overrides keyed by language id
    pub images: HashMap<String, String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::Docker,
            timeout: Duration::from_secs(30),
            limits: ResourceLimits::default(),
            default_image: DEFAULT_IMAGE.to_string(),
            images: HashMap::new(),
        }
    }
}

impl SandboxSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let memory_bytes = match env_var("RUNBOX_SANDBOX_MEMORY") {
            Some(raw) => parse_memory_limit(&raw)
                .ok_or_else(|| ConfigError::invalid("RUNBOX_SANDBOX_MEMORY", &raw, "expected e.g. 512m or 1g"))?,
            None => defaults.limits.memory_bytes,
        };

        let output_limit_bytes = match env_var("RUNBOX_SANDBOX_OUTPUT_LIMIT") {
            Some(raw) => parse_memory_limit(&raw)
                .and_then(|bytes| usize::try_from(bytes).ok())
                .ok_or_else(|| ConfigError::invalid("RUNBOX_SANDBOX_OUTPUT_LIMIT", &raw, "expected e.g. 64k or 1m"))?,
            None => defaults.limits.output_limit_bytes,
        };

        let cpus: f64 = env_parse("RUNBOX_SANDBOX_CPUS", defaults.limits.cpus)?;
        if !valid_cpus(cpus) {
            return Err(ConfigError::invalid("RUNBOX_SANDBOX_CPUS", &cpus.to_string(), "must be a positive number"));
        }

        let timeout_secs: u64 = env_parse("RUNBOX_SANDBOX_TIMEOUT", defaults.timeout.as_secs())?;
        if timeout_secs == 0 {
            return Err(ConfigError::invalid("RUNBOX_SANDBOX_TIMEOUT", "0", "must be at least 1 second"));
        }

        let mut images = HashMap::new();
        for language in ["python", "node", "go", "rust"] {
            let key = format!("RUNBOX_{}_IMAGE", language.to_uppercase());
            if let Some(image) = env_var(&key) {
                images.insert(language.to_string(), image);
            }
        }

        Ok(Self {
            backend: env_parse("RUNBOX_BACKEND", defaults.backend)?,
            timeout: Duration::from_secs(timeout_secs),
            limits: ResourceLimits {
                memory_bytes,
                cpus,
                pids_limit: env_parse("RUNBOX_SANDBOX_PIDS_LIMIT", defaults.limits.pids_limit)?,
                output_limit_bytes,
            },
            default_image: env_var("RUNBOX_DEFAULT_IMAGE").unwrap_or(defaults.default_image),
            images,
        })
    }
}

/// NaN and infinities would turn into a zero (unlimited) CPU quota
fn valid_cpus(cpus: f64) -> bool {
    cpus.is_finite() && cpus > 0.0
}

/// Parse a memory limit string ("512m", "1g", "1024k", plain bytes) to bytes
pub fn parse_memory_limit(limit: &str) -> Option<i64> {
    let limit = limit.trim().to_lowercase();
    let digits_end = limit
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(limit.len());
    let (num_str, unit) = limit.split_at(digits_end);

    let num: i64 = num_str.parse().ok()?;
    let multiplier = match unit {
        "" | "b" => 1,
        "k" | "kb" => 1024,
        "m" | "mb" => 1024 * 1024,
        "g" | "gb" => 1024 * 1024 * 1024,
        _ => return None,
    };

    num.checked_mul(multiplier).filter(|bytes| *bytes > 0)
}
