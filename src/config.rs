// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Server configuration: the `[global]` section, one or more pool
//! sections, and the INI-like file format that carries them.
//!
//! Duration values accept `humantime` literals (`10s`, `2m`, `90 seconds`)
//! or a bare integer of seconds. Lines starting with `;` or `#` are
//! comments.

use crate::{
    error::{ServerError, ServerResult},
    net::ListenAddr,
};
use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::warn;

/// The three scheduling policies of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessManager {
    /// Fixed worker count, paid upfront
    Static,
    /// Adaptive worker count between spare bounds
    Dynamic,
    /// Workers spawned per demand, retired when long idle
    OnDemand,
}

impl FromStr for ProcessManager {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(ProcessManager::Static),
            "dynamic" => Ok(ProcessManager::Dynamic),
            "ondemand" => Ok(ProcessManager::OnDemand),
            other => Err(ServerError::ConfigInvalid {
                reason: format!("unknown pm mode `{other}`"),
            }),
        }
    }
}

impl Display for ProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessManager::Static => "static",
            ProcessManager::Dynamic => "dynamic",
            ProcessManager::OnDemand => "ondemand",
        })
    }
}

/// Keys of the `[global]` section.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// PID file path
    pub pid: Option<PathBuf>,
    /// Error log path (the sink lives above the core)
    pub error_log: Option<PathBuf>,
    /// Log level name: debug, info, notice, warning, error
    pub log_level: String,
    /// Future hook; parsed and stored, nothing acts on it
    pub emergency_restart_threshold: u32,
    /// Future hook; parsed and stored, nothing acts on it
    pub emergency_restart_interval: Duration,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            pid: None,
            error_log: None,
            log_level: "notice".to_owned(),
            emergency_restart_threshold: 0,
            emergency_restart_interval: Duration::ZERO,
        }
    }
}

impl GlobalConfig {
    /// Maps the configured log level onto a tracing level.
    pub fn tracing_level(&self) -> tracing::Level {
        match self.log_level.as_str() {
            "debug" => tracing::Level::DEBUG,
            "warning" => tracing::Level::WARN,
            "error" => tracing::Level::ERROR,
            _ => tracing::Level::INFO,
        }
    }
}

/// Keys of one pool section.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool name (the section header)
    pub name: String,
    /// Listen address
    pub listen: ListenAddr,
    /// Configured socket backlog, reported by the status endpoint
    pub listen_backlog: u32,
    /// Scheduling policy
    pub pm: ProcessManager,
    /// Upper bound on the worker count in every mode
    pub max_children: usize,
    /// Workers spawned at start (dynamic)
    pub start_servers: usize,
    /// Lower idle threshold (dynamic)
    pub min_spare_servers: usize,
    /// Upper idle threshold (dynamic)
    pub max_spare_servers: usize,
    /// Recycle a worker after this many requests; 0 = unlimited
    pub max_requests: u64,
    /// Retire an on-demand worker idle longer than this
    pub process_idle_timeout: Duration,
    /// Per-request deadline; zero = unlimited
    pub request_terminate_timeout: Duration,
    /// Slow log path; parsed and stored as an extension point
    pub slowlog: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::named("www")
    }
}

impl PoolConfig {
    /// A pool with the default shape under the given name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            listen: ListenAddr::default(),
            listen_backlog: 511,
            pm: ProcessManager::Dynamic,
            max_children: 5,
            start_servers: 2,
            min_spare_servers: 1,
            max_spare_servers: 3,
            max_requests: 0,
            process_idle_timeout: Duration::from_secs(10),
            request_terminate_timeout: Duration::ZERO,
            slowlog: None,
        }
    }

    /// Checks the shape invariants of the configured policy.
    pub fn validate(&self) -> ServerResult<()> {
        let reject = |reason: String| {
            Err(ServerError::ConfigInvalid {
                reason: format!("pool `{}`: {reason}", self.name),
            })
        };

        if self.max_children == 0 {
            return reject("pm.max_children must be at least 1".to_owned());
        }
        if self.pm == ProcessManager::Dynamic {
            if self.start_servers < 1 || self.start_servers > self.max_children {
                return reject(format!(
                    "pm.start_servers ({}) must be within 1..=pm.max_children ({})",
                    self.start_servers, self.max_children
                ));
            }
            if self.min_spare_servers < 1 {
                return reject("pm.min_spare_servers must be at least 1".to_owned());
            }
            if self.min_spare_servers > self.start_servers
                || self.start_servers > self.max_spare_servers
            {
                return reject(format!(
                    "pm.start_servers ({}) must be within pm.min_spare_servers ({}) ..= pm.max_spare_servers ({})",
                    self.start_servers, self.min_spare_servers, self.max_spare_servers
                ));
            }
            if self.max_spare_servers > self.max_children {
                return reject(format!(
                    "pm.max_spare_servers ({}) must not exceed pm.max_children ({})",
                    self.max_spare_servers, self.max_children
                ));
            }
        }
        if self.pm == ProcessManager::OnDemand && self.process_idle_timeout.is_zero() {
            return reject("pm.process_idle_timeout must be positive for ondemand".to_owned());
        }
        Ok(())
    }
}

/// The whole configuration: `[global]` plus one or more pools.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// The `[global]` section
    pub global: GlobalConfig,
    /// Pool sections in file order
    pub pools: Vec<PoolConfig>,
}

impl ServerConfig {
    /// A configuration with one default pool, used when no file is given.
    pub fn with_default_pool() -> Self {
        Self {
            global: GlobalConfig::default(),
            pools: vec![PoolConfig::default()],
        }
    }

    /// Reads and parses a configuration file.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| ServerError::ConfigInvalid {
            reason: format!("cannot read `{}`: {err}", path.display()),
        })?;
        Self::parse(&text)
    }

    /// Parses the INI-like format.
    pub fn parse(text: &str) -> ServerResult<Self> {
        enum Section {
            None,
            Global,
            Pool(usize),
        }

        let mut config = ServerConfig::default();
        let mut section = Section::None;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                section = if name == "global" {
                    Section::Global
                } else {
                    config.pools.push(PoolConfig::named(name));
                    Section::Pool(config.pools.len() - 1)
                };
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| {
                ServerError::ConfigInvalid {
                    reason: format!("line {}: expected `key = value`", lineno + 1),
                }
            })?;
            let (key, value) = (key.trim(), value.trim());

            match section {
                Section::None => {
                    return Err(ServerError::ConfigInvalid {
                        reason: format!("line {}: `{key}` outside of any section", lineno + 1),
                    });
                }
                Section::Global => Self::apply_global(&mut config.global, key, value)?,
                Section::Pool(index) => Self::apply_pool(&mut config.pools[index], key, value)?,
            }
        }

        if config.pools.is_empty() {
            return Err(ServerError::ConfigInvalid {
                reason: "no pool section defined".to_owned(),
            });
        }
        Ok(config)
    }

    /// Validates every pool.
    pub fn validate(&self) -> ServerResult<()> {
        for pool in &self.pools {
            pool.validate()?;
        }
        Ok(())
    }

    fn apply_global(global: &mut GlobalConfig, key: &str, value: &str) -> ServerResult<()> {
        match key {
            "pid" => global.pid = Some(PathBuf::from(value)),
            "error_log" => global.error_log = Some(PathBuf::from(value)),
            "log_level" => global.log_level = value.to_owned(),
            "emergency_restart_threshold" => {
                global.emergency_restart_threshold = parse_int(key, value)? as u32;
            }
            "emergency_restart_interval" => {
                global.emergency_restart_interval = parse_duration(key, value)?;
            }
            _ => warn!(key, "Ignoring unknown global key."),
        }
        Ok(())
    }

    fn apply_pool(pool: &mut PoolConfig, key: &str, value: &str) -> ServerResult<()> {
        match key {
            "listen" => pool.listen = value.parse()?,
            "listen.backlog" => pool.listen_backlog = parse_int(key, value)? as u32,
            "pm" => pool.pm = value.parse()?,
            "pm.max_children" => pool.max_children = parse_int(key, value)? as usize,
            "pm.start_servers" => pool.start_servers = parse_int(key, value)? as usize,
            "pm.min_spare_servers" => pool.min_spare_servers = parse_int(key, value)? as usize,
            "pm.max_spare_servers" => pool.max_spare_servers = parse_int(key, value)? as usize,
            "pm.max_requests" => pool.max_requests = parse_int(key, value)?,
            "pm.process_idle_timeout" => pool.process_idle_timeout = parse_duration(key, value)?,
            "request_terminate_timeout" => {
                pool.request_terminate_timeout = parse_duration(key, value)?;
            }
            "slowlog" => pool.slowlog = Some(PathBuf::from(value)),
            _ => warn!(pool = %pool.name, key, "Ignoring unknown pool key."),
        }
        Ok(())
    }
}

fn parse_int(key: &str, value: &str) -> ServerResult<u64> {
    value.parse().map_err(|_| ServerError::ConfigInvalid {
        reason: format!("`{key}`: `{value}` is not an integer"),
    })
}

/// Parses `Ns`, `Nm`, any `humantime` literal, or a bare integer of
/// seconds.
pub fn parse_duration(key: &str, value: &str) -> ServerResult<Duration> {
    humantime::parse_duration(value)
        .or_else(|_| value.parse::<u64>().map(Duration::from_secs))
        .map_err(|_| ServerError::ConfigInvalid {
            reason: format!("`{key}`: `{value}` is not a duration"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
; fpm configuration
[global]
pid = /run/fpm.pid
log_level = debug
emergency_restart_threshold = 10
emergency_restart_interval = 1m

[www]
listen = 127.0.0.1:9000
listen.backlog = 128
pm = dynamic
pm.max_children = 8
pm.start_servers = 2
pm.min_spare_servers = 2
pm.max_spare_servers = 4
pm.max_requests = 500
request_terminate_timeout = 30s
slowlog = /var/log/fpm-slow.log

# a second pool on a unix socket
[admin]
listen = /run/fpm-admin.sock
pm = ondemand
pm.max_children = 2
pm.process_idle_timeout = 10s
"#;

    #[test]
    fn parses_sample() {
        let config = ServerConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.global.pid, Some(PathBuf::from("/run/fpm.pid")));
        assert_eq!(config.global.log_level, "debug");
        assert_eq!(config.global.emergency_restart_threshold, 10);
        assert_eq!(config.global.emergency_restart_interval, Duration::from_secs(60));

        assert_eq!(config.pools.len(), 2);
        let www = &config.pools[0];
        assert_eq!(www.name, "www");
        assert_eq!(www.pm, ProcessManager::Dynamic);
        assert_eq!(www.max_children, 8);
        assert_eq!(www.min_spare_servers, 2);
        assert_eq!(www.max_requests, 500);
        assert_eq!(www.request_terminate_timeout, Duration::from_secs(30));
        assert_eq!(www.listen_backlog, 128);
        assert_eq!(www.slowlog, Some(PathBuf::from("/var/log/fpm-slow.log")));

        let admin = &config.pools[1];
        assert_eq!(admin.pm, ProcessManager::OnDemand);
        assert_eq!(
            admin.listen,
            ListenAddr::Unix(PathBuf::from("/run/fpm-admin.sock"))
        );

        config.validate().unwrap();
    }

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("k", "5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("k", "2m").unwrap(), Duration::from_secs(120));
        assert_eq!(
            parse_duration("k", "90 seconds").unwrap(),
            Duration::from_secs(90)
        );
        assert_eq!(parse_duration("k", "7").unwrap(), Duration::from_secs(7));
        assert!(parse_duration("k", "soon").is_err());
    }

    #[test]
    fn key_outside_section_rejected() {
        assert!(ServerConfig::parse("pm = static\n").is_err());
    }

    #[test]
    fn malformed_line_rejected() {
        assert!(ServerConfig::parse("[www]\npm.max_children\n").is_err());
    }

    #[test]
    fn dynamic_invariants_enforced() {
        let mut pool = PoolConfig::default();
        pool.validate().unwrap();

        pool.min_spare_servers = 3;
        pool.start_servers = 2;
        assert!(pool.validate().is_err());

        let mut pool = PoolConfig::default();
        pool.max_spare_servers = 99;
        assert!(pool.validate().is_err());

        let mut pool = PoolConfig::default();
        pool.max_children = 0;
        assert!(pool.validate().is_err());
    }

    #[test]
    fn ondemand_needs_idle_timeout() {
        let mut pool = PoolConfig::default();
        pool.pm = ProcessManager::OnDemand;
        pool.process_idle_timeout = Duration::ZERO;
        assert!(pool.validate().is_err());
    }

    #[test]
    fn unknown_keys_ignored() {
        let config = ServerConfig::parse("[www]\nfuture_knob = 1\n").unwrap();
        assert_eq!(config.pools.len(), 1);
    }
}
