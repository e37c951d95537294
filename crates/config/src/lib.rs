use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

const DEFAULT_CONFIG_FILES: &[&str] = &[
    "lendahand.toml",
    "config/lendahand.toml",
    "crates/config/lendahand.toml",
    "../lendahand.toml",
    "../config/lendahand.toml",
    "../crates/config/lendahand.toml",
    "backend/lendahand.toml",
    "backend/config/lendahand.toml",
    "backend/crates/config/lendahand.toml",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub http: HttpConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub realtime: RealtimeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            database: DatabaseConfig::default(),
            auth: AuthConfig::default(),
            realtime: RealtimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub address: String,
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1".to_string(),
            port: 8085,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://lendahand.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "AuthConfig::default_session_ttl")]
    pub session_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_ttl_seconds: 86_400,
        }
    }
}

impl AuthConfig {
    fn default_session_ttl() -> u64 {
        86_400
    }
}

/// Tunables for the realtime messaging layer.
///
/// ```
/// use lendahand_config::RealtimeConfig;
///
/// let realtime = RealtimeConfig::default();
/// assert_eq!(realtime.typing_ttl_seconds, 6);
/// assert_eq!(realtime.typing_sweep_interval_seconds, 3);
/// assert_eq!(realtime.outbound_queue_depth, 64);
/// assert_eq!(realtime.idle_timeout_seconds, 300);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// How long a typing indicator stays visible without a refresh.
    #[serde(default = "RealtimeConfig::default_typing_ttl")]
    pub typing_ttl_seconds: u64,
    /// Cadence of the background sweep that clears stale typing entries.
    #[serde(default = "RealtimeConfig::default_typing_sweep_interval")]
    pub typing_sweep_interval_seconds: u64,
    /// Capacity of each connection's outbound frame queue. A connection
    /// that cannot drain this many frames is dropped.
    #[serde(default = "RealtimeConfig::default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
    /// Seconds a WebSocket may stay silent before the read loop closes it.
    #[serde(default = "RealtimeConfig::default_idle_timeout")]
    pub idle_timeout_seconds: u64,
}

impl RealtimeConfig {
    const fn default_typing_ttl() -> u64 {
        6
    }

    const fn default_typing_sweep_interval() -> u64 {
        3
    }

    const fn default_outbound_queue_depth() -> usize {
        64
    }

    const fn default_idle_timeout() -> u64 {
        300
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            typing_ttl_seconds: Self::default_typing_ttl(),
            typing_sweep_interval_seconds: Self::default_typing_sweep_interval(),
            outbound_queue_depth: Self::default_outbound_queue_depth(),
            idle_timeout_seconds: Self::default_idle_timeout(),
        }
    }
}

/// Load the application configuration by combining defaults, files, and environment overrides.
///
/// ```
/// use lendahand_config::load;
///
/// std::env::remove_var("LENDAHAND_CONFIG");
///
/// let config = load().expect("configuration should load with defaults");
/// assert!(!config.http.address.is_empty());
/// ```
pub fn load() -> anyhow::Result<AppConfig> {
    let defaults = AppConfig::default();

    let db_max = defaults.database.max_connections as i64;
    let session_ttl = defaults.auth.session_ttl_seconds;
    let session_ttl_i64 = if session_ttl > i64::MAX as u64 {
        i64::MAX
    } else {
        session_ttl as i64
    };

    let mut builder = config::Config::builder();
    builder = builder
        .set_default("http.address", defaults.http.address.clone())
        .unwrap()
        .set_default("http.port", i64::from(defaults.http.port))
        .unwrap()
        .set_default("database.url", defaults.database.url.clone())
        .unwrap()
        .set_default("database.max_connections", db_max)
        .unwrap()
        .set_default("auth.session_ttl_seconds", session_ttl_i64)
        .unwrap()
        .set_default(
            "realtime.typing_ttl_seconds",
            i64::try_from(defaults.realtime.typing_ttl_seconds).unwrap_or(i64::MAX),
        )
        .unwrap()
        .set_default(
            "realtime.typing_sweep_interval_seconds",
            i64::try_from(defaults.realtime.typing_sweep_interval_seconds).unwrap_or(i64::MAX),
        )
        .unwrap()
        .set_default(
            "realtime.outbound_queue_depth",
            defaults.realtime.outbound_queue_depth as i64,
        )
        .unwrap()
        .set_default(
            "realtime.idle_timeout_seconds",
            i64::try_from(defaults.realtime.idle_timeout_seconds).unwrap_or(i64::MAX),
        )
        .unwrap();

    let environment_overrides = config::Environment::with_prefix("LENDAHAND").separator("__");

    let mut config_file_attached = false;

    if let Ok(path) = std::env::var("LENDAHAND_CONFIG") {
        builder = builder.add_source(config::File::from(PathBuf::from(&path)));
        config_file_attached = true;
        debug!(path, "loading configuration via LENDAHAND_CONFIG");
    } else if let Ok(cwd) = std::env::current_dir() {
        let fallback = DEFAULT_CONFIG_FILES
            .iter()
            .map(|candidate| cwd.join(candidate))
            .find(|path| path.exists());

        if let Some(path) = fallback {
            debug!(path = %path.display(), "loading configuration file");
            builder = builder.add_source(config::File::from(path));
            config_file_attached = true;
        }
    }

    if !config_file_attached {
        debug!("no configuration file found, relying on defaults and environment overrides");
    }

    builder = builder.add_source(environment_overrides);

    let cfg = builder.build().context("unable to build configuration")?;

    let mut config = cfg
        .try_deserialize::<AppConfig>()
        .context("invalid configuration")?;

    if config.auth.session_ttl_seconds > i64::MAX as u64 {
        config.auth.session_ttl_seconds = i64::MAX as u64;
    }

    debug!(?config, "loaded backend configuration");
    Ok(config)
}
