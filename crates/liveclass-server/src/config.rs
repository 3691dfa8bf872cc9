use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub gateway: GatewayLimits,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Browser origins allowed for CORS and WebSocket upgrades. `"*"` allows
    /// any origin.
    #[serde(default = "default_allowed_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            allowed_origins: default_allowed_origins(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PresenceConfig {
    /// Delay before the participant list is re-broadcast after a departure.
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    #[serde(default = "default_room_idle_ttl_seconds")]
    pub room_idle_ttl_seconds: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_ms: default_disconnect_grace_ms(),
            room_idle_ttl_seconds: default_room_idle_ttl_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct LookupConfig {
    /// User-lookup endpoint. Avatars are disabled when unset.
    pub url: Option<String>,
    #[serde(default = "default_lookup_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_avatar_cache_max_entries")]
    pub avatar_cache_max_entries: u64,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: default_lookup_timeout_ms(),
            avatar_cache_max_entries: default_avatar_cache_max_entries(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GatewayLimits {
    /// Inbound events per connection and minute (0 = unlimited).
    #[serde(default = "default_max_messages_per_minute")]
    pub max_messages_per_minute: u32,
    /// Outbound events queued per connection before it is closed as lagging.
    #[serde(default = "default_outbox_capacity")]
    pub outbox_capacity: usize,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            max_messages_per_minute: default_max_messages_per_minute(),
            outbox_capacity: default_outbox_capacity(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:3001".into()
}
fn default_allowed_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}
fn default_disconnect_grace_ms() -> u64 {
    1500
}
fn default_room_idle_ttl_seconds() -> u64 {
    300
}
fn default_sweep_interval_seconds() -> u64 {
    60
}
fn default_lookup_timeout_ms() -> u64 {
    3000
}
fn default_avatar_cache_max_entries() -> u64 {
    50_000
}
fn default_max_messages_per_minute() -> u32 {
    600
}
fn default_outbox_capacity() -> usize {
    liveclass_core::session::DEFAULT_OUTBOX_CAPACITY
}

/// Generate a commented config file template with the given values filled in.
fn generate_config_template(config: &Config) -> String {
    let origins = config
        .server
        .allowed_origins
        .iter()
        .map(|o| format!("\"{o}\""))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"# Live Class Server Configuration
# Generated automatically on first run. Edit as needed.

[server]
bind_address = "{bind_address}"
# Browser origins allowed to connect. Use ["*"] to allow any origin.
allowed_origins = [{origins}]

[presence]
# Delay before a room's participant list is re-sent after someone leaves.
disconnect_grace_ms = {grace}
# Rooms with no members for this long are dropped with all their state.
room_idle_ttl_seconds = {idle_ttl}
sweep_interval_seconds = {sweep}

[lookup]
# User lookup service resolving avatars (POST {{"ids": [...]}}).
# Leave unset to run without avatars.
# url = "http://localhost:4000/internal/users/lookup"
timeout_ms = {lookup_timeout}
avatar_cache_max_entries = {cache_entries}

[gateway]
# Inbound events per connection and minute; excess events are dropped.
max_messages_per_minute = {max_messages}
# Outbound events a connection may fall behind by before it is closed.
outbox_capacity = {outbox_capacity}
"#,
        bind_address = config.server.bind_address,
        grace = config.presence.disconnect_grace_ms,
        idle_ttl = config.presence.room_idle_ttl_seconds,
        sweep = config.presence.sweep_interval_seconds,
        lookup_timeout = config.lookup.timeout_ms,
        cache_entries = config.lookup.avatar_cache_max_entries,
        max_messages = config.gateway.max_messages_per_minute,
        outbox_capacity = config.gateway.outbox_capacity,
    )
}

// ── Config Loading ───────────────────────────────────────────────────────────

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let mut config = if std::path::Path::new(path).exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file '{path}'"))?;
            toml::from_str(&content).with_context(|| format!("invalid config file '{path}'"))?
        } else {
            tracing::info!(
                "Config file not found at '{}', generating defaults...",
                path
            );
            let config = Config::default();

            // Ensure parent directory exists
            if let Some(parent) = std::path::Path::new(path).parent() {
                fs::create_dir_all(parent)?;
            }

            fs::write(path, generate_config_template(&config))?;
            tracing::info!("Generated default config at '{}'", path);
            config
        };

        config.apply_env_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `LIVECLASS_*` overrides. Values that fail to parse are ignored.
    fn apply_env_overrides<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = var("LIVECLASS_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = var("LIVECLASS_PORT") {
            if let Ok(port) = value.trim().parse::<u16>() {
                self.server.bind_address = replace_port(&self.server.bind_address, port)?;
            }
        }
        if let Some(value) = var("LIVECLASS_ALLOWED_ORIGINS") {
            self.server.allowed_origins = value
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(value) = var("LIVECLASS_DISCONNECT_GRACE_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                self.presence.disconnect_grace_ms = parsed;
            }
        }
        if let Some(value) = var("LIVECLASS_ROOM_IDLE_TTL_SECONDS") {
            if let Ok(parsed) = value.parse::<u64>() {
                self.presence.room_idle_ttl_seconds = parsed;
            }
        }
        if let Some(value) = var("LIVECLASS_LOOKUP_URL") {
            let value = value.trim();
            self.lookup.url = (!value.is_empty()).then(|| value.to_string());
        }
        if let Some(value) = var("LIVECLASS_LOOKUP_TIMEOUT_MS") {
            if let Ok(parsed) = value.parse::<u64>() {
                self.lookup.timeout_ms = parsed;
            }
        }
        if let Some(value) = var("LIVECLASS_MAX_MESSAGES_PER_MINUTE") {
            if let Ok(parsed) = value.parse::<u32>() {
                self.gateway.max_messages_per_minute = parsed;
            }
        }
        if let Some(value) = var("LIVECLASS_OUTBOX_CAPACITY") {
            if let Ok(parsed) = value.parse::<usize>() {
                self.gateway.outbox_capacity = parsed;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.server.allowed_origins.is_empty() {
            bail!("server.allowed_origins must list at least one origin (or \"*\")");
        }
        if self.presence.sweep_interval_seconds == 0 {
            bail!("presence.sweep_interval_seconds must be greater than zero");
        }
        if self.lookup.timeout_ms == 0 {
            bail!("lookup.timeout_ms must be greater than zero");
        }
        if self.gateway.outbox_capacity == 0 {
            bail!("gateway.outbox_capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn core_config(&self) -> liveclass_core::AppConfig {
        liveclass_core::AppConfig {
            disconnect_grace: Duration::from_millis(self.presence.disconnect_grace_ms),
            room_idle_ttl: Duration::from_secs(self.presence.room_idle_ttl_seconds),
            sweep_interval: Duration::from_secs(self.presence.sweep_interval_seconds),
            avatar_cache_max_entries: self.lookup.avatar_cache_max_entries,
            outbox_capacity: self.gateway.outbox_capacity,
        }
    }

    pub fn gateway_config(&self) -> liveclass_ws::GatewayConfig {
        liveclass_ws::GatewayConfig {
            allowed_origins: self.server.allowed_origins.clone(),
            max_messages_per_minute: self.gateway.max_messages_per_minute,
        }
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup.timeout_ms)
    }
}

fn replace_port(bind_address: &str, port: u16) -> Result<String> {
    match bind_address.rsplit_once(':') {
        Some((host, _)) => Ok(format!("{host}:{port}")),
        None => bail!("bind_address '{bind_address}' has no port to replace"),
    }
}
