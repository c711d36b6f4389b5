//! Load config from file and environment.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;
use vgc_core::{CoreConfig, Profile, Role};

/// Daemon configuration. File: ~/.config/vgc/config.toml or /etc/vgc/config.toml.
/// Env overrides: VGC_ROLE, VGC_NAME, VGC_PORT, VGC_APP_ID.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Advertised instance name and descriptor vendor name.
    #[serde(default = "default_name")]
    pub name: String,
    /// TCP port for inbound streams (sink and relay). 0 picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_profile")]
    pub profile: Profile,
    #[serde(default)]
    pub supports_motion: bool,
    /// Source only: connect to the first endpoint found.
    #[serde(default)]
    pub auto_connect: bool,
    /// Element name to element name, applied on send.
    #[serde(default)]
    pub mapping: HashMap<String, String>,
    #[serde(default)]
    pub core: CoreConfig,
}

fn default_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "vgc".to_string())
}
fn default_port() -> u16 {
    47000
}
fn default_profile() -> Profile {
    Profile::Extended
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: default_name(),
            port: default_port(),
            profile: default_profile(),
            supports_motion: false,
            auto_connect: false,
            mapping: HashMap::new(),
            core: CoreConfig::default(),
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |key| std::env::var(key).ok());
    c
}

/// Apply `VGC_*` overrides; values that do not parse are ignored with a warning.
pub fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("VGC_ROLE") {
        match s.parse::<Role>() {
            Ok(role) => c.core.role = role,
            Err(e) => warn!("VGC_ROLE: {}", e),
        }
    }
    if let Some(s) = var("VGC_NAME") {
        if !s.is_empty() {
            c.name = s;
        }
    }
    if let Some(s) = var("VGC_PORT") {
        match s.parse::<u16>() {
            Ok(p) => c.port = p,
            Err(_) => warn!(value = %s, "VGC_PORT is not a port number"),
        }
    }
    if let Some(s) = var("VGC_APP_ID") {
        c.core.app_id = s;
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/vgc/config.toml"));
    }
    out.push(PathBuf::from("/etc/vgc/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => warn!(path = %p.display(), "bad config file: {}", e),
                },
                Err(e) => warn!(path = %p.display(), "unreadable config file: {}", e),
            }
            break;
        }
    }
    None
}
