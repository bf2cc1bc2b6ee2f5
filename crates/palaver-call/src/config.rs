//! Call engine configuration.
//!
//! The STUN list is operational configuration, not behavior: deployments
//! override it through `PALAVER_STUN_SERVERS` without touching code.

use std::time::Duration;

/// ICE servers handed to the peer transport when an endpoint is created.
#[derive(Debug, Clone)]
pub struct IceConfig {
    pub stun_servers: Vec<String>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:global.stun.twilio.com:3478".to_string(),
            ],
        }
    }
}

impl IceConfig {
    /// Load the STUN list from `PALAVER_STUN_SERVERS` (comma-separated),
    /// falling back to the defaults.
    pub fn from_env() -> Self {
        match std::env::var("PALAVER_STUN_SERVERS") {
            Ok(raw) => {
                let servers = parse_stun_list(&raw);
                if servers.is_empty() {
                    tracing::warn!(value = %raw, "Empty PALAVER_STUN_SERVERS, using defaults");
                    Self::default()
                } else {
                    Self {
                        stun_servers: servers,
                    }
                }
            }
            Err(_) => Self::default(),
        }
    }
}

fn parse_stun_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tunables for the call engine.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Bound on waiting for the caller's inbound connection and for local
    /// media readiness after accepting a call.
    pub accept_wait: Duration,

    /// How long a terminal call (ended/rejected) stays on display before
    /// the engine resets to idle.
    pub reset_delay: Duration,

    pub ice: IceConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            accept_wait: Duration::from_secs(10),
            reset_delay: Duration::from_millis(2500),
            ice: IceConfig::default(),
        }
    }
}
