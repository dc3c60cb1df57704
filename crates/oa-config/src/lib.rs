//! Environment / orchestrator-driven configuration.
//!
//! Three-tier "later wins" layering: compiled defaults, then the
//! orchestrator's `GET /config` response (each non-null key written into
//! the process environment exactly once), then the process environment.
//! Invalid or missing values never panic: each parse step logs a
//! `tracing::warn!` and falls back to the documented default.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Configuration errors that are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("SERVER_IP is required but missing or invalid")]
    MissingServerIp,
    #[error("SERVER_API_PORT is required but missing or invalid")]
    MissingServerApiPort,
    #[error("CONTROLLER_DECOY_MAC missing from received configuration")]
    MissingDecoyMac,
    #[error("CONTROLLER_DECOY_IP missing from received configuration")]
    MissingDecoyIp,
    #[error("dpid argument missing or not hexadecimal")]
    InvalidDpid,
}

/// `PROTOCOL_SEND_TO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTo {
    Broadcast,
    Orchestrator,
    None,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_ip: IpAddr,
    pub server_api_port: u16,
    pub is_resource: bool,
    pub is_switch: bool,
    pub host_cpu: Option<u32>,
    pub host_ram: Option<f64>,
    pub host_disk: Option<f64>,
    pub resource_limit_percent: f64,
    pub monitor_period: Duration,
    pub simulator_active: bool,
    pub simulator_exec_min: Duration,
    pub simulator_exec_max: Duration,
    pub network_address: Option<String>,
    pub network_stp_enabled: bool,
    pub protocol_send_to: SendTo,
    pub protocol_timeout: Duration,
    pub protocol_retries: u32,
    pub protocol_verbose: bool,
    pub controller_decoy_mac: Option<String>,
    pub controller_decoy_ip: Option<IpAddr>,
    pub orchestrator_udp_port: u16,
    pub orchestrator_udp_timeout: Duration,
}

fn getenv(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_or_warn<T, F>(key: &str, default: T, parse: F) -> T
where
    T: Clone + std::fmt::Debug,
    F: FnOnce(&str) -> Option<T>,
{
    match getenv(key) {
        None => default,
        Some(raw) => match parse(&raw) {
            Some(v) => v,
            None => {
                warn!(%key, %raw, default = ?default, "parameter invalid or missing from received configuration, defaulting");
                default
            }
        },
    }
}

impl Config {
    /// Applies every non-null key from the orchestrator's `/config`
    /// response as a process-scope environment variable.
    pub fn apply_remote(remote: &HashMap<String, Option<Value>>) {
        for (key, value) in remote {
            if let Some(value) = value {
                let as_str = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                // SAFETY: single-threaded startup phase, before any task
                // reads these variables.
                std::env::set_var(key, as_str);
            }
        }
    }

    /// Parses the current process environment. Call after
    /// [`Config::apply_remote`] so orchestrator-pushed values are visible.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_ip: IpAddr = getenv("SERVER_IP")
            .and_then(|v| v.parse().ok())
            .ok_or(ConfigError::MissingServerIp)?;
        let server_api_port: u16 = getenv("SERVER_API_PORT")
            .and_then(|v| v.parse().ok())
            .ok_or(ConfigError::MissingServerApiPort)?;

        let is_resource = parse_or_warn("IS_RESOURCE", false, |v| parse_bool(v));
        let is_switch = parse_or_warn("IS_SWITCH", false, |v| parse_bool(v));

        let host_cpu = getenv("HOST_CPU").and_then(|v| v.parse::<u32>().ok());
        let host_ram = getenv("HOST_RAM").and_then(|v| v.parse::<f64>().ok());
        let host_disk = getenv("HOST_DISK").and_then(|v| v.parse::<f64>().ok());

        // RESOURCE_LIMIT outside [0,100] clamps to 0; the raw value is
        // stored here and oa_ledger::threshold_from_limit_percent performs
        // the actual clamp so the rule lives in one place.
        let resource_limit_percent = parse_or_warn("RESOURCE_LIMIT", 0.0, |v| v.parse::<f64>().ok());

        let monitor_period = parse_or_warn("MONITOR_PERIOD", Duration::from_secs(1), |v| {
            v.parse::<f64>().ok().map(Duration::from_secs_f64)
        });

        let simulator_active = match getenv("SIMULATOR_ACTIVE").map(|v| v.to_uppercase()) {
            Some(v) if v == "TRUE" => true,
            Some(v) if v == "FALSE" => false,
            Some(other) => {
                warn!(value = %other, "SIMULATOR:ACTIVE parameter invalid or missing, defaulting to False");
                false
            }
            None => false,
        };

        let (simulator_exec_min, simulator_exec_max) = parse_sim_exec_range();

        let network_address = getenv("NETWORK_ADDRESS");
        let network_stp_enabled = parse_or_warn("NETWORK_STP_ENABLED", true, |v| parse_bool(v));

        let protocol_send_to = match getenv("PROTOCOL_SEND_TO").as_deref() {
            Some("BROADCAST") => SendTo::Broadcast,
            Some("ORCHESTRATOR") => SendTo::Orchestrator,
            Some("NONE") => SendTo::None,
            _ => SendTo::None,
        };
        // Broadcast mode with STP disabled must degrade to NONE and refuse
        // to initiate requests.
        let protocol_send_to = if protocol_send_to == SendTo::Broadcast && !network_stp_enabled {
            warn!("NETWORK_STP_ENABLED=false, degrading PROTOCOL_SEND_TO from BROADCAST to NONE");
            SendTo::None
        } else {
            protocol_send_to
        };

        let protocol_timeout = parse_or_warn("PROTOCOL_TIMEOUT", Duration::from_secs(1), |v| {
            v.parse::<f64>().ok().map(Duration::from_secs_f64)
        });
        let protocol_retries = parse_or_warn("PROTOCOL_RETRIES", 3, |v| v.parse::<u32>().ok());
        let protocol_verbose = parse_or_warn("PROTOCOL_VERBOSE", false, |v| parse_bool(v));

        let controller_decoy_mac = getenv("CONTROLLER_DECOY_MAC");
        let controller_decoy_ip = getenv("CONTROLLER_DECOY_IP").and_then(|v| v.parse().ok());
        if protocol_send_to == SendTo::Orchestrator {
            if controller_decoy_mac.is_none() {
                return Err(ConfigError::MissingDecoyMac);
            }
            if controller_decoy_ip.is_none() {
                return Err(ConfigError::MissingDecoyIp);
            }
        }

        let orchestrator_udp_port = parse_or_warn("ORCHESTRATOR_UDP_PORT", 7070u16, |v| v.parse().ok());
        let orchestrator_udp_timeout = parse_or_warn("ORCHESTRATOR_UDP_TIMEOUT", Duration::from_secs(1), |v| {
            v.parse::<f64>().ok().map(Duration::from_secs_f64)
        });

        Ok(Config {
            server_ip,
            server_api_port,
            is_resource,
            is_switch,
            host_cpu,
            host_ram,
            host_disk,
            resource_limit_percent,
            monitor_period,
            simulator_active,
            simulator_exec_min,
            simulator_exec_max,
            network_address,
            network_stp_enabled,
            protocol_send_to,
            protocol_timeout,
            protocol_retries,
            protocol_verbose,
            controller_decoy_mac,
            controller_decoy_ip,
            orchestrator_udp_port,
            orchestrator_udp_timeout,
        })
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.to_uppercase().as_str() {
        "TRUE" | "1" => Some(true),
        "FALSE" | "0" => Some(false),
        _ => None,
    }
}

/// `SIMULATOR_EXEC_MAX < SIMULATOR_EXEC_MIN` falls back to `[0, 1]`.
fn parse_sim_exec_range() -> (Duration, Duration) {
    let min = getenv("SIMULATOR_EXEC_MIN").and_then(|v| v.parse::<f64>().ok());
    let max = getenv("SIMULATOR_EXEC_MAX").and_then(|v| v.parse::<f64>().ok());
    match (min, max) {
        (Some(min), Some(max)) if max >= min => {
            (Duration::from_secs_f64(min), Duration::from_secs_f64(max))
        }
        (Some(_), Some(_)) => {
            warn!("SIMULATOR:EXEC_MIN and SIMULATOR:EXEC_MAX invalid, defaulting to [0s, 1s]");
            (Duration::ZERO, Duration::from_secs(1))
        }
        _ => (Duration::ZERO, Duration::from_secs(1)),
    }
}
