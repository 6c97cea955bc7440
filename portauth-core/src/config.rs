use pnet_base::MacAddr;
use serde::Deserialize;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

/// The log level for the application, corresponding to syslog levels.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Emerg,
    Alert,
    Crit,
    Err,
    Warning,
    Notice,
    Info,
    Debug,
}

impl LogLevel {
    /// The `tracing` filter directive closest to this syslog level.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Emerg | LogLevel::Alert | LogLevel::Crit | LogLevel::Err => "error",
            LogLevel::Warning => "warn",
            LogLevel::Notice | LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

/// A RADIUS authentication server.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RadiusServerConfig {
    pub addr: Ipv4Addr,
    #[serde(default = "default_radius_auth_port")]
    pub port: u16,
    pub shared_secret: String,
}

/// One BSS (interface) the authenticator serves.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BssConfig {
    pub ifname: String,
    /// MAC address used as source of EAPOL frames and in Called-Station-Id.
    /// Taken from the interface when not set.
    #[serde(default)]
    pub own_addr: Option<MacAddr>,
    /// Servers dedicated to this BSS. An empty list means the global
    /// `auth_servers` are used through the shared socket.
    #[serde(default)]
    pub auth_servers: Vec<RadiusServerConfig>,
}

// Helper functions for default values
fn default_loglevel() -> LogLevel { LogLevel::Info }
fn default_own_ip_addr() -> Ipv4Addr { Ipv4Addr::new(127, 0, 0, 1) }
fn default_radius_auth_port() -> u16 { 1812 }
fn default_eap_reauth_period() -> u32 { 3600 }
fn default_max_stations() -> usize { 1024 }
fn default_quiet_period() -> u32 { 60 }
fn default_tx_period() -> u32 { 30 }
fn default_supp_timeout() -> u32 { 30 }
fn default_server_timeout() -> u32 { 30 }
fn default_max_req() -> u32 { 2 }
fn default_reauth_max() -> u32 { 2 }
fn default_cmdsocket() -> Option<String> { Some("/var/run/portauth.sock".to_string()) }

/// The main configuration for the authenticator.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_loglevel")]
    pub loglevel: LogLevel,

    /// NAS-IP-Address sent in every Access-Request.
    #[serde(default = "default_own_ip_addr")]
    pub own_ip_addr: Ipv4Addr,
    #[serde(default)]
    pub nas_identifier: Option<String>,
    #[serde(default)]
    pub ssid: Option<String>,
    /// Displayable text appended to EAP-Request/Identity.
    #[serde(default)]
    pub eap_req_id_text: Option<String>,

    /// Reauthentication period in seconds; 0 disables reauthentication.
    #[serde(default = "default_eap_reauth_period")]
    pub eap_reauth_period: u32,
    #[serde(default)]
    pub eapol_key_index_workaround: bool,
    /// Length of the broadcast WEP key (5 or 13); 0 disables it.
    #[serde(default)]
    pub default_wep_key_len: usize,
    /// Length of per-station WEP keys (5 or 13); 0 disables them.
    #[serde(default)]
    pub individual_wep_key_len: usize,
    /// Broadcast key rotation period in seconds; 0 disables rekeying.
    #[serde(default)]
    pub wep_rekey_period: u32,

    #[serde(default)]
    pub auth_servers: Vec<RadiusServerConfig>,
    /// Seconds between attempts to return to the primary server; 0 disables.
    #[serde(default)]
    pub radius_retry_primary_interval: u32,

    /// Local Session-Timeout policy in seconds.
    #[serde(default)]
    pub session_timeout: Option<u32>,
    /// Local Idle-Timeout policy in seconds.
    #[serde(default)]
    pub idle_timeout: Option<u32>,

    #[serde(default = "default_max_stations")]
    pub max_stations: usize,

    #[serde(default = "default_quiet_period")]
    pub quiet_period: u32,
    #[serde(default = "default_tx_period")]
    pub tx_period: u32,
    #[serde(default = "default_supp_timeout")]
    pub supp_timeout: u32,
    #[serde(default = "default_server_timeout")]
    pub server_timeout: u32,
    #[serde(default = "default_max_req")]
    pub max_req: u32,
    #[serde(default = "default_reauth_max")]
    pub reauth_max: u32,

    #[serde(default = "default_cmdsocket")]
    pub cmdsocket: Option<String>,

    #[serde(default)]
    pub bss: Vec<BssConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loglevel: default_loglevel(),
            own_ip_addr: default_own_ip_addr(),
            nas_identifier: None,
            ssid: None,
            eap_req_id_text: None,
            eap_reauth_period: default_eap_reauth_period(),
            eapol_key_index_workaround: false,
            default_wep_key_len: 0,
            individual_wep_key_len: 0,
            wep_rekey_period: 0,
            auth_servers: Vec::new(),
            radius_retry_primary_interval: 0,
            session_timeout: None,
            idle_timeout: None,
            max_stations: default_max_stations(),
            quiet_period: default_quiet_period(),
            tx_period: default_tx_period(),
            supp_timeout: default_supp_timeout(),
            server_timeout: default_server_timeout(),
            max_req: default_max_req(),
            reauth_max: default_reauth_max(),
            cmdsocket: default_cmdsocket(),
            bss: vec![BssConfig {
                ifname: "eth0".to_string(),
                own_addr: None,
                auth_servers: Vec::new(),
            }],
        }
    }
}

impl Config {
    /// Checks the cross-field constraints serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.bss.is_empty() {
            return Err(Error::Config("at least one [[bss]] section is required".into()));
        }
        for (name, len) in [
            ("default_wep_key_len", self.default_wep_key_len),
            ("individual_wep_key_len", self.individual_wep_key_len),
        ] {
            if len > 13 {
                return Err(Error::Config(format!("{} must be at most 13, got {}", name, len)));
            }
        }
        if self.auth_servers.is_empty() && self.bss.iter().all(|b| b.auth_servers.is_empty()) {
            return Err(Error::Config("no RADIUS authentication server configured".into()));
        }
        Ok(())
    }

    /// Servers used by the given BSS: its own list, or the global one.
    pub fn servers_for_bss(&self, bss: usize) -> &[RadiusServerConfig] {
        match self.bss.get(bss) {
            Some(b) if !b.auth_servers.is_empty() => &b.auth_servers,
            _ => &self.auth_servers,
        }
    }

    /// Whether EAPOL-Key frames are sent after a successful authentication.
    pub fn key_tx_enabled(&self) -> bool {
        self.default_wep_key_len > 0 || self.individual_wep_key_len > 0
    }
}
