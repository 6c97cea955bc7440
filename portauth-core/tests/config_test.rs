use portauth_core::{Config, LogLevel, SmParams};
use pnet_base::MacAddr;
use std::net::Ipv4Addr;

fn load_test_config() -> Config {
    let config_contents =
        std::fs::read_to_string("tests/portauth.toml").expect("Failed to read config file");
    toml::from_str(&config_contents).expect("Failed to parse config file")
}

#[test]
fn test_load_general_config() {
    let config = load_test_config();
    assert_eq!(config.loglevel, LogLevel::Debug);
    assert_eq!(config.own_ip_addr, Ipv4Addr::new(192, 168, 1, 2));
    assert_eq!(config.nas_identifier, Some("ap1.example.net".to_string()));
    assert_eq!(config.ssid, Some("corp".to_string()));
    assert_eq!(config.eap_req_id_text, Some("Welcome".to_string()));
    assert_eq!(config.cmdsocket, Some("/tmp/portauth-test.sock".to_string()));
    assert_eq!(config.max_stations, 64);
    assert!(config.validate().is_ok());
}

#[test]
fn test_load_radius_config() {
    let config = load_test_config();
    assert_eq!(config.auth_servers.len(), 2);
    assert_eq!(config.auth_servers[0].addr, Ipv4Addr::new(192, 168, 1, 10));
    assert_eq!(config.auth_servers[0].port, 1812);
    assert_eq!(config.auth_servers[1].port, 11812);
    assert_eq!(config.auth_servers[1].shared_secret, "other");
    assert_eq!(config.radius_retry_primary_interval, 600);
}

#[test]
fn test_load_bss_config() {
    let config = load_test_config();
    assert_eq!(config.bss.len(), 2);
    assert_eq!(config.bss[0].ifname, "wlan0");
    assert_eq!(config.bss[0].own_addr, Some(MacAddr::new(2, 0, 0, 0, 0, 1)));
    assert!(config.bss[0].auth_servers.is_empty());
    assert_eq!(config.servers_for_bss(0).len(), 2);
    assert_eq!(config.servers_for_bss(1)[0].shared_secret, "bss1secret");
}

#[test]
fn test_state_machine_params() {
    let config = load_test_config();
    let params = SmParams::from(&config);
    assert_eq!(params.reauth_period, 1800);
    assert_eq!(params.tx_period, 10);
    assert_eq!(params.quiet_period, 60);
    assert_eq!(params.max_req, 2);
    assert!(params.key_tx_enabled);
    assert_eq!(config.session_timeout, Some(7200));
    assert_eq!(config.idle_timeout, None);
}

#[test]
fn test_defaults_from_empty_file() {
    let config: Config = toml::from_str("").expect("Failed to parse empty config");
    assert_eq!(config.eap_reauth_period, 3600);
    assert_eq!(config.supp_timeout, 30);
    assert!(config.bss.is_empty());
    assert!(config.validate().is_err());
}
