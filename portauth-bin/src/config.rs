use anyhow::Result;
use clap::Parser;
use portauth_core::Config;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    #[clap(short, long, value_parser, default_value = "/etc/portauth/portauth.toml")]
    pub config_file: PathBuf,
}

pub fn load_config() -> Result<Config> {
    let args = Args::parse();
    load_config_from_path(&args.config_file)
}

pub fn load_config_from_path(path: &Path) -> Result<Config> {
    let config_contents = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&config_contents)?;
    config.validate()?;
    info!("Loaded configuration from {}", path.display());
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
eap_reauth_period = 600

[[auth_servers]]
addr = "192.0.2.10"
shared_secret = "testing123"

[[bss]]
ifname = "wlan0"
"#
        )
        .unwrap();

        let config = load_config_from_path(file.path()).unwrap();
        assert_eq!(config.eap_reauth_period, 600);
        assert_eq!(config.auth_servers[0].port, 1812);
        assert_eq!(config.bss[0].ifname, "wlan0");
    }

    #[test]
    fn test_load_config_rejects_missing_servers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[bss]]\nifname = \"wlan0\"").unwrap();
        assert!(load_config_from_path(file.path()).is_err());
    }
}
