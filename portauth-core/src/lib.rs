pub mod config;
pub mod eapol_sm;
pub mod error;
pub mod station;
pub mod timer;

pub use config::{BssConfig, Config, LogLevel, RadiusServerConfig};
pub use eapol_sm::{EapolStateMachine, SmAction, SmParams};
pub use error::{Error, Result};
pub use station::{Station, StationTable};
pub use timer::{Scheduler, TimerId};

impl From<&Config> for SmParams {
    fn from(config: &Config) -> Self {
        Self {
            quiet_period: config.quiet_period,
            tx_period: config.tx_period,
            reauth_max: config.reauth_max,
            supp_timeout: config.supp_timeout,
            server_timeout: config.server_timeout,
            max_req: config.max_req,
            reauth_period: config.eap_reauth_period,
            key_tx_enabled: config.key_tx_enabled(),
        }
    }
}
