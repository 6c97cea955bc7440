//! Error types shared by the authenticator crates.

use pnet_base::MacAddr;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The station table reached `max_stations`
    #[error("Station table full ({0} entries), cannot add {1}")]
    StationTableFull(usize, MacAddr),

    /// No free association ID is left
    #[error("No free association ID for {0}")]
    NoFreeAid(MacAddr),
}
