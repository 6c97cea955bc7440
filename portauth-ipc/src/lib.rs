use pnet_base::MacAddr;
use portauth_core::eapol_sm::{AuthPaeState, BeAuthState, KeyTxState, ReauthTimerState};
use portauth_core::station::StationCounters;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Command {
    List,
    Disconnect { mac: MacAddr },
    Reauthenticate { mac: MacAddr },
}

/// Snapshot of one station as reported by `List`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StationInfo {
    pub addr: MacAddr,
    pub aid: u16,
    pub bss: usize,
    pub identity: Option<String>,
    pub authorized: bool,
    pub auth_pae: AuthPaeState,
    pub be_auth: BeAuthState,
    pub reauth_timer: ReauthTimerState,
    pub key_tx: KeyTxState,
    pub counters: StationCounters,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum Response {
    Stations(Vec<StationInfo>),
    Success,
    Error(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json() {
        let cmd = Command::Disconnect { mac: MacAddr::new(2, 0, 0, 0, 0, 0x10) };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }
}
