//! Per-station authenticator state and the table that indexes it.

use pnet_base::MacAddr;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::eapol_sm::{EapolStateMachine, SmParams};
use crate::error::{Error, Result};
use crate::timer::TimerId;

const STA_HASH_SIZE: usize = 256;
/// Highest association ID allowed by IEEE 802.11.
const MAX_AID: u16 = 2007;

pub const ETH_P_PAE: u16 = 0x888E;
pub const ETH_P_PREAUTH: u16 = 0x88C7;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationFlags {
    pub authorized: bool,
    pub associated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StationCounters {
    pub eapol_frames_rx: u32,
    pub eapol_frames_tx: u32,
    pub eapol_start_frames_rx: u32,
    pub eapol_logoff_frames_rx: u32,
    pub eap_resp_id_frames_rx: u32,
    pub eap_resp_frames_rx: u32,
    pub eap_req_id_frames_tx: u32,
    pub eap_req_frames_tx: u32,
    pub invalid_eapol_frames_rx: u32,
    pub eap_length_error_frames_rx: u32,
    pub last_eapol_frame_version: u8,
    pub last_eapol_frame_source: Option<MacAddr>,
}

#[derive(Debug, Clone)]
pub struct Station {
    pub addr: MacAddr,
    pub aid: u16,
    pub bss: usize,
    /// Ethertype the station used: normal EAPOL or RSN pre-authentication.
    pub ethertype: u16,
    pub flags: StationFlags,

    pub identity: Option<Vec<u8>>,
    /// Last EAP frame received from the supplicant.
    pub last_eap_supp: Option<Vec<u8>>,
    /// Last EAP frame received from the RADIUS server.
    pub last_eap_radius: Option<Vec<u8>>,
    /// Identifier of the Access-Request currently in flight.
    pub radius_identifier: Option<u8>,
    /// Raw bytes of the last verified RADIUS reply.
    pub last_recv_radius: Option<Vec<u8>>,

    pub eapol_key_sign: Option<Vec<u8>>,
    pub eapol_key_crypt: Option<Vec<u8>>,

    pub sm: EapolStateMachine,
    pub tick_timer: Option<TimerId>,
    pub session_timer: Option<TimerId>,
    pub counters: StationCounters,
}

impl Station {
    fn new(addr: MacAddr, aid: u16, bss: usize, ethertype: u16, params: &SmParams) -> Self {
        Self {
            addr,
            aid,
            bss,
            ethertype,
            flags: StationFlags::default(),
            identity: None,
            last_eap_supp: None,
            last_eap_radius: None,
            radius_identifier: None,
            last_recv_radius: None,
            eapol_key_sign: None,
            eapol_key_crypt: None,
            sm: EapolStateMachine::new(params),
            tick_timer: None,
            session_timer: None,
            counters: StationCounters::default(),
        }
    }

    pub fn identity_str(&self) -> Option<String> {
        self.identity
            .as_deref()
            .map(|id| String::from_utf8_lossy(id).into_owned())
    }

    /// Timers that must be cancelled before the station goes away.
    pub fn timers(&self) -> impl Iterator<Item = TimerId> {
        self.tick_timer.into_iter().chain(self.session_timer)
    }
}

/// Stations hashed by the last octet of their MAC address, plus a list
/// in insertion order.
#[derive(Debug)]
pub struct StationTable {
    buckets: Vec<Vec<Station>>,
    order: Vec<MacAddr>,
    max_stations: usize,
}

fn sta_hash(addr: &MacAddr) -> usize {
    addr.5 as usize % STA_HASH_SIZE
}

impl StationTable {
    pub fn new(max_stations: usize) -> Self {
        Self {
            buckets: (0..STA_HASH_SIZE).map(|_| Vec::new()).collect(),
            order: Vec::new(),
            max_stations,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, addr: &MacAddr) -> Option<&Station> {
        self.buckets[sta_hash(addr)].iter().find(|s| s.addr == *addr)
    }

    pub fn get_mut(&mut self, addr: &MacAddr) -> Option<&mut Station> {
        self.buckets[sta_hash(addr)]
            .iter_mut()
            .find(|s| s.addr == *addr)
    }

    /// Looks up `addr`, creating the station when it is unknown. The boolean
    /// is true when a new entry was created.
    pub fn get_or_create(
        &mut self,
        addr: MacAddr,
        bss: usize,
        ethertype: u16,
        params: &SmParams,
    ) -> Result<(&mut Station, bool)> {
        let bucket = sta_hash(&addr);
        if let Some(pos) = self.buckets[bucket].iter().position(|s| s.addr == addr) {
            return Ok((&mut self.buckets[bucket][pos], false));
        }

        if self.order.len() >= self.max_stations {
            warn!(
                "Station table full ({} entries), not adding {}",
                self.max_stations, addr
            );
            return Err(Error::StationTableFull(self.max_stations, addr));
        }
        let aid = self.free_aid().ok_or(Error::NoFreeAid(addr))?;

        debug!("New station {} (aid {}, bss {})", addr, aid, bss);
        self.order.push(addr);
        let chain = &mut self.buckets[bucket];
        chain.push(Station::new(addr, aid, bss, ethertype, params));
        let last = chain.len() - 1;
        Ok((&mut chain[last], true))
    }

    /// Station whose Access-Request carries RADIUS identifier `id`.
    pub fn lookup_by_radius_id(&self, id: u8) -> Option<MacAddr> {
        self.order
            .iter()
            .filter_map(|addr| self.get(addr))
            .find(|s| s.radius_identifier == Some(id))
            .map(|s| s.addr)
    }

    /// Removes the station from the table and hands it back so the caller
    /// can cancel its timers.
    pub fn free(&mut self, addr: &MacAddr) -> Option<Station> {
        let chain = &mut self.buckets[sta_hash(addr)];
        let pos = chain.iter().position(|s| s.addr == *addr)?;
        let sta = chain.remove(pos);
        self.order.retain(|a| a != addr);
        debug!("Removed station {}", addr);
        Some(sta)
    }

    /// Station addresses in insertion order.
    pub fn addrs(&self) -> Vec<MacAddr> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Station> {
        self.order.iter().filter_map(|addr| self.get(addr))
    }

    fn free_aid(&self) -> Option<u16> {
        let mut used: Vec<u16> = self.iter().map(|s| s.aid).collect();
        used.sort_unstable();
        let mut aid = 1;
        for u in used {
            if u == aid {
                aid += 1;
            } else if u > aid {
                break;
            }
        }
        (aid <= MAX_AID).then_some(aid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(a: u8, b: u8) -> MacAddr {
        MacAddr::new(0x02, 0, 0, 0, a, b)
    }

    #[test]
    fn test_get_or_create_and_collisions() {
        let params = SmParams::default();
        let mut table = StationTable::new(16);

        let (sta, created) = table.get_or_create(mac(1, 0x10), 0, ETH_P_PAE, &params).unwrap();
        assert!(created);
        assert_eq!(sta.aid, 1);
        // Same last octet, same bucket.
        let (sta, created) = table.get_or_create(mac(2, 0x10), 1, ETH_P_PREAUTH, &params).unwrap();
        assert!(created);
        assert_eq!(sta.aid, 2);
        assert_eq!(sta.ethertype, ETH_P_PREAUTH);

        let (sta, created) = table.get_or_create(mac(1, 0x10), 0, ETH_P_PAE, &params).unwrap();
        assert!(!created);
        assert_eq!(sta.aid, 1);

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(&mac(2, 0x10)).map(|s| s.bss), Some(1));
        assert!(table.get(&mac(3, 0x10)).is_none());
        assert_eq!(table.addrs(), vec![mac(1, 0x10), mac(2, 0x10)]);
    }

    #[test]
    fn test_max_stations() {
        let params = SmParams::default();
        let mut table = StationTable::new(2);
        table.get_or_create(mac(0, 1), 0, ETH_P_PAE, &params).unwrap();
        table.get_or_create(mac(0, 2), 0, ETH_P_PAE, &params).unwrap();
        let err = table.get_or_create(mac(0, 3), 0, ETH_P_PAE, &params).unwrap_err();
        assert_eq!(err, Error::StationTableFull(2, mac(0, 3)));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_free_reuses_lowest_aid() {
        let params = SmParams::default();
        let mut table = StationTable::new(8);
        for i in 1..=3 {
            table.get_or_create(mac(0, i), 0, ETH_P_PAE, &params).unwrap();
        }
        let freed = table.free(&mac(0, 2)).unwrap();
        assert_eq!(freed.aid, 2);
        assert!(table.free(&mac(0, 2)).is_none());
        assert_eq!(table.len(), 2);

        let (sta, _) = table.get_or_create(mac(0, 9), 0, ETH_P_PAE, &params).unwrap();
        assert_eq!(sta.aid, 2);
        assert_eq!(table.addrs(), vec![mac(0, 1), mac(0, 3), mac(0, 9)]);
    }

    #[test]
    fn test_lookup_by_radius_id() {
        let params = SmParams::default();
        let mut table = StationTable::new(8);
        table.get_or_create(mac(0, 1), 0, ETH_P_PAE, &params).unwrap();
        let (sta, _) = table.get_or_create(mac(0, 2), 0, ETH_P_PAE, &params).unwrap();
        sta.radius_identifier = Some(42);

        assert_eq!(table.lookup_by_radius_id(42), Some(mac(0, 2)));
        assert_eq!(table.lookup_by_radius_id(7), None);
    }
}
