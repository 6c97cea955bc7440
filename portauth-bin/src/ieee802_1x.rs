//! IEEE 802.1X protocol handler: EAPOL in and out, Access-Request
//! construction, RADIUS reply interpretation and EAPOL-Key distribution.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pnet_base::MacAddr;
use portauth_core::eapol_sm::BeAuthState;
use portauth_core::station::{ETH_P_PAE, ETH_P_PREAUTH};
use portauth_net::crypto::{self, CryptoError};
use portauth_net::eap::{EapCode, EapError, EapPacket, EapType};
use portauth_net::eapol::{
    build_eapol, EapolError, EapolKey, EapolPacket, EapolType, EAPOL_KEY_INDEX_UNICAST,
    EAPOL_KEY_TYPE_RC4, EAPOL_VERSION, EAPOL_VERSION_2,
};
use portauth_net::radius::{
    RadiusAttributeType, RADIUS_NAS_PORT_TYPE_IEEE_802_11, RADIUS_TERMINATION_ACTION_DEFAULT,
    RADIUS_TERMINATION_ACTION_RADIUS_REQUEST,
};
use portauth_net::{RadiusCode, RadiusMsg, RadiusMsgType, RxOutcome};
use tracing::{debug, info, warn};

use crate::driver::{DriverRequest, KeyTarget};
use crate::{Authenticator, Timer, EAPOL_TICK};

const FRAMED_MTU: u32 = 1400;
/// Seconds between 1900-01-01 and 1970-01-01.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

fn mac_dashes(addr: &MacAddr) -> String {
    format!(
        "{:02X}-{:02X}-{:02X}-{:02X}-{:02X}-{:02X}",
        addr.0, addr.1, addr.2, addr.3, addr.4, addr.5
    )
}

/// 64-bit NTP timestamp of the current time, used as replay counter.
fn ntp_timestamp() -> [u8; 8] {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = (now.as_secs() + NTP_UNIX_OFFSET) as u32;
    let frac = ((now.subsec_micros() as u64) << 32) / 1_000_000;
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&secs.to_be_bytes());
    out[4..].copy_from_slice(&(frac as u32).to_be_bytes());
    out
}

fn min_timeout(peer: Option<u32>, local: Option<u32>) -> Option<u32> {
    match (peer, local) {
        (Some(p), Some(l)) => Some(p.min(l)),
        (p, l) => p.or(l),
    }
}

impl Authenticator {
    /// Looks up the station, creating it for an unknown address. A new
    /// station gets its port enabled and its one-second tick armed.
    fn station_for_frame(&mut self, bss: usize, addr: MacAddr, ethertype: u16) -> bool {
        let now = self.now;
        match self.stations.get_or_create(addr, bss, ethertype, &self.sm_params) {
            Ok((sta, created)) => {
                sta.ethertype = ethertype;
                if created {
                    info!("New station {} on BSS {} (aid {})", addr, bss, sta.aid);
                    sta.flags.associated = true;
                    sta.sm.port_enabled = true;
                    sta.tick_timer = Some(self.timers.schedule(now + EAPOL_TICK, Timer::EapolTick(addr)));
                }
                true
            }
            Err(e) => {
                warn!("Cannot track station {}: {}", addr, e);
                false
            }
        }
    }

    /// Association event from the driver.
    pub(crate) fn new_station(&mut self, bss: usize, addr: MacAddr) {
        if let Some(sta) = self.stations.get_mut(&addr) {
            debug!("Station {} re-associated", addr);
            sta.flags.associated = true;
            sta.sm.port_enabled = true;
        } else if !self.station_for_frame(bss, addr, ETH_P_PAE) {
            return;
        }
        self.step_station(addr);
    }

    /// Disconnect event from the driver.
    pub(crate) fn station_disconnected(&mut self, addr: MacAddr) {
        info!("Station {} disconnected", addr);
        self.free_station(&addr);
    }

    /// Handles one EAPOL frame (without Ethernet header) from `src`.
    pub(crate) fn receive(&mut self, bss: usize, src: MacAddr, ethertype: u16, frame: &[u8]) {
        let packet = match EapolPacket::from_bytes(frame) {
            Ok(packet) => packet,
            Err(EapolError::TooShort(len)) => {
                warn!("Too short ({} bytes) IEEE 802.1X frame from {}, ignored", len, src);
                return;
            }
            Err(EapolError::Truncated { declared, available }) => {
                warn!(
                    "IEEE 802.1X frame from {} truncated: length field {}, {} bytes of body",
                    src, declared, available
                );
                return;
            }
        };
        if packet.padding > 0 {
            warn!(
                "Ignoring {} extra octets after IEEE 802.1X packet from {}",
                packet.padding, src
            );
        }
        if packet.version != EAPOL_VERSION && packet.version != EAPOL_VERSION_2 {
            warn!("Unsupported IEEE 802.1X version {} from {}, ignored", packet.version, src);
            return;
        }

        if !self.station_for_frame(bss, src, ethertype) {
            return;
        }
        let authorized = {
            let Some(sta) = self.stations.get_mut(&src) else {
                return;
            };
            sta.counters.eapol_frames_rx += 1;
            sta.counters.last_eapol_frame_version = packet.version;
            sta.counters.last_eapol_frame_source = Some(src);
            sta.flags.authorized
        };
        debug!(
            "IEEE 802.1X frame from {}: version {} type {} length {}",
            src, packet.version, packet.packet_type, packet.length
        );

        match packet.eapol_type() {
            Some(EapolType::Eap) => self.handle_eap(src, packet.payload),
            Some(EapolType::Start) => {
                if let Some(sta) = self.stations.get_mut(&src) {
                    info!("Received EAPOL-Start from {}", src);
                    sta.counters.eapol_start_frames_rx += 1;
                    sta.sm.auth_pae.eap_start = true;
                }
            }
            Some(EapolType::Logoff) => {
                if let Some(sta) = self.stations.get_mut(&src) {
                    info!("Received EAPOL-Logoff from {}", src);
                    sta.counters.eapol_logoff_frames_rx += 1;
                    sta.sm.auth_pae.eap_logoff = true;
                }
            }
            Some(EapolType::Key) => {
                if authorized {
                    debug!("EAPOL-Key from {} ignored", src);
                } else {
                    info!("Dropped EAPOL-Key from unauthorized station {}", src);
                }
            }
            Some(EapolType::EncapsulatedAsfAlert) => {
                debug!("EAPOL-Encapsulated-ASF-Alert from {} ignored", src);
            }
            None => {
                if let Some(sta) = self.stations.get_mut(&src) {
                    sta.counters.invalid_eapol_frames_rx += 1;
                }
                warn!("Unknown IEEE 802.1X packet type {} from {}", packet.packet_type, src);
            }
        }

        self.step_station(src);
    }

    fn handle_eap(&mut self, addr: MacAddr, data: &[u8]) {
        let Some(sta) = self.stations.get_mut(&addr) else {
            return;
        };
        let eap = match EapPacket::from_bytes(data) {
            Ok(eap) => eap,
            Err(EapError::UnknownCode(code)) => {
                debug!("Unknown EAP code {} from {}, ignored", code, addr);
                return;
            }
            Err(e) => {
                sta.counters.eap_length_error_frames_rx += 1;
                warn!("Invalid EAP frame from {}: {:?}", addr, e);
                return;
            }
        };
        if eap.code != EapCode::Response {
            debug!("EAP {:?} from {} ignored", eap.code, addr);
            return;
        }
        if eap.identifier != sta.sm.current_id {
            warn!(
                "EAP Identifier of the Response from {} does not match (was {}, expected {})",
                addr, eap.identifier, sta.sm.current_id
            );
            return;
        }
        let Some(eap_type) = eap.eap_type() else {
            warn!("Too short EAP Response from {}", addr);
            return;
        };

        if eap_type == EapType::Identity as u8 {
            let identity = eap.data[1..].to_vec();
            info!(
                "Station {} identity '{}'",
                addr,
                String::from_utf8_lossy(&identity)
            );
            sta.counters.eap_resp_id_frames_rx += 1;
            sta.identity = Some(identity);
            sta.sm.auth_pae.rx_initial_rsp = true;
            if sta.sm.be_auth.state == BeAuthState::Request {
                sta.sm.be_auth.rx_resp = true;
            }
        } else {
            debug!("EAP Response type {} from {}", eap_type, addr);
            sta.counters.eap_resp_frames_rx += 1;
            if eap_type != EapType::Nak as u8 {
                sta.sm.be_auth.counters.non_nak_responses_from_supplicant += 1;
            }
            sta.sm.be_auth.rx_resp = true;
        }
        sta.last_eap_supp = Some(eap.to_bytes());
    }

    fn send_eapol_frame(&mut self, addr: MacAddr, packet_type: EapolType, body: &[u8]) {
        let Some(sta) = self.stations.get_mut(&addr) else {
            return;
        };
        let version = if sta.ethertype == ETH_P_PREAUTH {
            EAPOL_VERSION_2
        } else {
            EAPOL_VERSION
        };
        let frame = build_eapol(version, packet_type, body);
        sta.counters.eapol_frames_tx += 1;
        let (bss, ethertype) = (sta.bss, sta.ethertype);
        if let Err(e) = self.driver.send_eapol(bss, addr, ethertype, &frame) {
            warn!("Failed to send EAPOL frame to {}: {}", addr, e);
        }
    }

    pub(crate) fn request_identity(&mut self, addr: MacAddr, id: u8) {
        let eap = EapPacket::identity_request(id, self.config.eap_req_id_text.as_deref());
        debug!("Sending EAP-Request/Identity to {} (identifier {})", addr, id);
        if let Some(sta) = self.stations.get_mut(&addr) {
            sta.counters.eap_req_id_frames_tx += 1;
        }
        self.send_eapol_frame(addr, EapolType::Eap, &eap.to_bytes());
    }

    pub(crate) fn tx_canned_eap(&mut self, addr: MacAddr, id: u8, success: bool) {
        debug!(
            "Sending canned EAP-{} to {} (identifier {})",
            if success { "Success" } else { "Failure" },
            addr,
            id
        );
        let eap = EapPacket::canned(id, success);
        self.send_eapol_frame(addr, EapolType::Eap, &eap.to_bytes());
    }

    /// Relays the last EAP frame received from the authentication server.
    pub(crate) fn tx_req(&mut self, addr: MacAddr, id: u8) {
        let Some(sta) = self.stations.get_mut(&addr) else {
            return;
        };
        let Some(eap) = sta.last_eap_radius.clone() else {
            warn!(
                "TxReq called for station {}, but there is no EAP request from the authentication server",
                addr
            );
            return;
        };
        if eap.first() == Some(&(EapCode::Request as u8)) {
            if eap.get(4) == Some(&(EapType::Identity as u8)) {
                sta.counters.eap_req_id_frames_tx += 1;
            } else {
                sta.counters.eap_req_frames_tx += 1;
            }
        }
        debug!("Relaying EAP frame from server to {} (identifier {})", addr, id);
        self.send_eapol_frame(addr, EapolType::Eap, &eap);
    }

    pub(crate) fn tx_final(&mut self, addr: MacAddr, id: u8, success: bool) {
        let from_server = self
            .stations
            .get(&addr)
            .is_some_and(|sta| sta.last_eap_radius.is_some());
        if from_server {
            self.tx_req(addr, id);
        } else {
            self.tx_canned_eap(addr, id, success);
        }
    }

    pub(crate) fn abort_auth(&mut self, addr: MacAddr) {
        if let Some(sta) = self.stations.get_mut(&addr) {
            debug!("Aborting authentication of {}", addr);
            sta.last_recv_radius = None;
            sta.last_eap_radius = None;
            sta.radius_identifier = None;
        }
    }

    /// Wraps the station's last EAP response in an Access-Request.
    pub(crate) fn send_resp_to_server(&mut self, addr: MacAddr) {
        let now = self.now;
        let Some(eap) = self.stations.get(&addr).map(|sta| sta.last_eap_supp.clone()) else {
            return;
        };
        let Some(eap) = eap else {
            warn!("No EAP response from {} to send to the server", addr);
            return;
        };
        // Identifiers are only taken for requests that go out.
        let id = self.radius.get_id();
        let Some(sta) = self.stations.get_mut(&addr) else {
            return;
        };
        sta.radius_identifier = Some(id);
        let bss = sta.bss;

        let own_addr = self.own_addrs.get(bss).copied().unwrap_or(MacAddr::zero());
        let called_station_id = match &self.config.ssid {
            Some(ssid) => format!("{}:{}", mac_dashes(&own_addr), ssid),
            None => mac_dashes(&own_addr),
        };

        let build = || -> portauth_net::radius::Result<RadiusMsg> {
            let mut msg = RadiusMsg::new(RadiusCode::AccessRequest, id);
            if let Some(identity) = &sta.identity {
                msg.add_attr(RadiusAttributeType::UserName, identity)?;
            }
            msg.add_attr(RadiusAttributeType::NasIpAddress, &self.config.own_ip_addr.octets())?;
            if let Some(nas_identifier) = &self.config.nas_identifier {
                msg.add_attr(RadiusAttributeType::NasIdentifier, nas_identifier.as_bytes())?;
            }
            msg.add_attr_int32(RadiusAttributeType::NasPort, sta.aid as u32)?;
            msg.add_attr(RadiusAttributeType::CalledStationId, called_station_id.as_bytes())?;
            msg.add_attr(RadiusAttributeType::CallingStationId, mac_dashes(&addr).as_bytes())?;
            msg.add_attr_int32(RadiusAttributeType::FramedMtu, FRAMED_MTU)?;
            msg.add_attr_int32(RadiusAttributeType::NasPortType, RADIUS_NAS_PORT_TYPE_IEEE_802_11)?;
            msg.add_eap(&eap)?;

            // State is echoed only in a reply to an Access-Challenge.
            if let Some(last) = sta.last_recv_radius.as_deref() {
                let last = RadiusMsg::parse(last)?;
                if last.radius_code() == Some(RadiusCode::AccessChallenge)
                    && !msg.copy_attr(&last, RadiusAttributeType::State)?
                {
                    debug!("Access-Challenge for {} carried no State", addr);
                }
            }
            Ok(msg)
        };
        let msg = match build() {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Could not build Access-Request for {}: {}", addr, e);
                return;
            }
        };

        debug!("Sending Access-Request (id {}) for {}", id, addr);
        if let Err(e) = self.radius.send(msg, RadiusMsgType::Auth, bss, now) {
            warn!("Could not send Access-Request for {}: {}", addr, e);
        }
    }

    pub(crate) fn set_sta_authorized(&mut self, addr: MacAddr, authorized: bool) {
        let key_tx_enabled = self.config.key_tx_enabled();
        let Some(sta) = self.stations.get_mut(&addr) else {
            return;
        };
        if sta.flags.authorized != authorized {
            info!(
                "{} port of station {}",
                if authorized { "Authorizing" } else { "Unauthorizing" },
                addr
            );
        }
        sta.flags.authorized = authorized;
        let bss = sta.bss;
        let keyless = sta.eapol_key_crypt.is_none() || !key_tx_enabled;

        self.driver_request(bss, DriverRequest::SetAuthorized { addr, authorized });
        if authorized && keyless && self.default_wep_key.is_some() {
            self.driver_request(bss, DriverRequest::CopySharedKey { addr });
        }
    }

    fn key_frame(
        &self,
        version: u8,
        sign: &[u8],
        crypt: &[u8],
        index: u8,
        broadcast: bool,
        key_data: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut key_iv = [0u8; 16];
        crypto::random_bytes(&mut key_iv)?;

        let mut key_index = index;
        if !broadcast || self.config.eapol_key_index_workaround {
            key_index |= EAPOL_KEY_INDEX_UNICAST;
        }

        // RC4 key is Key-IV followed by the encryption key.
        let mut rc4_key = key_iv.to_vec();
        rc4_key.extend_from_slice(crypt);
        let mut key = key_data.to_vec();
        crypto::rc4(&mut key, &rc4_key)?;

        let descriptor = EapolKey {
            key_type: EAPOL_KEY_TYPE_RC4,
            key_length: key_data.len() as u16,
            replay_counter: ntp_timestamp(),
            key_iv,
            key_index,
            key_signature: [0; 16],
            key,
        };
        Ok(descriptor.to_signed_frame(version, sign))
    }

    /// Sends the broadcast key and a fresh unicast key to the station.
    pub(crate) fn tx_key(&mut self, addr: MacAddr) {
        let Some(sta) = self.stations.get(&addr) else {
            return;
        };
        let (Some(sign), Some(crypt)) = (sta.eapol_key_sign.clone(), sta.eapol_key_crypt.clone()) else {
            debug!("No EAPOL-Key keys for {}", addr);
            return;
        };
        let bss = sta.bss;
        let version = if sta.ethertype == ETH_P_PREAUTH {
            EAPOL_VERSION_2
        } else {
            EAPOL_VERSION
        };

        let mut frames = Vec::with_capacity(2);
        if let Some(key) = &self.default_wep_key {
            debug!("Sending broadcast key (index {}) to {}", self.default_wep_key_idx, addr);
            match self.key_frame(version, &sign, &crypt, self.default_wep_key_idx, true, key) {
                Ok(frame) => frames.push(frame),
                Err(e) => warn!("Could not build broadcast EAPOL-Key for {}: {}", addr, e),
            }
        }

        let key_len = self.config.individual_wep_key_len;
        if key_len > 0 {
            let mut ikey = vec![0u8; key_len];
            match crypto::random_bytes(&mut ikey)
                .map_err(CryptoError::from)
                .and_then(|_| self.key_frame(version, &sign, &crypt, 0, false, &ikey))
            {
                Ok(frame) => {
                    debug!("Sending unicast key to {}", addr);
                    frames.push(frame);
                    self.driver_request(
                        bss,
                        DriverRequest::SetKey { target: KeyTarget::Station(addr), index: 0, key: ikey },
                    );
                }
                Err(e) => warn!("Could not generate unicast key for {}: {}", addr, e),
            }
        }

        for frame in frames {
            // The frames are complete EAPOL frames already.
            let Some(sta) = self.stations.get_mut(&addr) else {
                return;
            };
            sta.counters.eapol_frames_tx += 1;
            let ethertype = sta.ethertype;
            if let Err(e) = self.driver.send_eapol(bss, addr, ethertype, &frame) {
                warn!("Failed to send EAPOL-Key to {}: {}", addr, e);
            }
        }
    }

    /// Rotates the broadcast key, pushes it to every BSS and marks it
    /// available to all stations.
    pub(crate) fn rekey(&mut self) {
        let len = self.config.default_wep_key_len;
        let mut key = vec![0u8; len];
        if let Err(e) = crypto::random_bytes(&mut key) {
            warn!("Could not generate broadcast key: {}", e);
            return;
        }
        self.default_wep_key_idx = if self.default_wep_key_idx >= 3 {
            if self.config.individual_wep_key_len > 0 { 1 } else { 0 }
        } else {
            self.default_wep_key_idx + 1
        };
        info!("New broadcast key (index {})", self.default_wep_key_idx);

        for bss in 0..self.config.bss.len() {
            self.driver_request(
                bss,
                DriverRequest::SetKey {
                    target: KeyTarget::Broadcast,
                    index: self.default_wep_key_idx,
                    key: key.clone(),
                },
            );
        }
        self.default_wep_key = Some(key);

        for addr in self.stations.addrs() {
            if let Some(sta) = self.stations.get_mut(&addr) {
                sta.sm.key_available = true;
            }
            self.step_station(addr);
        }

        if self.config.wep_rekey_period > 0 {
            let at = self.now + Duration::from_secs(self.config.wep_rekey_period as u64);
            self.rekey_timer = Some(self.timers.schedule(at, Timer::WepRekey));
        }
    }
}

/// RADIUS receive handler for Access-Accept, Access-Reject and
/// Access-Challenge.
pub fn receive_auth(auth: &mut Authenticator, msg: RadiusMsg, req: &RadiusMsg, secret: &[u8]) -> RxOutcome {
    let Some(addr) = auth.stations.lookup_by_radius_id(msg.identifier()) else {
        debug!("Could not find matching station for RADIUS message (id {})", msg.identifier());
        return RxOutcome::Unknown(msg);
    };
    if let Err(e) = msg.verify(secret, req) {
        warn!("Incoming RADIUS packet for {} did not have correct authenticator, dropped: {}", addr, e);
        return RxOutcome::Unknown(msg);
    }
    let Some(code) = msg.radius_code() else {
        return RxOutcome::Unknown(msg);
    };

    let now = auth.now;
    let local_session_timeout = auth.config.session_timeout;
    let local_idle_timeout = auth.config.idle_timeout;
    let key_tx_enabled = auth.config.key_tx_enabled();
    let session_timeout = msg.get_attr_int32(RadiusAttributeType::SessionTimeout);
    let termination_action = msg
        .get_attr_int32(RadiusAttributeType::TerminationAction)
        .unwrap_or(RADIUS_TERMINATION_ACTION_DEFAULT);

    let Some(sta) = auth.stations.get_mut(&addr) else {
        return RxOutcome::Unknown(msg);
    };
    info!("Received {} for station {}", code.name(), addr);
    sta.radius_identifier = None;
    let bss = sta.bss;
    let mut requests = Vec::new();

    match code {
        RadiusCode::AccessAccept => {
            if termination_action == RADIUS_TERMINATION_ACTION_RADIUS_REQUEST && session_timeout.is_some() {
                if let Some(period) = min_timeout(session_timeout, local_session_timeout) {
                    debug!("Reauthentication period of {} set to {}s", addr, period);
                    sta.sm.reauth_timer.reauth_period = period;
                }
            } else if let Some(timeout) = min_timeout(session_timeout, local_session_timeout) {
                if let Some(id) = sta.session_timer.take() {
                    auth.timers.cancel(id);
                }
                debug!("Session timeout of {} set to {}s", addr, timeout);
                let at = now + Duration::from_secs(timeout as u64);
                sta.session_timer = Some(auth.timers.schedule(at, Timer::SessionTimeout(addr)));
            }

            let idle_timeout = min_timeout(msg.get_attr_int32(RadiusAttributeType::IdleTimeout), local_idle_timeout);
            if let Some(timeout) = idle_timeout {
                requests.push(DriverRequest::SetIdleTimeout { addr, timeout });
            }

            sta.sm.be_auth.a_success = true;

            match msg.get_ms_keys(req, secret) {
                Some(keys) => {
                    if let (Some(send), Some(recv)) = (keys.send, keys.recv) {
                        // Only a 32-byte Recv-Key is passed on whole.
                        let pmk_len = if recv.len() == 32 { 32 } else { recv.len().min(1) };
                        requests.push(DriverRequest::SetPairwiseMasterKey {
                            addr,
                            pmk: recv[..pmk_len].to_vec(),
                        });
                        sta.eapol_key_sign = Some(send);
                        sta.eapol_key_crypt = Some(recv);
                        if key_tx_enabled {
                            sta.sm.key_available = true;
                        }
                    }
                }
                None => debug!("No MS-MPPE keys in Access-Accept for {}", addr),
            }
        }
        RadiusCode::AccessReject => {
            sta.sm.be_auth.a_fail = true;
        }
        RadiusCode::AccessChallenge => {
            sta.sm.be_auth.a_req = true;
            if let Some(timeout) = session_timeout {
                sta.sm.be_auth.supp_timeout = timeout;
            }
        }
        _ => return RxOutcome::Unknown(msg),
    }

    // The next EAP frame for the station, if any.
    sta.last_eap_radius = msg.get_eap();
    match sta.last_eap_radius.as_deref().map(EapPacket::from_bytes) {
        Some(Ok(eap)) => {
            debug!("EAP {:?} (identifier {}) from server for {}", eap.code, eap.identifier, addr);
            sta.sm.be_auth.id_from_server = eap.identifier;
        }
        Some(Err(e)) => warn!("Invalid EAP-Message from server for {}: {:?}", addr, e),
        None => {
            if code == RadiusCode::AccessChallenge {
                warn!("No EAP-Message in Access-Challenge for {}", addr);
            }
        }
    }
    sta.last_recv_radius = Some(msg.as_bytes().to_vec());

    for request in requests {
        auth.driver_request(bss, request);
    }
    auth.step_station(addr);
    RxOutcome::Queued
}
