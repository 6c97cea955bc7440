#![no_main]

use libfuzzer_sys::fuzz_target;
use portauth_net::eap::EapPacket;
use portauth_net::eapol::{EapolKey, EapolPacket, EapolType};

fuzz_target!(|data: &[u8]| {
    let Ok(packet) = EapolPacket::from_bytes(data) else {
        return;
    };
    match packet.eapol_type() {
        Some(EapolType::Eap) => {
            let _ = EapPacket::from_bytes(packet.payload);
        }
        Some(EapolType::Key) => {
            let _ = EapolKey::from_bytes(packet.payload);
        }
        _ => {}
    }
});
