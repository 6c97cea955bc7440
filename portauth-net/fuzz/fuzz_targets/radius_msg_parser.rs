#![no_main]

use libfuzzer_sys::fuzz_target;
use portauth_net::RadiusMsg;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = RadiusMsg::parse(data) {
        let _ = msg.get_eap();
        let _ = msg.attrs().count();
    }
});
