pub mod crypto;
pub mod eap;
pub mod eapol;
pub mod radius;
pub mod radius_client;

pub use radius::{RadiusCode, RadiusError, RadiusMsg};
pub use radius_client::{RadiusClient, RadiusContext, RadiusMsgType, RadiusServerCounters, RadiusTransport, RxOutcome};
