//! Data model and signed-request protocol shared by the gateway daemon and
//! registering peers.

pub mod codec;
pub mod protocol;
pub mod signing;
pub mod types;
