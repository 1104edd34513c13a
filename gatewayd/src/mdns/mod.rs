pub mod advertise;
pub mod discovery;
pub mod health;
pub mod interfaces;
pub mod transport;
pub mod txt;
pub mod wire;
