pub mod broadcast;
pub mod connection;
pub mod dedupe;
pub mod heartbeat;
pub mod methods;
pub mod presence;
pub mod seq;
pub mod ws;
