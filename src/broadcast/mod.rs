pub mod hub;
pub mod sanitize;

pub use hub::{BroadcastHub, ClientHandle, HubHealth};
