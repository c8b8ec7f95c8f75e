//! Channel abstraction for prompt delivery and answer capture.

pub mod channel;
pub mod gateway;
pub mod manager;
pub mod scripted;

pub use channel::*;
pub use gateway::{GatewayChannel, PendingDeliveries};
pub use manager::ChannelManager;
pub use scripted::{ScriptStep, ScriptedChannel};
