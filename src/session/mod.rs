//! Call sessions: the persisted state-machine record for one contact.

pub mod campaign;
pub mod model;
pub mod state;

pub use campaign::{Campaign, CampaignStats};
pub use model::{
    CallSession, CapturedAnswer, ChannelKind, Contact, ContactTimezone, FailureReason, Priority,
};
pub use state::{SessionStatus, StateTransition};
