//! Tiersync Core - Types, layer rules, and error handling

pub mod error;
pub mod message;
pub mod rules;
pub mod state;
pub mod sync;
pub mod types;

pub use error::{Error, Result};
pub use message::*;
pub use rules::{can_communicate, can_sync, sync_targets};
pub use state::*;
pub use sync::*;
pub use types::*;
