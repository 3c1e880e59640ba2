//! Update engine for ticketed products.
//!
//! The [`Keystone`] reads tickets from a [`TicketStore`](crate::ticket::TicketStore),
//! asks update servers what is available and installs what its
//! [`KeystoneDelegate`] approves. A [`KeystoneBroker`] serializes access when
//! several clients share one engine.

pub mod actions;
mod broker;
mod config;
mod context;
mod delegate;
mod runner;
mod types;

pub use broker::{BrokerError, KeystoneBroker};
pub use config::KeystoneConfig;
pub use context::{retain_offered, KeystoneContext, UpdateServices};
pub use delegate::KeystoneDelegate;
pub use runner::Keystone;
pub use types::{ActionError, KeystoneError, KeystoneParams, KeystoneStatus};
