//! Keep clevis bindings on LUKS devices in a desired state.
//!
//! A binding ties one keyslot of a LUKS device to a policy of network key
//! servers: the slot gets a random passphrase, and that passphrase is stored
//! in the device's header encrypted so only the servers can release it.
//!
//! # Get Started
//!
//! ```bash
//! luks-clevis apply desired.yml --check
//! luks-clevis status /dev/sda2
//! ```

pub mod binding;
pub mod clevis;
pub mod cli;
pub(crate) mod command;
pub mod config;
pub mod error;
pub mod host;
pub mod luks;
pub mod policy;
pub mod reconcile;
pub mod secret;

#[cfg(test)]
mod testing;

pub use binding::{Binding, BindingSpec, BindingState};
pub use error::{ClevisError, Result};
pub use host::{Host, SystemHost};
pub use reconcile::{Action, Reconciler, Report};
