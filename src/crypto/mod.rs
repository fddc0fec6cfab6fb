//! Crypto provider facade: primitives plus process-wide provider mode.

pub mod primitives;
pub mod provider;

pub use primitives::*;
pub use provider::{ProviderKind, ProviderMode};
