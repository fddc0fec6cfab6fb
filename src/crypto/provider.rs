//! Crypto provider negotiation.
//!
//! The engine only ever calls FIPS-approvable primitives, but deployments
//! differ in whether a validated provider build is present and whether it
//! has been switched into validated mode. That negotiation is process-wide
//! state with four observable values and one-way transitions:
//!
//! ```text
//! Uninitialized -> DefaultAvailable
//! Uninitialized -> ValidatedAvailable -> ValidatedEnabled
//! ```
//!
//! Once enabled, a validated provider may refuse to be disabled again; the
//! engine reports the refusal instead of working around it.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Result, VaultError};

static MODE: AtomicU8 = AtomicU8::new(ProviderMode::Uninitialized as u8);

/// Which provider build the process loaded at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Default,
    Validated,
}

/// Observable provider state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProviderMode {
    Uninitialized = 0,
    DefaultAvailable = 1,
    ValidatedAvailable = 2,
    ValidatedEnabled = 3,
}

impl ProviderMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ProviderMode::DefaultAvailable,
            2 => ProviderMode::ValidatedAvailable,
            3 => ProviderMode::ValidatedEnabled,
            _ => ProviderMode::Uninitialized,
        }
    }
}

/// Current process-wide provider mode.
pub fn mode() -> ProviderMode {
    ProviderMode::from_u8(MODE.load(Ordering::SeqCst))
}

/// Register the provider loaded for this process. May be called once;
/// repeat calls are rejected so a library consumer cannot silently swap
/// providers under an open vault.
pub fn initialize(kind: ProviderKind) -> Result<()> {
    let target = match kind {
        ProviderKind::Default => ProviderMode::DefaultAvailable,
        ProviderKind::Validated => ProviderMode::ValidatedAvailable,
    };
    MODE.compare_exchange(
        ProviderMode::Uninitialized as u8,
        target as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
    )
    .map(|_| ())
    .map_err(|_| VaultError::CryptoProvider("provider already initialized"))
}

/// Switch an available validated provider into validated mode.
pub fn enable_validated() -> Result<()> {
    match MODE.compare_exchange(
        ProviderMode::ValidatedAvailable as u8,
        ProviderMode::ValidatedEnabled as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
    ) {
        Ok(_) => Ok(()),
        Err(current) if current == ProviderMode::ValidatedEnabled as u8 => Ok(()),
        Err(_) => Err(VaultError::CryptoProvider(
            "no validated provider available",
        )),
    }
}

/// Attempt to leave validated mode. The provider refuses once enabled;
/// callers get the refusal and are expected to keep operating in
/// validated mode.
pub fn disable_validated() -> Result<()> {
    match mode() {
        ProviderMode::ValidatedEnabled => Err(VaultError::CryptoProvider(
            "validated mode cannot be disabled once enabled",
        )),
        ProviderMode::ValidatedAvailable => Ok(()),
        _ => Ok(()),
    }
}
