//! Abstract hardware-token driver interface.
//!
//! The engine never talks to USB; it consumes this trait. A device
//! computes an HMAC (SHA-256 class or better) over a challenge, with
//! user presence required at enrollment. Drivers live outside the crate;
//! the test suite ships a deterministic software token.

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub serial: String,
    pub model: Option<String>,
}

pub trait TokenDevice: Send {
    /// Bring the device to a usable state. Called once before first use.
    fn initialize(&mut self) -> Result<()>;

    /// Whether the device is currently attached.
    fn is_present(&self) -> bool;

    /// Device identity, used to record the serial at enrollment.
    fn info(&self) -> Result<TokenInfo>;

    /// Perform HMAC challenge-response. `require_touch` demands user
    /// presence; the call blocks until touch or `timeout_ms` expires.
    /// The response length is the HMAC output length of the device's
    /// configured algorithm.
    fn challenge_response(
        &mut self,
        challenge: &[u8],
        require_touch: bool,
        timeout_ms: u32,
    ) -> Result<Vec<u8>>;
}

/// Default timeout for a challenge-response round trip, generous enough
/// for a human touch.
pub const CHALLENGE_TIMEOUT_MS: u32 = 15_000;
