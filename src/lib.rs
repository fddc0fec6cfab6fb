//! towervault — a local encrypted credential vault engine with
//! multi-user key slots.
//!
//! The engine owns the key hierarchy (one vault DEK, wrapped per user
//! under a password-derived KEK, optionally combined with a hardware
//! token response), the self-describing container format with an
//! FEC-protected authentication header, the per-user authentication
//! state machine, and the access-control rules over the in-memory
//! record store. GUIs, CLIs, token drivers, and record schemas live
//! outside this crate; [`VaultEngine`] is the single facade.
//!
//! ```no_run
//! use secrecy::SecretString;
//! use towervault::{EngineConfig, SecurityPolicy, VaultEngine};
//!
//! # fn main() -> Result<(), towervault::VaultError> {
//! let engine = VaultEngine::new(EngineConfig::default())?;
//! let password = SecretString::from("correct horse battery staple".to_string());
//! engine.create_v2(
//!     "vault.twr".as_ref(),
//!     "root",
//!     &password,
//!     &SecurityPolicy::default(),
//!     None,
//! )?;
//! let session = engine.open_v2("vault.twr".as_ref(), "root", &password, None)?;
//! assert!(session.is_admin());
//! engine.close();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod fec;
pub mod format;
pub mod keys;
pub mod records;
pub mod secure;
pub mod session;
pub mod token;

pub use config::EngineConfig;
pub use engine::task::{ProgressEvent, TaskHandle, TaskOutcome};
pub use engine::{PolicyUpdate, UserSummary, VaultEngine, VaultStatus};
pub use error::{Result, VaultError};
pub use fec::ReedSolomonCodec;
pub use format::{
    Argon2Params, KekDerivation, MigrationStatus, Role, SecurityPolicy, TokenAlgorithm,
    UsernameHashAlgorithm,
};
pub use records::{Record, RecordStore};
pub use secure::SecureBuffer;
pub use session::Session;
pub use token::{TokenDevice, TokenInfo};
