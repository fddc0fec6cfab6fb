//! Authenticated session state and role-based access gates.

use crate::error::{Result, VaultError};
use crate::format::slot::Role;
use crate::records::Record;

/// In-memory state for one authenticated user, from successful open
/// until close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub username: String,
    pub role: Role,
    /// The user must change their password before records open up.
    pub must_change_password: bool,
    /// Policy requires a token and this user has none enrolled yet.
    pub requires_token_enrollment: bool,
}

impl Session {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Administrator
    }

    /// Gate on any record access at all. Pending password changes and
    /// pending token enrollment both block the record store.
    pub fn check_records_accessible(&self) -> Result<()> {
        if self.must_change_password || self.requires_token_enrollment {
            return Err(VaultError::PermissionDenied);
        }
        Ok(())
    }

    pub fn can_view(&self, record: &Record) -> bool {
        self.is_admin() || !record.admin_only_viewable
    }

    pub fn can_delete(&self, record: &Record) -> bool {
        self.is_admin() || !record.admin_only_deletable
    }
}
