//! Page-locked secret storage.
//!
//! Every long-lived secret in the engine (the DEK, derived KEKs, token
//! responses, decrypted payload bytes) lives in a [`SecureBuffer`]:
//! the backing memory is locked into RAM on construction so it cannot be
//! swapped to disk, and it is zeroized then unlocked on drop, on every
//! exit path including unwinding.
//!
//! Page locking is best-effort. `mlock` can be refused (RLIMIT_MEMLOCK,
//! unsupported platform); the refusal is logged once per buffer and the
//! buffer still guarantees zeroize-on-drop.

use zeroize::Zeroize;

use crate::crypto;
use crate::error::{Result, VaultError};

pub struct SecureBuffer {
    buf: Vec<u8>,
    locked: bool,
}

impl SecureBuffer {
    /// Allocate a zero-filled buffer of `len` bytes and lock it.
    pub fn zeroed(len: usize) -> Self {
        Self::from_vec(vec![0u8; len])
    }

    /// Take ownership of existing bytes and lock their region.
    ///
    /// The capacity is shrunk to the length first so the locked region
    /// covers exactly what the buffer owns; the buffer never grows after
    /// construction.
    pub fn from_vec(mut v: Vec<u8>) -> Self {
        v.shrink_to_fit();
        let locked = lock_region(v.as_ptr(), v.len());
        if !locked && !v.is_empty() {
            tracing::warn!(len = v.len(), "mlock refused; secret memory may be swappable");
        }
        Self { buf: v, locked }
    }

    /// Allocate `len` bytes filled from the OS DRBG.
    pub fn random(len: usize) -> Self {
        let mut buf = Self::zeroed(len);
        crypto::fill_random(buf.as_mut_slice());
        buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// View the buffer as a 32-byte key.
    pub fn as_key32(&self) -> Result<&[u8; 32]> {
        self.buf
            .as_slice()
            .try_into()
            .map_err(|_| VaultError::InvalidData("key length"))
    }
}

impl std::fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.buf.len())
            .field("locked", &self.locked)
            .finish_non_exhaustive()
    }
}

impl Drop for SecureBuffer {
    fn drop(&mut self) {
        self.buf.zeroize();
        if self.locked {
            unlock_region(self.buf.as_ptr(), self.buf.len());
        }
    }
}

#[cfg(unix)]
fn lock_region(ptr: *const u8, len: usize) -> bool {
    if len == 0 {
        return false;
    }
    unsafe { libc::mlock(ptr as *const libc::c_void, len) == 0 }
}

#[cfg(not(unix))]
fn lock_region(_ptr: *const u8, _len: usize) -> bool {
    false
}

#[cfg(unix)]
fn unlock_region(ptr: *const u8, len: usize) {
    if len == 0 {
        return;
    }
    unsafe {
        libc::munlock(ptr as *const libc::c_void, len);
    }
}

#[cfg(not(unix))]
fn unlock_region(_ptr: *const u8, _len: usize) {}
