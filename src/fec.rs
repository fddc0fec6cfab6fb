//! Reed-Solomon forward error correction over GF(256).
//!
//! The authentication header is the one part of the container that must
//! survive localized disk corruption: lose it and nobody can authenticate,
//! even with the right password. The engine therefore wraps the header
//! (and, optionally, the payload ciphertext) in an RS-coded frame:
//!
//! ```text
//! u32 BE original_size || u8 redundancy_percent || interleaved codewords
//! ```
//!
//! Data is split across `RS(255, 255 - parity)` codewords, zero-padded to
//! a whole number of codewords, and written column-major so a contiguous
//! burst of corruption spreads evenly across all codewords instead of
//! destroying one of them. Each codeword recovers up to `parity / 2`
//! corrupted bytes, so total recoverable corruption is roughly half the
//! redundancy.

use reed_solomon::{Decoder, Encoder};

use crate::error::{Result, VaultError};

pub const MIN_REDUNDANCY_PERCENT: u8 = 5;
pub const MAX_REDUNDANCY_PERCENT: u8 = 50;

/// Minimum redundancy applied to the authentication header regardless of
/// the configured preference.
pub const HEADER_MIN_PERCENT: u8 = 20;

/// RS symbol size: data + parity per codeword.
const CODEWORD_LEN: usize = 255;

/// Frame prelude: original size (4) + redundancy percent (1).
const FRAME_PRELUDE_LEN: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct ReedSolomonCodec {
    percent: u8,
    parity_len: usize,
    data_len: usize,
}

impl ReedSolomonCodec {
    pub fn new(percent: u8) -> Result<Self> {
        if !(MIN_REDUNDANCY_PERCENT..=MAX_REDUNDANCY_PERCENT).contains(&percent) {
            return Err(VaultError::InvalidData("fec redundancy percent"));
        }
        let parity_len = parity_len_for(percent);
        Ok(Self {
            percent,
            parity_len,
            data_len: CODEWORD_LEN - parity_len,
        })
    }

    pub fn percent(&self) -> u8 {
        self.percent
    }

    /// Encode `data` into a self-describing FEC frame.
    pub fn encode(&self, data: &[u8]) -> Vec<u8> {
        let blocks = data.len().div_ceil(self.data_len);
        let mut out = Vec::with_capacity(FRAME_PRELUDE_LEN + blocks * CODEWORD_LEN);
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.push(self.percent);

        if blocks == 0 {
            return out;
        }

        let encoder = Encoder::new(self.parity_len);
        let mut codewords = Vec::with_capacity(blocks);
        let mut chunk = vec![0u8; self.data_len];
        for b in 0..blocks {
            chunk.fill(0);
            let start = b * self.data_len;
            let end = (start + self.data_len).min(data.len());
            chunk[..end - start].copy_from_slice(&data[start..end]);
            codewords.push(encoder.encode(&chunk).to_vec());
        }

        // Column-major interleave: byte j of every codeword, in order.
        for j in 0..CODEWORD_LEN {
            for cw in &codewords {
                out.push(cw[j]);
            }
        }
        out
    }

    /// Decode a frame produced by [`encode`](Self::encode), correcting up
    /// to `parity / 2` corrupted bytes per codeword.
    pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < FRAME_PRELUDE_LEN {
            return Err(VaultError::FecDecodingFailed);
        }
        let original_size =
            u32::from_be_bytes(frame[0..4].try_into().expect("4 bytes")) as usize;
        let percent = frame[4];
        if !(MIN_REDUNDANCY_PERCENT..=MAX_REDUNDANCY_PERCENT).contains(&percent) {
            return Err(VaultError::FecDecodingFailed);
        }
        let parity_len = parity_len_for(percent);
        let data_len = CODEWORD_LEN - parity_len;

        let body = &frame[FRAME_PRELUDE_LEN..];
        if body.len() % CODEWORD_LEN != 0 {
            return Err(VaultError::FecDecodingFailed);
        }
        let blocks = body.len() / CODEWORD_LEN;
        if original_size > blocks * data_len {
            return Err(VaultError::FecDecodingFailed);
        }
        if blocks == 0 {
            return if original_size == 0 {
                Ok(Vec::new())
            } else {
                Err(VaultError::FecDecodingFailed)
            };
        }

        // De-interleave back into contiguous codewords.
        let mut codewords = vec![vec![0u8; CODEWORD_LEN]; blocks];
        for j in 0..CODEWORD_LEN {
            for (b, cw) in codewords.iter_mut().enumerate() {
                cw[j] = body[j * blocks + b];
            }
        }

        let decoder = Decoder::new(parity_len);
        let mut out = Vec::with_capacity(blocks * data_len);
        for cw in &codewords {
            let corrected = decoder
                .correct(cw, None)
                .map_err(|_| VaultError::FecDecodingFailed)?;
            out.extend_from_slice(corrected.data());
        }
        out.truncate(original_size);
        Ok(out)
    }
}

/// Parity symbols per 255-byte codeword for a redundancy percent, chosen
/// so `parity / data` tracks the requested ratio. Always at least 2 so a
/// codeword can correct one error.
fn parity_len_for(percent: u8) -> usize {
    let p = percent as usize;
    let parity = (CODEWORD_LEN * p + (100 + p) / 2) / (100 + p);
    parity.max(2)
}
