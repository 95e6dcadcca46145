// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Emulation prevention removal.
//!
//! Every syntax parser in this crate works on RBSP data, i.e. NAL payloads
//! with the `0x03` bytes inserted after each `00 00` pair removed.

use thiserror::Error;

/// Zero bytes appended after the RBSP so readers may over-fetch.
pub const RBSP_PADDING: usize = 64;

#[derive(Debug, Error)]
pub enum RbspError {
    #[error("failed to allocate {0} bytes for the RBSP buffer")]
    OutOfMemory(usize),
}

/// A NAL payload with its emulation prevention bytes removed.
#[derive(Debug, Default, Clone)]
pub struct Rbsp {
    /// RBSP bytes followed by `RBSP_PADDING` zero bytes.
    data: Vec<u8>,
    len: usize,
    /// Offsets in the raw payload of every removed byte, ascending.
    epb_positions: Vec<usize>,
}

impl Rbsp {
    /// Extracts the RBSP out of `raw`.
    pub fn extract(raw: &[u8]) -> Result<Self, RbspError> {
        let capacity = raw.len() + RBSP_PADDING;
        let mut data = Vec::new();
        data.try_reserve_exact(capacity)
            .map_err(|_| RbspError::OutOfMemory(capacity))?;

        let mut epb_positions = Vec::new();
        let mut zeros = 0;

        for (i, &byte) in raw.iter().enumerate() {
            if zeros >= 2 && byte == 0x03 {
                epb_positions.push(i);
                zeros = 0;
                continue;
            }

            if byte == 0 {
                zeros += 1;
            } else {
                zeros = 0;
            }

            data.push(byte);
        }

        let len = data.len();
        data.resize(len + RBSP_PADDING, 0);

        Ok(Self {
            data,
            len,
            epb_positions,
        })
    }

    /// The RBSP bytes, without padding.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// The RBSP bytes followed by the zero padding.
    pub fn padded(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of emulation prevention bytes removed during extraction.
    pub fn num_epb(&self) -> usize {
        self.epb_positions.len()
    }

    /// Maps a byte offset in the RBSP back to the corresponding offset in
    /// the raw payload.
    pub fn raw_offset(&self, rbsp_offset: usize) -> usize {
        let mut raw = rbsp_offset;
        for &pos in &self.epb_positions {
            if pos <= raw {
                raw += 1;
            } else {
                break;
            }
        }

        raw
    }
}

impl AsRef<[u8]> for Rbsp {
    fn as_ref(&self) -> &[u8] {
        self.data()
    }
}

/// Inserts emulation prevention bytes into `rbsp`, producing a payload that
/// cannot contain a start code.
pub fn add_emulation_prevention(rbsp: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(rbsp.len() + rbsp.len() / 64 + 1);
    let mut zeros = 0;

    for &byte in rbsp {
        if zeros >= 2 && byte <= 0x03 {
            out.push(0x03);
            zeros = 0;
        }

        if byte == 0 {
            zeros += 1;
        } else {
            zeros = 0;
        }

        out.push(byte);
    }

    out
}
