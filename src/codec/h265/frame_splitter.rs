// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Access unit boundary detection for Annex B byte streams.
//!
//! Transports that do not deliver one access unit per packet feed their
//! chunks into a [`FrameSplitter`], which accumulates bytes until it sees
//! the start of the next access unit and then hands out the completed one.

use thiserror::Error;

use crate::codec::h265::nalu::NaluType;

/// Extra room kept at the end of the accumulation buffer.
const BUFFER_PADDING: usize = 64;

#[derive(Debug, Error)]
pub enum FrameSplitError {
    #[error("failed to grow the frame buffer to {0} bytes")]
    OutOfMemory(usize),
    #[error("frame end {end} lies before the {buffered} buffered bytes")]
    InvalidEnd { end: isize, buffered: usize },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FrameEnd {
    /// More input is needed to close the current access unit.
    #[default]
    NotFound,
    /// Offset of the first byte of the next access unit, relative to the
    /// start of the input just scanned. Negative when the start code began
    /// in previously buffered bytes.
    Found(isize),
}

/// Splits arbitrarily chunked Annex B input into access units.
pub struct FrameSplitter {
    /// The last eight bytes scanned.
    state64: u64,
    frame_start_found: bool,
    /// Bytes scanned so far that belong to the access unit being assembled.
    buffer: Vec<u8>,
}

impl Default for FrameSplitter {
    fn default() -> Self {
        Self {
            state64: u64::MAX,
            frame_start_found: false,
            buffer: Vec::new(),
        }
    }
}

impl FrameSplitter {
    pub fn new() -> Self {
        Default::default()
    }

    /// Drops any buffered data and the scanning state.
    pub fn reset(&mut self) {
        self.state64 = u64::MAX;
        self.frame_start_found = false;
        self.buffer.clear();
    }

    /// Number of bytes currently held for the next access unit.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether `nut` can only appear at the start of an access unit. See
    /// 7.4.2.4.4.
    fn starts_access_unit(nut: u8) -> bool {
        (NaluType::VpsNut as u8..=NaluType::EobNut as u8).contains(&nut)
            || nut == NaluType::PrefixSeiNut as u8
            || (NaluType::RsvNvcl41 as u8..=NaluType::RsvNvcl44 as u8).contains(&nut)
            || (NaluType::Unspec48 as u8..=NaluType::Unspec55 as u8).contains(&nut)
    }

    fn is_slice(nut: u8) -> bool {
        nut <= NaluType::RaslR as u8
            || (NaluType::BlaWLp as u8..=NaluType::CraNut as u8).contains(&nut)
    }

    /// Offset of the start code that was just completed, accounting for the
    /// extra zero byte of four byte start codes.
    fn start_code_offset(&self, i: usize) -> isize {
        let i = i as isize;
        if (self.state64 >> 48) & 0xff == 0 {
            i - 6
        } else {
            i - 5
        }
    }

    /// Scans `buf` for the first byte of the next access unit.
    ///
    /// Only the base layer is considered: NAL units with a non-zero
    /// nuh_layer_id never open or close an access unit.
    pub fn find_frame_end(&mut self, buf: &[u8]) -> FrameEnd {
        for (i, &byte) in buf.iter().enumerate() {
            self.state64 = (self.state64 << 8) | u64::from(byte);

            // Start code, two byte header and the first payload byte.
            if (self.state64 >> 24) & 0xff_ffff != 0x01 {
                continue;
            }

            let nut = ((self.state64 >> 17) & 0x3f) as u8;
            let layer_id = (self.state64 >> 11) & 0x3f;
            if layer_id > 0 {
                continue;
            }

            if Self::starts_access_unit(nut) {
                if self.frame_start_found {
                    self.frame_start_found = false;
                    return FrameEnd::Found(self.start_code_offset(i));
                }
            } else if Self::is_slice(nut) {
                let first_slice_segment_in_pic_flag = byte >> 7 == 1;
                if first_slice_segment_in_pic_flag {
                    if !self.frame_start_found {
                        self.frame_start_found = true;
                    } else {
                        self.frame_start_found = false;
                        return FrameEnd::Found(self.start_code_offset(i));
                    }
                }
            }
        }

        FrameEnd::NotFound
    }

    fn append(&mut self, data: &[u8]) -> Result<(), FrameSplitError> {
        let needed = self.buffer.len() + data.len();

        if self.buffer.capacity() < needed + BUFFER_PADDING {
            let new_size = std::cmp::max(needed + needed / 16 + 32, needed) + BUFFER_PADDING;
            self.buffer
                .try_reserve_exact(new_size - self.buffer.len())
                .map_err(|_| FrameSplitError::OutOfMemory(new_size))?;
        }

        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Feeds `input` into the splitter.
    ///
    /// Returns the number of bytes of `input` consumed, and the completed
    /// access unit if its end was found. Unconsumed bytes must be fed again
    /// on the next call. An empty `input` flushes whatever is buffered as the
    /// last access unit of the stream.
    pub fn split(&mut self, input: &[u8]) -> Result<(usize, Option<Vec<u8>>), FrameSplitError> {
        if input.is_empty() {
            let au = std::mem::take(&mut self.buffer);
            self.state64 = u64::MAX;
            self.frame_start_found = false;
            return Ok((0, if au.is_empty() { None } else { Some(au) }));
        }

        match self.find_frame_end(input) {
            FrameEnd::NotFound => {
                self.append(input)?;
                Ok((input.len(), None))
            }
            FrameEnd::Found(end) if end >= 0 => {
                let end = end as usize;
                self.append(&input[..end])?;
                let au = std::mem::take(&mut self.buffer);

                // The start code will be scanned again with the rest of the
                // input.
                self.state64 = u64::MAX;

                Ok((end, Some(au)))
            }
            FrameEnd::Found(end) => {
                let buffered = self.buffer.len();
                let split_at = buffered
                    .checked_add_signed(end)
                    .ok_or(FrameSplitError::InvalidEnd { end, buffered })?;

                // The bytes read past the boundary belong to the next access
                // unit. Keep them at the front of the buffer and rescan them,
                // the input itself is left unconsumed.
                let overread = self.buffer.split_off(split_at);
                let au = std::mem::replace(&mut self.buffer, overread);

                self.state64 = u64::MAX;
                for &byte in &self.buffer {
                    self.state64 = (self.state64 << 8) | u64::from(byte);
                }

                log::trace!(
                    "access unit of {} bytes closed with {} bytes overread",
                    au.len(),
                    self.buffer.len()
                );

                Ok((0, Some(au)))
            }
        }
    }
}
