// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoded picture buffer.
//!
//! An entry only associates a POC and its reference state with a frame
//! buffer slot. Slots are handed in by the caller and are never allocated or
//! released here: a released entry simply forgets its slot.

use bitflags::bitflags;
use thiserror::Error;

use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::rps::LongTermRefPicSet;
use crate::codec::h265::rps::ShortTermRefPicSet;
use crate::codec::h265::rps::MAX_REFS;

/// Number of entries of the DPB: 16 pictures plus the current one.
pub const MAX_DPB_SIZE: usize = 17;

/// POC of a free entry.
pub const POC_MAX: i32 = i32::MAX;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Waiting to be output.
        const OUTPUT = 1 << 0;
        const SHORT_REF = 1 << 1;
        const LONG_REF = 1 << 2;
        /// Must be output even if the reorder window is not full.
        const BUMPING = 1 << 3;
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DpbError {
    #[error("no free entry left in the DPB")]
    Full,
    #[error("POC {0} is already in the DPB for the current sequence")]
    DuplicatePoc(i32),
    #[error("DPB index {0} does not refer to an occupied entry")]
    StaleIndex(usize),
    #[error("more than {} pictures in a reference picture set list", MAX_REFS)]
    TooManyRefs,
    #[error("the current picture (POC {0}) is referenced by its own RPS")]
    CurrentPictureReferenced(i32),
}

/// Index of an entry of a [`Dpb`]. Only the DPB hands these out, and they
/// are checked again whenever they are resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DpbIndex(u8);

impl DpbIndex {
    pub fn get(self) -> usize {
        usize::from(self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DpbEntry<T> {
    /// The frame buffer slot this picture is decoded into. `None` for free
    /// entries.
    pub slot: Option<T>,
    pub poc: i32,
    /// Sequence counter at the time the picture was added.
    pub sequence: u8,
    pub flags: FrameFlags,
    /// Set for generated references and for pictures the hardware failed to
    /// decode.
    pub error_flag: bool,
}

impl<T> DpbEntry<T> {
    fn free() -> Self {
        Self {
            slot: None,
            poc: POC_MAX,
            sequence: 0,
            flags: FrameFlags::empty(),
            error_flag: false,
        }
    }

    pub fn is_free(&self) -> bool {
        self.slot.is_none()
    }

    pub fn is_long_term(&self) -> bool {
        self.flags.contains(FrameFlags::LONG_REF)
    }
}

/// The five lists of a reference picture set. See 8.3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpsCategory {
    StCurrBefore = 0,
    StCurrAfter = 1,
    StFoll = 2,
    LtCurr = 3,
    LtFoll = 4,
}

impl RpsCategory {
    pub fn is_long_term(self) -> bool {
        matches!(self, Self::LtCurr | Self::LtFoll)
    }

    /// Whether pictures of this category may be used by the current picture.
    pub fn is_curr(self) -> bool {
        matches!(self, Self::StCurrBefore | Self::StCurrAfter | Self::LtCurr)
    }
}

/// A picture the RPS of the current picture refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RpsEntry {
    pub poc: i32,
    /// Bits of the POC that identify the picture. Long-term pictures without
    /// delta_poc_msb_present_flag are only identified by their LSBs.
    pub mask: i32,
    pub category: RpsCategory,
}

impl RpsEntry {
    /// Lists the pictures referred to by the short-term and long-term RPS of
    /// the picture with POC `poc`. The long-term POCs must have been derived
    /// already.
    pub fn from_rps(
        poc: i32,
        st: &ShortTermRefPicSet,
        lt: &LongTermRefPicSet,
        max_poc_lsb: u32,
    ) -> Vec<RpsEntry> {
        let mut entries = Vec::with_capacity(usize::from(st.num_delta_pocs) + lt.num_refs());

        for (delta_poc, used) in st.negative() {
            entries.push(RpsEntry {
                poc: poc + delta_poc,
                mask: -1,
                category: if used {
                    RpsCategory::StCurrBefore
                } else {
                    RpsCategory::StFoll
                },
            });
        }

        for (delta_poc, used) in st.positive() {
            entries.push(RpsEntry {
                poc: poc + delta_poc,
                mask: -1,
                category: if used {
                    RpsCategory::StCurrAfter
                } else {
                    RpsCategory::StFoll
                },
            });
        }

        for i in 0..lt.num_refs() {
            entries.push(RpsEntry {
                poc: lt.poc[i],
                mask: if lt.delta_poc_msb_present_flag[i] {
                    -1
                } else {
                    max_poc_lsb as i32 - 1
                },
                category: if lt.used_by_curr_pic_lt[i] {
                    RpsCategory::LtCurr
                } else {
                    RpsCategory::LtFoll
                },
            });
        }

        entries
    }
}

/// The reference picture set of the current picture, resolved to DPB
/// entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicSet {
    lists: [Vec<DpbIndex>; 5],
}

impl RefPicSet {
    const LIST0_ORDER: [RpsCategory; 3] = [
        RpsCategory::StCurrBefore,
        RpsCategory::StCurrAfter,
        RpsCategory::LtCurr,
    ];
    const LIST1_ORDER: [RpsCategory; 3] = [
        RpsCategory::StCurrAfter,
        RpsCategory::StCurrBefore,
        RpsCategory::LtCurr,
    ];

    pub fn get(&self, category: RpsCategory) -> &[DpbIndex] {
        &self.lists[category as usize]
    }

    fn push(&mut self, category: RpsCategory, index: DpbIndex) -> Result<(), DpbError> {
        let list = &mut self.lists[category as usize];
        if list.len() >= MAX_REFS {
            return Err(DpbError::TooManyRefs);
        }

        list.push(index);
        Ok(())
    }

    /// NumPicTotalCurr, not counting the current picture.
    pub fn num_pic_total_curr(&self) -> usize {
        self.get(RpsCategory::StCurrBefore).len()
            + self.get(RpsCategory::StCurrAfter).len()
            + self.get(RpsCategory::LtCurr).len()
    }

    /// Builds RefPicList0 and RefPicList1 for the slice `hdr`. See 8.3.4.
    pub fn ref_pic_lists(&self, hdr: &SliceHeader) -> Result<[Vec<DpbIndex>; 2], DpbError> {
        let mut lists: [Vec<DpbIndex>; 2] = Default::default();

        if hdr.type_.is_i() {
            return Ok(lists);
        }

        if self.num_pic_total_curr() == 0 {
            log::warn!("No reference picture available for a {:?} slice", hdr.type_);
            return Ok(lists);
        }

        let rplm = &hdr.ref_pic_list_modification;

        // Equations 8-8 and 8-9.
        let num_active = usize::from(hdr.num_ref_idx_l0_active_minus1) + 1;
        let temp = self.temp_list(Self::LIST0_ORDER, num_active);
        lists[0] = Self::modified_list(
            &temp,
            num_active,
            rplm.ref_pic_list_modification_flag_l0,
            &rplm.list_entry_l0,
        )?;

        if hdr.type_.is_b() {
            // Equations 8-10 and 8-11.
            let num_active = usize::from(hdr.num_ref_idx_l1_active_minus1) + 1;
            let temp = self.temp_list(Self::LIST1_ORDER, num_active);
            lists[1] = Self::modified_list(
                &temp,
                num_active,
                rplm.ref_pic_list_modification_flag_l1,
                &rplm.list_entry_l1,
            )?;
        }

        Ok(lists)
    }

    /// RefPicListTemp: the `order` lists repeated until there are at least
    /// `num_active` entries.
    fn temp_list(&self, order: [RpsCategory; 3], num_active: usize) -> Vec<DpbIndex> {
        let num_rps_curr_temp_list = std::cmp::max(num_active, self.num_pic_total_curr());

        order
            .iter()
            .flat_map(|category| self.get(*category))
            .copied()
            .cycle()
            .take(num_rps_curr_temp_list)
            .collect()
    }

    fn modified_list(
        temp: &[DpbIndex],
        num_active: usize,
        modified: bool,
        list_entry: &[u8],
    ) -> Result<Vec<DpbIndex>, DpbError> {
        (0..num_active)
            .map(|r_idx| {
                let idx = if modified {
                    usize::from(list_entry[r_idx])
                } else {
                    r_idx
                };

                temp.get(idx).copied().ok_or(DpbError::StaleIndex(idx))
            })
            .collect()
    }
}

/// A picture leaving the DPB for display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutputFrame<T> {
    pub slot: T,
    pub poc: i32,
    pub error_flag: bool,
}

pub struct Dpb<T> {
    entries: [DpbEntry<T>; MAX_DPB_SIZE],
    /// Sequence pictures are currently decoded in.
    seq_decode: u8,
    /// Sequence pictures are currently output from. Lags behind `seq_decode`
    /// until all pictures of the previous sequences have been output.
    seq_output: u8,
}

impl<T: Copy + PartialEq + std::fmt::Debug> Dpb<T> {
    pub fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| DpbEntry::free()),
            seq_decode: 0,
            seq_output: 0,
        }
    }

    /// Returns the occupied entries along with their indices.
    pub fn entries(&self) -> impl Iterator<Item = (DpbIndex, &DpbEntry<T>)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.is_free())
            .map(|(i, entry)| (DpbIndex(i as u8), entry))
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves `index`, which must still point to an occupied entry.
    pub fn get(&self, index: DpbIndex) -> Result<&DpbEntry<T>, DpbError> {
        self.entries
            .get(index.get())
            .filter(|entry| !entry.is_free())
            .ok_or(DpbError::StaleIndex(index.get()))
    }

    /// The slot of the picture at `index`.
    pub fn slot(&self, index: DpbIndex) -> Result<T, DpbError> {
        self.get(index)?
            .slot
            .ok_or(DpbError::StaleIndex(index.get()))
    }

    pub fn sequence(&self) -> u8 {
        self.seq_decode
    }

    /// Starts a new sequence. Pictures of the previous ones are no longer
    /// found as references, and are output before any picture of the new
    /// one.
    pub fn next_sequence(&mut self) {
        self.seq_decode = self.seq_decode.wrapping_add(1);
        log::debug!("Starting decode sequence {}", self.seq_decode);
    }

    fn release(&mut self, i: usize) {
        log::debug!("Releasing POC {} from the DPB", self.entries[i].poc);
        self.entries[i] = DpbEntry::free();
    }

    /// Clears `flags` from the entry at `i`, releasing it if nothing else
    /// holds it.
    fn unref_frame(&mut self, i: usize, flags: FrameFlags) {
        self.entries[i].flags.remove(flags);
        if self.entries[i].flags.is_empty() {
            self.release(i);
        }
    }

    fn alloc_entry(&mut self, poc: i32, slot: T, flags: FrameFlags) -> Result<DpbIndex, DpbError> {
        let i = self
            .entries
            .iter()
            .position(DpbEntry::is_free)
            .ok_or(DpbError::Full)?;

        self.entries[i] = DpbEntry {
            slot: Some(slot),
            poc,
            sequence: self.seq_decode,
            flags,
            error_flag: false,
        };

        Ok(DpbIndex(i as u8))
    }

    /// Adds the current picture to the DPB, marked as short-term reference
    /// and, if `output` is set, as waiting for output.
    pub fn add_frame(&mut self, poc: i32, slot: T, output: bool) -> Result<DpbIndex, DpbError> {
        if self
            .entries()
            .any(|(_, entry)| entry.sequence == self.seq_decode && entry.poc == poc)
        {
            return Err(DpbError::DuplicatePoc(poc));
        }

        let mut flags = FrameFlags::SHORT_REF;
        if output {
            flags |= FrameFlags::OUTPUT;
        }

        let index = self.alloc_entry(poc, slot, flags)?;
        log::debug!(
            "Added POC {} to the DPB at {}, {} entries in use",
            poc,
            index.get(),
            self.len()
        );

        Ok(index)
    }

    /// Looks up a picture of the current sequence by POC, comparing only the
    /// bits in `mask`.
    pub fn find_ref_idx(&self, poc: i32, mask: i32) -> Option<DpbIndex> {
        self.entries()
            .find(|(_, entry)| entry.sequence == self.seq_decode && (entry.poc & mask) == poc)
            .map(|(index, _)| index)
    }

    /// Adds a placeholder for a reference picture missing from the stream.
    fn generate_missing_ref(&mut self, poc: i32, slot: T) -> Result<DpbIndex, DpbError> {
        let index = self.alloc_entry(poc, slot, FrameFlags::empty())?;
        self.entries[index.get()].error_flag = true;
        Ok(index)
    }

    fn add_candidate_ref<E: From<DpbError>>(
        &mut self,
        current: DpbIndex,
        entry: &RpsEntry,
        missing: &mut impl FnMut(&RpsEntry) -> Result<Option<T>, E>,
    ) -> Result<Option<DpbIndex>, E> {
        let index = match self.find_ref_idx(entry.poc, entry.mask) {
            Some(index) if index == current => {
                return Err(DpbError::CurrentPictureReferenced(entry.poc).into())
            }
            Some(index) => index,
            None => {
                let slot = match missing(entry)? {
                    Some(slot) => slot,
                    None => return Ok(None),
                };

                log::warn!(
                    "Generating missing reference POC {} ({:?})",
                    entry.poc,
                    entry.category
                );
                self.generate_missing_ref(entry.poc, slot)?
            }
        };

        let flag = if entry.category.is_long_term() {
            FrameFlags::LONG_REF
        } else {
            FrameFlags::SHORT_REF
        };

        let flags = &mut self.entries[index.get()].flags;
        flags.remove(FrameFlags::SHORT_REF | FrameFlags::LONG_REF);
        flags.insert(flag);

        Ok(Some(index))
    }

    /// Applies the reference picture set of the picture at `current`. See
    /// 8.3.2.
    ///
    /// Every picture in `refs` is marked as short-term or long-term
    /// reference, and every other picture loses its reference marking.
    /// Pictures the DPB does not hold are passed to `missing`, which either
    /// returns a slot to generate a placeholder into, skips the picture, or
    /// fails.
    pub fn frame_rps<E: From<DpbError>>(
        &mut self,
        current: DpbIndex,
        refs: &[RpsEntry],
        mut missing: impl FnMut(&RpsEntry) -> Result<Option<T>, E>,
    ) -> Result<RefPicSet, E> {
        self.get(current)?;

        for i in 0..MAX_DPB_SIZE {
            if i != current.get() && !self.entries[i].is_free() {
                self.entries[i]
                    .flags
                    .remove(FrameFlags::SHORT_REF | FrameFlags::LONG_REF);
            }
        }

        let mut rps = RefPicSet::default();
        let result = refs.iter().try_for_each(|entry| {
            if let Some(index) = self.add_candidate_ref(current, entry, &mut missing)? {
                rps.push(entry.category, index)?;
            }

            Ok::<(), E>(())
        });

        // Whatever happened, do not keep pictures nothing refers to.
        for i in 0..MAX_DPB_SIZE {
            if !self.entries[i].is_free() && self.entries[i].flags.is_empty() {
                self.release(i);
            }
        }

        result.map(|()| rps)
    }

    /// Marks pictures for output when the DPB holds `max_dec_pic_buffering`
    /// pictures of the output sequence besides the current one. See C.5.2.2.
    pub fn bump_frame(&mut self, max_dec_pic_buffering: usize, current_poc: i32) {
        let seq_output = self.seq_output;
        let in_output_sequence =
            |entry: &DpbEntry<T>| entry.sequence == seq_output && entry.poc != current_poc;

        let dpb = self.entries().filter(|(_, e)| in_output_sequence(e)).count();
        if dpb < max_dec_pic_buffering {
            return;
        }

        let min_poc = self
            .entries()
            .filter(|(_, e)| in_output_sequence(e) && e.flags == FrameFlags::OUTPUT)
            .map(|(_, e)| e.poc)
            .min()
            .unwrap_or(POC_MAX);

        for entry in self.entries.iter_mut() {
            if !entry.is_free()
                && entry.flags.contains(FrameFlags::OUTPUT)
                && in_output_sequence(entry)
                && entry.poc <= min_poc
            {
                log::debug!("Bumping POC {}", entry.poc);
                entry.flags.insert(FrameFlags::BUMPING);
            }
        }
    }

    /// Drops the pending output of the pictures preceding an IRAP picture
    /// with no_output_of_prior_pics_flag set.
    pub fn discard_prior_output(&mut self, current_poc: i32) {
        for i in 0..MAX_DPB_SIZE {
            let entry = &self.entries[i];
            if !entry.is_free()
                && !entry.flags.contains(FrameFlags::BUMPING)
                && entry.sequence == self.seq_output
                && entry.poc != current_poc
            {
                self.unref_frame(i, FrameFlags::OUTPUT);
            }
        }
    }

    /// Returns the next picture to display, if any. See C.5.2.4.
    ///
    /// Unless `flush` is set, pictures are held back while no more than
    /// `max_num_reorder` of them wait for output.
    pub fn output_frame(&mut self, flush: bool, max_num_reorder: usize) -> Option<OutputFrame<T>> {
        loop {
            let candidates = self.entries().filter(|(_, e)| {
                e.flags.contains(FrameFlags::OUTPUT) && e.sequence == self.seq_output
            });

            let mut nb_output = 0;
            let mut bumping = false;
            let mut min: Option<(DpbIndex, i32)> = None;
            for (index, entry) in candidates {
                nb_output += 1;
                bumping |= entry.flags.contains(FrameFlags::BUMPING);
                if min.map_or(true, |(_, poc)| entry.poc < poc) {
                    min = Some((index, entry.poc));
                }
            }

            let wait = !flush && self.seq_output == self.seq_decode && !bumping;
            if wait && nb_output <= max_num_reorder {
                return None;
            }

            if let Some((index, _)) = min {
                let i = index.get();
                let entry = &self.entries[i];
                let frame = entry.slot.map(|slot| OutputFrame {
                    slot,
                    poc: entry.poc,
                    error_flag: entry.error_flag,
                });

                log::debug!("Output POC {} from the DPB", entry.poc);
                self.unref_frame(i, FrameFlags::OUTPUT | FrameFlags::BUMPING);

                return frame;
            }

            if self.seq_output != self.seq_decode {
                self.seq_output = self.seq_output.wrapping_add(1);
            } else {
                return None;
            }
        }
    }

    /// Sets the error flag of the picture decoded into `slot`.
    pub fn mark_error(&mut self, slot: T) -> bool {
        match self.entries.iter_mut().find(|e| e.slot == Some(slot)) {
            Some(entry) => {
                log::debug!("Marking POC {} as broken", entry.poc);
                entry.error_flag = true;
                true
            }
            None => false,
        }
    }

    /// Clears the DPB, dropping all the pictures.
    pub fn clear(&mut self) {
        log::debug!("Clearing the DPB");
        *self = Self::new();
    }
}

impl<T: Copy + PartialEq + std::fmt::Debug> Default for Dpb<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Dpb<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pics = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.slot.is_some())
            .collect::<Vec<_>>();
        f.debug_struct("Dpb")
            .field("pictures", &pics)
            .field("seq_decode", &self.seq_decode)
            .field("seq_output", &self.seq_output)
            .finish()
    }
}
