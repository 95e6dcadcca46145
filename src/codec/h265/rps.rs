// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Short-term and long-term reference picture set syntax. See 7.3.7 and
//! 7.4.8.

use anyhow::anyhow;

use crate::bitstream_utils::BitReader;
use crate::codec::h265::parser::Sps;

/// Maximum number of pictures in a single reference category.
pub const MAX_REFS: usize = 16;

/// Capacity of a decoded short-term or long-term set.
pub const MAX_RPS_ENTRIES: usize = 32;

/// Bound of abs_delta_rps_minus1 + 1 and delta_poc_s{0,1}_minus1 + 1.
const MAX_DELTA_POC: u32 = 1 << 15;

/// A decoded st_ref_pic_set().
///
/// Entries are kept in the order the reference list construction expects:
/// the `num_negative_pics` negative deltas first, closest to the current
/// picture first, followed by the positive deltas in ascending order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShortTermRefPicSet {
    pub inter_ref_pic_set_prediction_flag: bool,
    /// Only meaningful for sets signalled in a slice header.
    pub delta_idx_minus1: u8,
    /// NumDeltaPocs of the set used for prediction, when this set was
    /// predicted from the SPS in a slice header.
    pub rps_idx_num_delta_pocs: u8,
    pub num_negative_pics: u8,
    pub num_delta_pocs: u8,
    pub delta_poc: [i32; MAX_RPS_ENTRIES],
    pub used: [bool; MAX_RPS_ENTRIES],
}

impl ShortTermRefPicSet {
    pub fn num_positive_pics(&self) -> u8 {
        self.num_delta_pocs - self.num_negative_pics
    }

    /// The negative entries, as `(delta_poc, used_by_curr_pic)` pairs.
    pub fn negative(&self) -> impl Iterator<Item = (i32, bool)> + '_ {
        let n = usize::from(self.num_negative_pics);
        self.delta_poc[..n]
            .iter()
            .copied()
            .zip(self.used[..n].iter().copied())
    }

    /// The positive entries, as `(delta_poc, used_by_curr_pic)` pairs.
    pub fn positive(&self) -> impl Iterator<Item = (i32, bool)> + '_ {
        let range = usize::from(self.num_negative_pics)..usize::from(self.num_delta_pocs);
        self.delta_poc[range.clone()]
            .iter()
            .copied()
            .zip(self.used[range].iter().copied())
    }

    /// Number of entries used by the current picture.
    pub fn num_used(&self) -> usize {
        self.used[..usize::from(self.num_delta_pocs)]
            .iter()
            .filter(|used| **used)
            .count()
    }

    /// Parses the `idx`-th st_ref_pic_set(), `sets` holding the SPS sets
    /// already decoded. Sets signalled in a slice header use
    /// `idx == num_short_term_ref_pic_sets`.
    pub fn parse(
        r: &mut BitReader,
        idx: usize,
        sets: &[ShortTermRefPicSet],
        in_slice_header: bool,
    ) -> anyhow::Result<Self> {
        let mut rps = ShortTermRefPicSet::default();

        if idx != 0 {
            rps.inter_ref_pic_set_prediction_flag = r.read_bit()?;
        }

        if rps.inter_ref_pic_set_prediction_flag {
            let ref_idx = if in_slice_header {
                rps.delta_idx_minus1 = r.read_ue_max(sets.len().saturating_sub(1) as u32)?;
                let delta_idx = usize::from(rps.delta_idx_minus1) + 1;
                idx.checked_sub(delta_idx)
                    .ok_or(anyhow!("Invalid delta_idx_minus1 {}", rps.delta_idx_minus1))?
            } else {
                idx - 1
            };

            let ref_rps = sets
                .get(ref_idx)
                .ok_or(anyhow!("Invalid reference RPS index {}", ref_idx))?;

            if in_slice_header {
                rps.rps_idx_num_delta_pocs = ref_rps.num_delta_pocs;
            }

            rps.parse_predicted(r, ref_rps)?;
        } else {
            rps.parse_explicit(r)?;
        }

        Ok(rps)
    }

    fn parse_predicted(
        &mut self,
        r: &mut BitReader,
        ref_rps: &ShortTermRefPicSet,
    ) -> anyhow::Result<()> {
        let delta_rps_sign = r.read_bit()?;
        let abs_delta_rps = r.read_ue::<u32>()? + 1;
        if abs_delta_rps > MAX_DELTA_POC {
            return Err(anyhow!("Invalid abs_delta_rps_minus1 {}", abs_delta_rps - 1));
        }

        let delta_rps = if delta_rps_sign {
            -(abs_delta_rps as i32)
        } else {
            abs_delta_rps as i32
        };

        let mut k = 0;
        let mut k0 = 0;

        // The extra iteration stands for the reference picture itself.
        for i in 0..=usize::from(ref_rps.num_delta_pocs) {
            let used_by_curr_pic_flag = r.read_bit()?;
            let use_delta_flag = if used_by_curr_pic_flag {
                true
            } else {
                r.read_bit()?
            };

            if used_by_curr_pic_flag || use_delta_flag {
                if k >= MAX_RPS_ENTRIES {
                    return Err(anyhow!("Too many entries in predicted short-term RPS"));
                }

                let delta_poc = if i < usize::from(ref_rps.num_delta_pocs) {
                    delta_rps + ref_rps.delta_poc[i]
                } else {
                    delta_rps
                };

                self.delta_poc[k] = delta_poc;
                self.used[k] = used_by_curr_pic_flag;

                if delta_poc < 0 {
                    k0 += 1;
                }

                k += 1;
            }
        }

        self.num_delta_pocs = k as u8;
        self.num_negative_pics = k0 as u8;

        self.sort();

        Ok(())
    }

    /// Sorts the entries in ascending order, then mirrors the negative
    /// prefix so that it starts with the delta closest to zero. Exactly
    /// `num_negative_pics / 2` pairs are swapped.
    fn sort(&mut self) {
        let n = usize::from(self.num_delta_pocs);

        for i in 1..n {
            let delta_poc = self.delta_poc[i];
            let used = self.used[i];
            let mut j = i;

            while j > 0 && delta_poc < self.delta_poc[j - 1] {
                self.delta_poc[j] = self.delta_poc[j - 1];
                self.used[j] = self.used[j - 1];
                j -= 1;
            }

            self.delta_poc[j] = delta_poc;
            self.used[j] = used;
        }

        let num_negative = usize::from(self.num_negative_pics);
        for i in 0..num_negative >> 1 {
            let k = num_negative - 1 - i;
            self.delta_poc.swap(i, k);
            self.used.swap(i, k);
        }
    }

    fn parse_explicit(&mut self, r: &mut BitReader) -> anyhow::Result<()> {
        let num_negative_pics: u8 = r.read_ue_max(MAX_REFS as u32 - 1)?;
        let num_positive_pics: u8 = r.read_ue_max(MAX_REFS as u32 - 1)?;

        self.num_negative_pics = num_negative_pics;
        self.num_delta_pocs = num_negative_pics + num_positive_pics;

        let mut prev = 0;
        for i in 0..usize::from(num_negative_pics) {
            let delta_poc_s0 = r.read_ue_max::<u32>(MAX_DELTA_POC - 1)? + 1;
            prev -= delta_poc_s0 as i32;
            self.delta_poc[i] = prev;
            self.used[i] = r.read_bit()?;
        }

        let mut prev = 0;
        for i in usize::from(num_negative_pics)..usize::from(self.num_delta_pocs) {
            let delta_poc_s1 = r.read_ue_max::<u32>(MAX_DELTA_POC - 1)? + 1;
            prev += delta_poc_s1 as i32;
            self.delta_poc[i] = prev;
            self.used[i] = r.read_bit()?;
        }

        Ok(())
    }
}

/// The long-term part of a slice header RPS.
///
/// Parsing only records the signalled values. The POCs themselves depend
/// on the POC of the current picture and are resolved afterwards with
/// [`LongTermRefPicSet::derive_pocs`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LongTermRefPicSet {
    pub num_long_term_sps: u8,
    pub num_long_term_pics: u8,
    pub lt_idx_sps: [u8; MAX_RPS_ENTRIES],
    /// PocLsbLt.
    pub poc_lsb_lt: [u32; MAX_RPS_ENTRIES],
    /// UsedByCurrPicLt.
    pub used_by_curr_pic_lt: [bool; MAX_RPS_ENTRIES],
    pub delta_poc_msb_present_flag: [bool; MAX_RPS_ENTRIES],
    /// DeltaPocMsbCycleLt, see (7-52).
    pub delta_poc_msb_cycle_lt: [i64; MAX_RPS_ENTRIES],
    /// The full POC when the MSB is present, the POC LSB otherwise.
    pub poc: [i32; MAX_RPS_ENTRIES],
}

impl LongTermRefPicSet {
    pub fn num_refs(&self) -> usize {
        usize::from(self.num_long_term_sps) + usize::from(self.num_long_term_pics)
    }

    /// Number of entries used by the current picture.
    pub fn num_used(&self) -> usize {
        self.used_by_curr_pic_lt[..self.num_refs()]
            .iter()
            .filter(|used| **used)
            .count()
    }

    /// Parses the long-term entries of a slice header. The caller checks
    /// long_term_ref_pics_present_flag.
    pub fn parse(r: &mut BitReader, sps: &Sps) -> anyhow::Result<Self> {
        let mut lt = LongTermRefPicSet::default();

        let num_long_term_sps: u32 = if sps.num_long_term_ref_pics_sps > 0 {
            r.read_ue()?
        } else {
            0
        };
        let num_long_term_pics: u32 = r.read_ue()?;

        if num_long_term_sps > u32::from(sps.num_long_term_ref_pics_sps) {
            return Err(anyhow!("Invalid num_long_term_sps {}", num_long_term_sps));
        }

        if u64::from(num_long_term_sps) + u64::from(num_long_term_pics)
            > MAX_RPS_ENTRIES as u64
        {
            return Err(anyhow!(
                "Too many long-term references: {} + {}",
                num_long_term_sps,
                num_long_term_pics
            ));
        }

        lt.num_long_term_sps = num_long_term_sps as u8;
        lt.num_long_term_pics = num_long_term_pics as u8;

        let nb_sps = usize::from(lt.num_long_term_sps);
        let lsb_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
        let mut prev_delta_msb = 0i64;

        for i in 0..lt.num_refs() {
            if i < nb_sps {
                if sps.num_long_term_ref_pics_sps > 1 {
                    let num_bits = ceil_log2(u32::from(sps.num_long_term_ref_pics_sps));
                    lt.lt_idx_sps[i] = r.read_bits(num_bits)?;

                    if lt.lt_idx_sps[i] >= sps.num_long_term_ref_pics_sps {
                        return Err(anyhow!("Invalid lt_idx_sps[{}] {}", i, lt.lt_idx_sps[i]));
                    }
                }

                let idx = usize::from(lt.lt_idx_sps[i]);
                lt.poc_lsb_lt[i] = sps.lt_ref_pic_poc_lsb_sps[idx];
                lt.used_by_curr_pic_lt[i] = sps.used_by_curr_pic_lt_sps_flag[idx];
            } else {
                lt.poc_lsb_lt[i] = r.read_bits(lsb_bits)?;
                lt.used_by_curr_pic_lt[i] = r.read_bit()?;
            }

            lt.poc[i] = lt.poc_lsb_lt[i] as i32;

            lt.delta_poc_msb_present_flag[i] = r.read_bit()?;
            if lt.delta_poc_msb_present_flag[i] {
                let mut delta = i64::from(r.read_ue::<u32>()?);

                // The first entry after the SPS candidates starts a new
                // accumulation.
                if i != 0 && i != nb_sps {
                    delta += prev_delta_msb;
                }

                lt.delta_poc_msb_cycle_lt[i] = delta;
                prev_delta_msb = delta;
            }
        }

        Ok(lt)
    }

    /// Resolves the POC of every entry signalling its MSB. See (8-5).
    pub fn derive_pocs(
        &mut self,
        current_poc: i32,
        pic_order_cnt_lsb: u32,
        max_poc_lsb: u32,
    ) -> anyhow::Result<()> {
        for i in 0..self.num_refs() {
            if !self.delta_poc_msb_present_flag[i] {
                self.poc[i] = self.poc_lsb_lt[i] as i32;
                continue;
            }

            let poc = i64::from(self.poc_lsb_lt[i]) + i64::from(current_poc)
                - self.delta_poc_msb_cycle_lt[i] * i64::from(max_poc_lsb)
                - i64::from(pic_order_cnt_lsb);

            self.poc[i] = i32::try_from(poc)
                .map_err(|_| anyhow!("Long-term reference POC {} out of range", poc))?;
        }

        Ok(())
    }
}

/// Number of bits needed to code values in `0..v`.
pub(crate) fn ceil_log2(v: u32) -> usize {
    if v <= 1 {
        0
    } else {
        (32 - (v - 1).leading_zeros()) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream_utils::NaluWriter;

    fn write_explicit(w: &mut NaluWriter<&mut Vec<u8>>, negative: &[u32], positive: &[u32]) {
        w.write_ue(negative.len() as u32).unwrap();
        w.write_ue(positive.len() as u32).unwrap();
        for d in negative.iter().chain(positive) {
            w.write_ue(*d - 1).unwrap();
            w.write_flag(true).unwrap();
        }
    }

    /// Parses an explicit set as set 0 and a predicted one as set 1.
    fn predict(
        negative: &[u32],
        positive: &[u32],
        delta_rps: i32,
        flags: &[(bool, bool)],
    ) -> ShortTermRefPicSet {
        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::new(&mut buf, false);
            write_explicit(&mut w, negative, positive);

            w.write_flag(true).unwrap(); // inter_ref_pic_set_prediction_flag
            w.write_flag(delta_rps < 0).unwrap();
            w.write_ue(delta_rps.unsigned_abs() - 1).unwrap();
            for (used, use_delta) in flags {
                w.write_flag(*used).unwrap();
                if !used {
                    w.write_flag(*use_delta).unwrap();
                }
            }
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        let set0 = ShortTermRefPicSet::parse(&mut r, 0, &[], false).unwrap();
        ShortTermRefPicSet::parse(&mut r, 1, &[set0], false).unwrap()
    }

    fn deltas(rps: &ShortTermRefPicSet) -> Vec<i32> {
        rps.delta_poc[..usize::from(rps.num_delta_pocs)].to_vec()
    }

    #[test]
    fn explicit() {
        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::new(&mut buf, false);
            write_explicit(&mut w, &[1, 2, 4], &[1, 3]);
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        let rps = ShortTermRefPicSet::parse(&mut r, 0, &[], false).unwrap();
        assert_eq!(rps.num_negative_pics, 3);
        assert_eq!(rps.num_positive_pics(), 2);
        assert_eq!(deltas(&rps), vec![-1, -3, -7, 1, 4]);
        assert_eq!(rps.num_used(), 5);
        assert_eq!(
            rps.positive().collect::<Vec<_>>(),
            vec![(1, true), (4, true)]
        );
    }

    #[test]
    fn explicit_too_many_pics() {
        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::new(&mut buf, false);
            w.write_ue(16u32).unwrap();
            w.write_ue(0u32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        assert!(ShortTermRefPicSet::parse(&mut r, 0, &[], false).is_err());
    }

    #[test]
    fn predicted_ordering() {
        // Reference set {-1, -3, +2}, shifted by -1 and extended by the
        // reference picture itself.
        let rps = predict(&[1, 2], &[2], -1, &[(true, false); 4]);
        assert_eq!(rps.num_negative_pics, 3);
        assert_eq!(rps.num_delta_pocs, 4);
        assert_eq!(deltas(&rps), vec![-1, -2, -4, 1]);

        // Property: negatives descending, positives ascending.
        for delta_rps in [-3, -1, 1, 2, 5] {
            let rps = predict(&[1, 1, 3], &[2, 2], delta_rps, &[(true, false); 6]);
            let n = usize::from(rps.num_negative_pics);
            let d = deltas(&rps);

            assert!(d[..n].iter().all(|x| *x < 0));
            assert!(d[n..].iter().all(|x| *x >= 0));
            assert!(d[..n].windows(2).all(|w| w[0] >= w[1]));
            assert!(d[n..].windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn predicted_mirror_swap() {
        // Three negatives: one swap, the middle entry stays in place.
        let rps = predict(&[1, 2], &[], -1, &[(true, false); 3]);
        assert_eq!(deltas(&rps), vec![-1, -2, -4]);

        // Four negatives: two swaps.
        let rps = predict(&[1, 2, 4], &[], -1, &[(true, false); 4]);
        assert_eq!(deltas(&rps), vec![-1, -2, -4, -8]);

        // A single negative is left alone.
        let rps = predict(&[1], &[], 2, &[(true, false); 2]);
        assert_eq!(rps.num_negative_pics, 0);
        assert_eq!(deltas(&rps), vec![1, 2]);
    }

    #[test]
    fn predicted_used_flags_follow_entries() {
        // Reference {-2, -4}. delta_rps -1 gives {-3, -5, -1}; the first
        // entry is only kept through use_delta_flag, the second is dropped.
        let rps = predict(&[2, 2], &[], -1, &[(false, true), (false, false), (true, false)]);
        assert_eq!(deltas(&rps), vec![-1, -3]);
        assert_eq!(&rps.used[..2], &[true, false]);
        assert_eq!(rps.num_used(), 1);
    }

    #[test]
    fn predicted_in_slice_header() {
        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::new(&mut buf, false);
            write_explicit(&mut w, &[1], &[]);
            w.write_flag(false).unwrap(); // inter_ref_pic_set_prediction_flag
            write_explicit(&mut w, &[2], &[]);

            // Slice header set, predicted from set 0 (delta_idx 2).
            w.write_flag(true).unwrap();
            w.write_ue(1u32).unwrap(); // delta_idx_minus1
            w.write_flag(true).unwrap(); // delta_rps_sign
            w.write_ue(0u32).unwrap(); // abs_delta_rps_minus1
            w.write_flag(true).unwrap();
            w.write_flag(true).unwrap();

            // Invalid delta_idx_minus1.
            w.write_flag(true).unwrap();
            w.write_ue(2u32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        let mut sets = vec![];
        for idx in 0..2 {
            let set = ShortTermRefPicSet::parse(&mut r, idx, &sets, false).unwrap();
            sets.push(set);
        }
        assert_eq!(deltas(&sets[1]), vec![-2]);

        let rps = ShortTermRefPicSet::parse(&mut r, 2, &sets, true).unwrap();
        assert_eq!(rps.rps_idx_num_delta_pocs, 1);
        assert_eq!(deltas(&rps), vec![-1, -2]);

        assert!(ShortTermRefPicSet::parse(&mut r, 2, &sets, true).is_err());
    }

    #[test]
    fn long_term_msb_accumulation() {
        let mut sps = Sps {
            log2_max_pic_order_cnt_lsb_minus4: 4,
            num_long_term_ref_pics_sps: 3,
            ..Default::default()
        };
        sps.lt_ref_pic_poc_lsb_sps[2] = 5;
        sps.used_by_curr_pic_lt_sps_flag[2] = true;

        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::new(&mut buf, false);
            w.write_ue(1u32).unwrap(); // num_long_term_sps
            w.write_ue(2u32).unwrap(); // num_long_term_pics

            // Entry 0, from the SPS.
            w.write_f(2, 2u32).unwrap(); // lt_idx_sps
            w.write_flag(true).unwrap();
            w.write_ue(1u32).unwrap();

            // Entry 1, first explicit one: no accumulation.
            w.write_f(8, 10u32).unwrap();
            w.write_flag(true).unwrap();
            w.write_flag(true).unwrap();
            w.write_ue(2u32).unwrap();

            // Entry 2, accumulates onto entry 1.
            w.write_f(8, 20u32).unwrap();
            w.write_flag(false).unwrap();
            w.write_flag(true).unwrap();
            w.write_ue(1u32).unwrap();
            w.write_trailing_bits().unwrap();
        }

        let mut r = BitReader::new(&buf);
        let mut lt = LongTermRefPicSet::parse(&mut r, &sps).unwrap();
        assert_eq!(lt.num_refs(), 3);
        assert_eq!(lt.num_used(), 2);
        assert_eq!(&lt.delta_poc_msb_cycle_lt[..3], &[1, 2, 3]);

        // Current POC 300, lsb 300 % 256 = 44.
        lt.derive_pocs(300, 44, 256).unwrap();
        assert_eq!(
            &lt.poc[..3],
            &[5, 10 + 256 - 2 * 256, 20 + 256 - 3 * 256]
        );
    }

    #[test]
    fn long_term_bounds() {
        let sps = Sps {
            num_long_term_ref_pics_sps: 1,
            ..Default::default()
        };

        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::new(&mut buf, false);
            w.write_ue(2u32).unwrap(); // more than the SPS declares
            w.write_ue(0u32).unwrap();
            w.write_trailing_bits().unwrap();
        }
        let mut r = BitReader::new(&buf);
        assert!(LongTermRefPicSet::parse(&mut r, &sps).is_err());

        let mut buf = Vec::new();
        {
            let mut w = NaluWriter::new(&mut buf, false);
            w.write_ue(1u32).unwrap();
            w.write_ue(32u32).unwrap(); // 33 entries in total
            w.write_trailing_bits().unwrap();
        }
        let mut r = BitReader::new(&buf);
        assert!(LongTermRefPicSet::parse(&mut r, &sps).is_err());
    }

    #[test]
    fn ceil_log2_values() {
        assert_eq!(ceil_log2(0), 0);
        assert_eq!(ceil_log2(1), 0);
        assert_eq!(ceil_log2(2), 1);
        assert_eq!(ceil_log2(3), 2);
        assert_eq!(ceil_log2(4), 2);
        assert_eq!(ceil_log2(5), 3);
        assert_eq!(ceil_log2(64), 6);
    }
}
