// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use crate::codec::h265::nalu::NaluType;
use crate::codec::h265::parser::Slice;

/// Computes PicOrderCntVal from the slice POC LSB and the POC of the previous
/// TemporalId 0 picture. See 8.3.1.
///
/// `msb_reset` forces PicOrderCntMsb to zero, as required for IRAP pictures
/// with NoRaslOutputFlag set.
pub fn compute_poc(poc_lsb: u32, max_poc_lsb: u32, prev_tid0_poc: i32, msb_reset: bool) -> i32 {
    let max_poc_lsb = max_poc_lsb as i32;
    let poc_lsb = poc_lsb as i32;

    if msb_reset {
        return poc_lsb;
    }

    let prev_poc_lsb = prev_tid0_poc.rem_euclid(max_poc_lsb);
    let prev_poc_msb = prev_tid0_poc - prev_poc_lsb;

    // Equation (8-1)
    let poc_msb = if poc_lsb < prev_poc_lsb && prev_poc_lsb - poc_lsb >= max_poc_lsb / 2 {
        prev_poc_msb + max_poc_lsb
    } else if poc_lsb > prev_poc_lsb && poc_lsb - prev_poc_lsb > max_poc_lsb / 2 {
        prev_poc_msb - max_poc_lsb
    } else {
        prev_poc_msb
    };

    // Equation (8-2)
    poc_msb + poc_lsb
}

/// Data associated with an h.265 picture. Most fields are extracted from the
/// slice header of its first slice segment.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct PictureData {
    pub nalu_type: NaluType,
    pub temporal_id: u8,
    pub no_rasl_output_flag: bool,
    pub pic_output_flag: bool,
    pub no_output_of_prior_pics_flag: bool,
    pub slice_pic_order_cnt_lsb: u32,
    pub pic_order_cnt_msb: i32,
    pub pic_order_cnt_val: i32,
    /// Whether this picture becomes prevTid0Pic once decoded.
    pub valid_for_prev_tid0_pic: bool,
}

impl PictureData {
    /// Instantiates a new `PictureData` from the first slice of a picture.
    ///
    /// `first_picture_in_sequence` is set for the first picture of the
    /// bitstream and for the first picture after an end of sequence NAL unit.
    /// `irap_no_rasl_output_flag` is the NoRaslOutputFlag of the IRAP picture
    /// the current picture is associated with.
    pub fn new_from_slice(
        slice: &Slice,
        first_picture_in_sequence: bool,
        irap_no_rasl_output_flag: bool,
        prev_tid0_poc: i32,
        max_pic_order_cnt_lsb: u32,
    ) -> Self {
        let hdr = &slice.header;
        let nalu_type = slice.nalu.header.type_();
        let temporal_id = slice.nalu.header.temporal_id();

        // HandleCraAsBlaFlag is only set through external means, none of
        // which are provided.
        let no_rasl_output_flag = nalu_type.is_idr()
            || nalu_type.is_bla()
            || (nalu_type.is_cra() && first_picture_in_sequence);

        // RASL pictures of an IRAP with NoRaslOutputFlag reference pictures
        // that are not in the bitstream.
        let pic_output_flag = if nalu_type.is_rasl() && irap_no_rasl_output_flag {
            false
        } else {
            hdr.pic_output_flag
        };

        let msb_reset = nalu_type.is_irap() && no_rasl_output_flag;
        let pic_order_cnt_val = compute_poc(
            hdr.pic_order_cnt_lsb,
            max_pic_order_cnt_lsb,
            prev_tid0_poc,
            msb_reset,
        );

        let no_output_of_prior_pics_flag =
            if nalu_type.is_irap() && no_rasl_output_flag && !first_picture_in_sequence {
                nalu_type.is_cra() || hdr.no_output_of_prior_pics_flag
            } else {
                false
            };

        Self {
            nalu_type,
            temporal_id,
            no_rasl_output_flag,
            pic_output_flag,
            no_output_of_prior_pics_flag,
            slice_pic_order_cnt_lsb: hdr.pic_order_cnt_lsb,
            pic_order_cnt_msb: pic_order_cnt_val - hdr.pic_order_cnt_lsb as i32,
            pic_order_cnt_val,
            valid_for_prev_tid0_pic: temporal_id == 0 && nalu_type.updates_prev_tid0_pic(),
        }
    }

    pub fn is_irap(&self) -> bool {
        self.nalu_type.is_irap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::h265::nalu::Nalu;
    use crate::codec::h265::parser::Parser;
    use crate::codec::h265::parser::SliceHeader;
    use crate::codec::h265::synthesizer::explicit_rps;
    use crate::codec::h265::synthesizer::intra_slice_header;
    use crate::codec::h265::synthesizer::p_slice_header;
    use crate::codec::h265::synthesizer::pps_nalu;
    use crate::codec::h265::synthesizer::slice_nalu;
    use crate::codec::h265::synthesizer::sps_nalu;
    use crate::codec::h265::synthesizer::test_pps;
    use crate::codec::h265::synthesizer::test_sps;
    use crate::codec::h265::synthesizer::test_vps;
    use crate::codec::h265::synthesizer::vps_nalu;

    #[test]
    fn poc_follows_wraparound() {
        let max_poc_lsb = 16;
        let mut prev_tid0_poc = 0;

        // Strides below max_poc_lsb / 2 are always recovered.
        for stride in 1..8 {
            for true_poc in (stride..200).step_by(stride as usize) {
                let lsb = (true_poc % max_poc_lsb) as u32;
                let poc = compute_poc(lsb, max_poc_lsb as u32, prev_tid0_poc, false);
                assert_eq!(poc, true_poc, "stride {}", stride);
                prev_tid0_poc = poc;
            }
            prev_tid0_poc = 0;
        }
    }

    #[test]
    fn poc_goes_backwards() {
        // Leading pictures of POC 2 that precede it in output order.
        assert_eq!(compute_poc(254, 256, 2, false), -2);
        // The previous POC is negative itself.
        assert_eq!(compute_poc(250, 256, -2, false), -6);
        assert_eq!(compute_poc(1, 256, -2, false), 1);
    }

    #[test]
    fn irap_resets_msb() {
        assert_eq!(compute_poc(12, 256, 1000, true), 12);
        assert_eq!(compute_poc(12, 256, 1000, false), 1036);
    }

    fn nalu(bytes: &[u8]) -> Nalu {
        Nalu::new(&bytes[4..], 4).unwrap()
    }

    fn picture(
        nalu_type: NaluType,
        temporal_id: u8,
        lsb: u32,
        first: bool,
        irap_no_rasl: bool,
        prev_tid0_poc: i32,
    ) -> PictureData {
        let mut parser = Parser::default();
        parser.parse_vps(&nalu(&vps_nalu(&test_vps()))).unwrap();
        parser.parse_sps(&nalu(&sps_nalu(&test_sps()))).unwrap();
        let pps = parser.parse_pps(&nalu(&pps_nalu(&test_pps()))).unwrap();

        let hdr = if nalu_type.is_irap() {
            SliceHeader {
                pic_order_cnt_lsb: lsb,
                ..intra_slice_header()
            }
        } else {
            p_slice_header(lsb, explicit_rps(&[(-1, true)], &[]))
        };
        let bytes = slice_nalu(nalu_type, temporal_id, &hdr, &pps);
        let slice = parser.parse_slice_header(nalu(&bytes), None).unwrap();

        PictureData::new_from_slice(&slice, first, irap_no_rasl, prev_tid0_poc, 256)
    }

    #[test]
    fn picture_flags() {
        let idr = picture(NaluType::IdrWRadl, 0, 0, true, false, 0);
        assert!(idr.no_rasl_output_flag);
        assert!(!idr.no_output_of_prior_pics_flag);
        assert!(idr.valid_for_prev_tid0_pic);
        assert_eq!(idr.pic_order_cnt_val, 0);

        // A CRA in the middle of the stream keeps counting.
        let cra = picture(NaluType::CraNut, 0, 3, false, false, 250);
        assert!(!cra.no_rasl_output_flag);
        assert_eq!(cra.pic_order_cnt_val, 259);
        assert_eq!(cra.pic_order_cnt_msb, 256);

        // A CRA after an end of sequence starts over.
        let cra = picture(NaluType::CraNut, 0, 3, true, false, 250);
        assert!(cra.no_rasl_output_flag);
        assert_eq!(cra.pic_order_cnt_val, 3);

        let rasl = picture(NaluType::RaslN, 0, 1, false, true, 3);
        assert!(!rasl.pic_output_flag);
        assert!(!rasl.valid_for_prev_tid0_pic);
        let rasl = picture(NaluType::RaslN, 0, 1, false, false, 3);
        assert!(rasl.pic_output_flag);

        let trail = picture(NaluType::TrailR, 1, 5, false, false, 3);
        assert!(!trail.valid_for_prev_tid0_pic);
        assert_eq!(trail.temporal_id, 1);
    }
}
