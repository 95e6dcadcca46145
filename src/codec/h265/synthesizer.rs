// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Writes parameter sets and slice segment headers back into Annex B NAL
//! units, so that tests can describe streams with the parser's own types.

use std::io::Write;

use thiserror::Error;

use crate::bitstream_utils::NaluWriter;
use crate::bitstream_utils::NaluWriterError;
use crate::codec::h265::nalu::NaluType;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::ProfileInfo;
use crate::codec::h265::parser::ProfileTierLevel;
use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::SliceType;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::parser::Vps;
use crate::codec::h265::rps::ceil_log2;
use crate::codec::h265::rps::ShortTermRefPicSet;

mod private {
    pub trait NaluStruct {}
}

impl private::NaluStruct for Vps {}

impl private::NaluStruct for Sps {}

impl private::NaluStruct for Pps {}

impl private::NaluStruct for SliceHeader {}

#[derive(Error, Debug)]
pub enum SynthesizerError {
    #[error("tried to synthesize unsupported settings: {0}")]
    Unsupported(&'static str),
    #[error(transparent)]
    NaluWriter(#[from] NaluWriterError),
}

pub type SynthesizerResult<T> = Result<T, SynthesizerError>;

/// A helper to output typed NALUs to [`std::io::Write`] using [`NaluWriter`].
pub struct Synthesizer<'n, N: private::NaluStruct, W: Write> {
    writer: NaluWriter<W>,
    nalu: &'n N,
}

impl<N: private::NaluStruct, W: Write> Synthesizer<'_, N, W> {
    fn u<T: Into<u32>>(&mut self, bits: usize, value: T) -> SynthesizerResult<()> {
        self.writer.write_f(bits, value)?;
        Ok(())
    }

    fn flag(&mut self, value: bool) -> SynthesizerResult<()> {
        self.writer.write_flag(value)?;
        Ok(())
    }

    fn ue<T: Into<u32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_ue(value)?;
        Ok(())
    }

    fn se<T: Into<i32>>(&mut self, value: T) -> SynthesizerResult<()> {
        self.writer.write_se(value)?;
        Ok(())
    }

    fn rbsp_trailing_bits(&mut self) -> SynthesizerResult<()> {
        self.writer.write_trailing_bits()?;
        Ok(())
    }

    fn profile(&mut self, p: &ProfileInfo) -> SynthesizerResult<()> {
        self.u(2, p.profile_space)?;
        self.flag(p.tier_flag)?;
        self.u(5, p.profile_idc)?;
        for flag in p.profile_compatibility_flag {
            self.flag(flag)?;
        }

        self.flag(p.progressive_source_flag)?;
        self.flag(p.interlaced_source_flag)?;
        self.flag(p.non_packed_constraint_flag)?;
        self.flag(p.frame_only_constraint_flag)?;

        // Constraint flags are left unset, plus the inbld/reserved bit.
        self.u(32, 0u32)?;
        self.u(12, 0u32)?;

        Ok(())
    }

    fn profile_tier_level(
        &mut self,
        ptl: &ProfileTierLevel,
        max_sub_layers_minus1: u8,
    ) -> SynthesizerResult<()> {
        self.profile(&ptl.general)?;
        self.u(8, ptl.general_level_idc)?;

        let num_sub_layers = usize::from(max_sub_layers_minus1);
        for i in 0..num_sub_layers {
            self.flag(ptl.sub_layer_profile_present_flag[i])?;
            self.flag(ptl.sub_layer_level_present_flag[i])?;
        }

        if num_sub_layers > 0 {
            for _ in num_sub_layers..8 {
                self.u(2, 0u32)?;
            }
        }

        for i in 0..num_sub_layers {
            if ptl.sub_layer_profile_present_flag[i] {
                self.profile(&ptl.sub_layer[i])?;
            }

            if ptl.sub_layer_level_present_flag[i] {
                self.u(8, ptl.sub_layer_level_idc[i])?;
            }
        }

        Ok(())
    }

    /// Writes an explicitly coded st_ref_pic_set().
    fn st_ref_pic_set(&mut self, idx: usize, rps: &ShortTermRefPicSet) -> SynthesizerResult<()> {
        if idx != 0 {
            if rps.inter_ref_pic_set_prediction_flag {
                return Err(SynthesizerError::Unsupported("predicted st_ref_pic_set"));
            }
            self.flag(false)?;
        }

        self.ue(rps.num_negative_pics)?;
        self.ue(rps.num_positive_pics())?;

        let mut prev = 0;
        for (delta_poc, used) in rps.negative() {
            self.ue((prev - delta_poc - 1) as u32)?;
            self.flag(used)?;
            prev = delta_poc;
        }

        let mut prev = 0;
        for (delta_poc, used) in rps.positive() {
            self.ue((delta_poc - prev - 1) as u32)?;
            self.flag(used)?;
            prev = delta_poc;
        }

        Ok(())
    }
}

impl<'n, W: Write> Synthesizer<'n, Vps, W> {
    pub fn synthesize(vps: &'n Vps, writer: W, ep_enabled: bool) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: vps,
        };

        s.writer.write_header(NaluType::VpsNut as u8, 0, 1)?;
        s.video_parameter_set_rbsp()
    }

    fn video_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        let vps = self.nalu;

        if vps.num_layer_sets_minus1 != 0 || vps.num_hrd_parameters != 0 || vps.extension_flag {
            return Err(SynthesizerError::Unsupported("VPS layer sets, HRD or extension"));
        }

        self.u(4, vps.video_parameter_set_id)?;
        self.flag(vps.base_layer_internal_flag)?;
        self.flag(vps.base_layer_available_flag)?;
        self.u(6, vps.max_layers_minus1)?;
        self.u(3, vps.max_sub_layers_minus1)?;
        self.flag(vps.temporal_id_nesting_flag)?;
        self.u(16, 0xffffu32)?;

        self.profile_tier_level(&vps.profile_tier_level, vps.max_sub_layers_minus1)?;

        self.flag(vps.sub_layer_ordering_info_present_flag)?;
        let max_sub_layer = usize::from(vps.max_sub_layers_minus1);
        let start = if vps.sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layer
        };

        for i in start..=max_sub_layer {
            self.ue(vps.max_dec_pic_buffering_minus1[i])?;
            self.ue(vps.max_num_reorder_pics[i])?;
            self.ue(vps.max_latency_increase_plus1[i])?;
        }

        self.u(6, vps.max_layer_id)?;
        self.ue(vps.num_layer_sets_minus1)?;

        self.flag(vps.timing_info_present_flag)?;
        if vps.timing_info_present_flag {
            self.u(32, vps.num_units_in_tick)?;
            self.u(32, vps.time_scale)?;
            self.flag(vps.poc_proportional_to_timing_flag)?;
            if vps.poc_proportional_to_timing_flag {
                self.ue(vps.num_ticks_poc_diff_one_minus1)?;
            }
            self.ue(vps.num_hrd_parameters)?;
        }

        self.flag(vps.extension_flag)?;
        self.rbsp_trailing_bits()
    }
}

impl<'n, W: Write> Synthesizer<'n, Sps, W> {
    pub fn synthesize(sps: &'n Sps, writer: W, ep_enabled: bool) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: sps,
        };

        s.writer.write_header(NaluType::SpsNut as u8, 0, 1)?;
        s.seq_parameter_set_rbsp()
    }

    fn seq_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        let sps = self.nalu;

        if sps.scaling_list_data_present_flag {
            return Err(SynthesizerError::Unsupported("SPS scaling lists"));
        }

        if sps.vui_parameters_present_flag {
            return Err(SynthesizerError::Unsupported("VUI"));
        }

        if sps.range_extension_flag || sps.scc_extension_flag {
            return Err(SynthesizerError::Unsupported("SPS extensions"));
        }

        self.u(4, sps.video_parameter_set_id)?;
        self.u(3, sps.max_sub_layers_minus1)?;
        self.flag(sps.temporal_id_nesting_flag)?;
        self.profile_tier_level(&sps.profile_tier_level, sps.max_sub_layers_minus1)?;

        self.ue(sps.seq_parameter_set_id)?;
        self.ue(sps.chroma_format_idc)?;
        if sps.chroma_format_idc == 3 {
            self.flag(sps.separate_colour_plane_flag)?;
        }

        self.ue(sps.pic_width_in_luma_samples)?;
        self.ue(sps.pic_height_in_luma_samples)?;

        self.flag(sps.conformance_window_flag)?;
        if sps.conformance_window_flag {
            self.ue(sps.conf_win_left_offset)?;
            self.ue(sps.conf_win_right_offset)?;
            self.ue(sps.conf_win_top_offset)?;
            self.ue(sps.conf_win_bottom_offset)?;
        }

        self.ue(sps.bit_depth_luma_minus8)?;
        self.ue(sps.bit_depth_chroma_minus8)?;
        self.ue(sps.log2_max_pic_order_cnt_lsb_minus4)?;

        self.flag(sps.sub_layer_ordering_info_present_flag)?;
        let max_sub_layer = usize::from(sps.max_sub_layers_minus1);
        let start = if sps.sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layer
        };

        for i in start..=max_sub_layer {
            self.ue(sps.max_dec_pic_buffering_minus1[i])?;
            self.ue(sps.max_num_reorder_pics[i])?;
            self.ue(sps.max_latency_increase_plus1[i])?;
        }

        self.ue(sps.log2_min_luma_coding_block_size_minus3)?;
        self.ue(sps.log2_diff_max_min_luma_coding_block_size)?;
        self.ue(sps.log2_min_luma_transform_block_size_minus2)?;
        self.ue(sps.log2_diff_max_min_luma_transform_block_size)?;
        self.ue(sps.max_transform_hierarchy_depth_inter)?;
        self.ue(sps.max_transform_hierarchy_depth_intra)?;

        self.flag(sps.scaling_list_enabled_flag)?;
        if sps.scaling_list_enabled_flag {
            self.flag(sps.scaling_list_data_present_flag)?;
        }

        self.flag(sps.amp_enabled_flag)?;
        self.flag(sps.sample_adaptive_offset_enabled_flag)?;

        self.flag(sps.pcm_enabled_flag)?;
        if sps.pcm_enabled_flag {
            self.u(4, sps.pcm_sample_bit_depth_luma_minus1)?;
            self.u(4, sps.pcm_sample_bit_depth_chroma_minus1)?;
            self.ue(sps.log2_min_pcm_luma_coding_block_size_minus3)?;
            self.ue(sps.log2_diff_max_min_pcm_luma_coding_block_size)?;
            self.flag(sps.pcm_loop_filter_disabled_flag)?;
        }

        self.ue(sps.num_short_term_ref_pic_sets)?;
        for (i, rps) in sps.short_term_ref_pic_set.iter().enumerate() {
            self.st_ref_pic_set(i, rps)?;
        }

        self.flag(sps.long_term_ref_pics_present_flag)?;
        if sps.long_term_ref_pics_present_flag {
            let lsb_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
            self.ue(sps.num_long_term_ref_pics_sps)?;
            for i in 0..usize::from(sps.num_long_term_ref_pics_sps) {
                self.u(lsb_bits, sps.lt_ref_pic_poc_lsb_sps[i])?;
                self.flag(sps.used_by_curr_pic_lt_sps_flag[i])?;
            }
        }

        self.flag(sps.temporal_mvp_enabled_flag)?;
        self.flag(sps.strong_intra_smoothing_enabled_flag)?;
        self.flag(sps.vui_parameters_present_flag)?;
        self.flag(sps.extension_present_flag)?;
        if sps.extension_present_flag {
            self.u(8, 0u32)?;
        }

        self.rbsp_trailing_bits()
    }
}

impl<'n, W: Write> Synthesizer<'n, Pps, W> {
    pub fn synthesize(pps: &'n Pps, writer: W, ep_enabled: bool) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, ep_enabled),
            nalu: pps,
        };

        s.writer.write_header(NaluType::PpsNut as u8, 0, 1)?;
        s.pic_parameter_set_rbsp()
    }

    fn pic_parameter_set_rbsp(&mut self) -> SynthesizerResult<()> {
        let pps = self.nalu;

        if pps.scaling_list_data_present_flag {
            return Err(SynthesizerError::Unsupported("PPS scaling lists"));
        }

        if pps.extension_present_flag {
            return Err(SynthesizerError::Unsupported("PPS extensions"));
        }

        self.ue(pps.pic_parameter_set_id)?;
        self.ue(pps.seq_parameter_set_id)?;
        self.flag(pps.dependent_slice_segments_enabled_flag)?;
        self.flag(pps.output_flag_present_flag)?;
        self.u(3, pps.num_extra_slice_header_bits)?;
        self.flag(pps.sign_data_hiding_enabled_flag)?;
        self.flag(pps.cabac_init_present_flag)?;
        self.ue(pps.num_ref_idx_l0_default_active_minus1)?;
        self.ue(pps.num_ref_idx_l1_default_active_minus1)?;
        self.se(pps.init_qp_minus26)?;
        self.flag(pps.constrained_intra_pred_flag)?;
        self.flag(pps.transform_skip_enabled_flag)?;

        self.flag(pps.cu_qp_delta_enabled_flag)?;
        if pps.cu_qp_delta_enabled_flag {
            self.ue(pps.diff_cu_qp_delta_depth)?;
        }

        self.se(pps.cb_qp_offset)?;
        self.se(pps.cr_qp_offset)?;
        self.flag(pps.slice_chroma_qp_offsets_present_flag)?;
        self.flag(pps.weighted_pred_flag)?;
        self.flag(pps.weighted_bipred_flag)?;
        self.flag(pps.transquant_bypass_enabled_flag)?;
        self.flag(pps.tiles_enabled_flag)?;
        self.flag(pps.entropy_coding_sync_enabled_flag)?;

        if pps.tiles_enabled_flag {
            self.ue(pps.num_tile_columns_minus1)?;
            self.ue(pps.num_tile_rows_minus1)?;
            self.flag(pps.uniform_spacing_flag)?;
            if !pps.uniform_spacing_flag {
                for i in 0..usize::from(pps.num_tile_columns_minus1) {
                    self.ue(pps.column_width_minus1[i])?;
                }
                for i in 0..usize::from(pps.num_tile_rows_minus1) {
                    self.ue(pps.row_height_minus1[i])?;
                }
            }
            self.flag(pps.loop_filter_across_tiles_enabled_flag)?;
        }

        self.flag(pps.loop_filter_across_slices_enabled_flag)?;
        self.flag(pps.deblocking_filter_control_present_flag)?;
        if pps.deblocking_filter_control_present_flag {
            self.flag(pps.deblocking_filter_override_enabled_flag)?;
            self.flag(pps.deblocking_filter_disabled_flag)?;
            if !pps.deblocking_filter_disabled_flag {
                self.se(pps.beta_offset_div2)?;
                self.se(pps.tc_offset_div2)?;
            }
        }

        self.flag(pps.scaling_list_data_present_flag)?;
        self.flag(pps.lists_modification_present_flag)?;
        self.ue(pps.log2_parallel_merge_level_minus2)?;
        self.flag(pps.slice_segment_header_extension_present_flag)?;
        self.flag(pps.extension_present_flag)?;

        self.rbsp_trailing_bits()
    }
}

impl<'n, W: Write> Synthesizer<'n, SliceHeader, W> {
    /// Writes a slice segment NALU made of `hdr` followed by `slice_data`.
    /// `pps` must be the parsed PPS the header refers to.
    pub fn synthesize(
        nalu_type: NaluType,
        temporal_id: u8,
        hdr: &'n SliceHeader,
        pps: &Pps,
        slice_data: &[u8],
        writer: W,
    ) -> SynthesizerResult<()> {
        let mut s = Self {
            writer: NaluWriter::<W>::new(writer, true),
            nalu: hdr,
        };

        s.writer.write_header(nalu_type as u8, 0, temporal_id + 1)?;
        s.slice_segment_header(nalu_type, pps)?;

        for byte in slice_data {
            s.u(8, *byte)?;
        }

        Ok(())
    }

    fn slice_segment_header(&mut self, nalu_type: NaluType, pps: &Pps) -> SynthesizerResult<()> {
        let hdr = self.nalu;
        let sps = &pps.sps;

        self.flag(hdr.first_slice_segment_in_pic_flag)?;
        if nalu_type.is_irap() {
            self.flag(hdr.no_output_of_prior_pics_flag)?;
        }

        self.ue(hdr.pic_parameter_set_id)?;

        if !hdr.first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                self.flag(hdr.dependent_slice_segment_flag)?;
            }
            self.u(ceil_log2(sps.pic_size_in_ctbs_y), hdr.segment_address)?;
        }

        if !hdr.dependent_slice_segment_flag {
            self.independent_fields(nalu_type, pps)?;
        }

        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            self.ue(hdr.num_entry_point_offsets)?;
            if hdr.num_entry_point_offsets > 0 {
                self.ue(hdr.offset_len_minus1)?;
                for offset in &hdr.entry_point_offset_minus1 {
                    self.u(usize::from(hdr.offset_len_minus1) + 1, *offset)?;
                }
            }
        }

        if pps.slice_segment_header_extension_present_flag {
            self.ue(0u32)?;
        }

        // byte_alignment()
        self.flag(true)?;
        while !self.writer.aligned() {
            self.flag(false)?;
        }

        Ok(())
    }

    fn independent_fields(&mut self, nalu_type: NaluType, pps: &Pps) -> SynthesizerResult<()> {
        let hdr = self.nalu;
        let sps = &pps.sps;

        if sps.separate_colour_plane_flag || pps.range_extension_flag || pps.scc_extension_flag {
            return Err(SynthesizerError::Unsupported("colour planes and PPS extensions"));
        }

        if (pps.weighted_pred_flag && hdr.type_.is_p())
            || (pps.weighted_bipred_flag && hdr.type_.is_b())
        {
            return Err(SynthesizerError::Unsupported("pred_weight_table"));
        }

        for _ in 0..pps.num_extra_slice_header_bits {
            self.flag(false)?;
        }

        self.ue(hdr.type_ as u32)?;

        if pps.output_flag_present_flag {
            self.flag(hdr.pic_output_flag)?;
        }

        if !nalu_type.is_idr() {
            let lsb_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
            self.u(lsb_bits, hdr.pic_order_cnt_lsb)?;

            self.flag(hdr.short_term_ref_pic_set_sps_flag)?;
            if !hdr.short_term_ref_pic_set_sps_flag {
                self.st_ref_pic_set(
                    usize::from(sps.num_short_term_ref_pic_sets),
                    &hdr.short_term_ref_pic_set,
                )?;
            } else if sps.num_short_term_ref_pic_sets > 1 {
                let num_bits = ceil_log2(u32::from(sps.num_short_term_ref_pic_sets));
                self.u(num_bits, hdr.short_term_ref_pic_set_idx)?;
            }

            if sps.long_term_ref_pics_present_flag {
                let lt = &hdr.long_term_ref_pic_set;
                let nb_sps = usize::from(lt.num_long_term_sps);

                if sps.num_long_term_ref_pics_sps > 0 {
                    self.ue(lt.num_long_term_sps)?;
                }
                self.ue(lt.num_long_term_pics)?;

                let mut prev_delta_msb = 0;
                for i in 0..lt.num_refs() {
                    if i < nb_sps {
                        if sps.num_long_term_ref_pics_sps > 1 {
                            let num_bits = ceil_log2(u32::from(sps.num_long_term_ref_pics_sps));
                            self.u(num_bits, lt.lt_idx_sps[i])?;
                        }
                    } else {
                        self.u(lsb_bits, lt.poc_lsb_lt[i])?;
                        self.flag(lt.used_by_curr_pic_lt[i])?;
                    }

                    self.flag(lt.delta_poc_msb_present_flag[i])?;
                    if lt.delta_poc_msb_present_flag[i] {
                        let accumulated = if i != 0 && i != nb_sps {
                            prev_delta_msb
                        } else {
                            0
                        };
                        self.ue((lt.delta_poc_msb_cycle_lt[i] - accumulated) as u32)?;
                        prev_delta_msb = lt.delta_poc_msb_cycle_lt[i];
                    }
                }
            }

            if sps.temporal_mvp_enabled_flag {
                self.flag(hdr.temporal_mvp_enabled_flag)?;
            }
        }

        if sps.sample_adaptive_offset_enabled_flag {
            self.flag(hdr.sao_luma_flag)?;
            if sps.chroma_array_type != 0 {
                self.flag(hdr.sao_chroma_flag)?;
            }
        }

        if hdr.type_ != SliceType::I {
            self.flag(hdr.num_ref_idx_active_override_flag)?;
            if hdr.num_ref_idx_active_override_flag {
                self.ue(hdr.num_ref_idx_l0_active_minus1)?;
                if hdr.type_.is_b() {
                    self.ue(hdr.num_ref_idx_l1_active_minus1)?;
                }
            }

            let num_pic_total_curr =
                hdr.short_term_ref_pic_set.num_used() + hdr.long_term_ref_pic_set.num_used();

            if pps.lists_modification_present_flag && num_pic_total_curr > 1 {
                let rplm = &hdr.ref_pic_list_modification;
                let num_bits = ceil_log2(num_pic_total_curr as u32);

                self.flag(rplm.ref_pic_list_modification_flag_l0)?;
                if rplm.ref_pic_list_modification_flag_l0 {
                    for i in 0..=usize::from(hdr.num_ref_idx_l0_active_minus1) {
                        self.u(num_bits, rplm.list_entry_l0[i])?;
                    }
                }

                if hdr.type_.is_b() {
                    self.flag(rplm.ref_pic_list_modification_flag_l1)?;
                    if rplm.ref_pic_list_modification_flag_l1 {
                        for i in 0..=usize::from(hdr.num_ref_idx_l1_active_minus1) {
                            self.u(num_bits, rplm.list_entry_l1[i])?;
                        }
                    }
                }
            }

            if hdr.type_.is_b() {
                self.flag(hdr.mvd_l1_zero_flag)?;
            }

            if pps.cabac_init_present_flag {
                self.flag(hdr.cabac_init_flag)?;
            }

            if hdr.temporal_mvp_enabled_flag {
                if hdr.type_.is_b() {
                    self.flag(hdr.collocated_from_l0_flag)?;
                }

                let max = if hdr.collocated_from_l0_flag {
                    hdr.num_ref_idx_l0_active_minus1
                } else {
                    hdr.num_ref_idx_l1_active_minus1
                };

                if max > 0 {
                    self.ue(hdr.collocated_ref_idx)?;
                }
            }

            self.ue(hdr.five_minus_max_num_merge_cand)?;
        }

        self.se(hdr.qp_delta)?;

        if pps.slice_chroma_qp_offsets_present_flag {
            self.se(hdr.cb_qp_offset)?;
            self.se(hdr.cr_qp_offset)?;
        }

        if pps.deblocking_filter_override_enabled_flag {
            self.flag(hdr.deblocking_filter_override_flag)?;
        }

        if hdr.deblocking_filter_override_flag {
            self.flag(hdr.deblocking_filter_disabled_flag)?;
            if !hdr.deblocking_filter_disabled_flag {
                self.se(hdr.beta_offset_div2)?;
                self.se(hdr.tc_offset_div2)?;
            }
        }

        if pps.loop_filter_across_slices_enabled_flag
            && (hdr.sao_luma_flag || hdr.sao_chroma_flag || !hdr.deblocking_filter_disabled_flag)
        {
            self.flag(hdr.loop_filter_across_slices_enabled_flag)?;
        }

        Ok(())
    }
}

/// Main profile, level 3.1.
pub fn main_profile_tier_level() -> ProfileTierLevel {
    let mut general = ProfileInfo {
        profile_idc: 1,
        progressive_source_flag: true,
        frame_only_constraint_flag: true,
        ..Default::default()
    };
    general.profile_compatibility_flag[1] = true;
    general.profile_compatibility_flag[2] = true;

    ProfileTierLevel {
        general,
        general_level_idc: 93,
        ..Default::default()
    }
}

pub fn test_vps() -> Vps {
    Vps {
        base_layer_internal_flag: true,
        base_layer_available_flag: true,
        temporal_id_nesting_flag: true,
        profile_tier_level: main_profile_tier_level(),
        sub_layer_ordering_info_present_flag: true,
        max_dec_pic_buffering_minus1: [4; 7],
        ..Default::default()
    }
}

/// A 64x64 4:2:0 8-bit SPS with 16x16 CTBs and 8-bit POC LSBs.
pub fn test_sps() -> Sps {
    Sps {
        temporal_id_nesting_flag: true,
        profile_tier_level: main_profile_tier_level(),
        chroma_format_idc: 1,
        pic_width_in_luma_samples: 64,
        pic_height_in_luma_samples: 64,
        log2_max_pic_order_cnt_lsb_minus4: 4,
        sub_layer_ordering_info_present_flag: true,
        max_dec_pic_buffering_minus1: [4; 7],
        log2_min_luma_coding_block_size_minus3: 0,
        log2_diff_max_min_luma_coding_block_size: 1,
        log2_min_luma_transform_block_size_minus2: 0,
        log2_diff_max_min_luma_transform_block_size: 1,
        max_transform_hierarchy_depth_inter: 1,
        max_transform_hierarchy_depth_intra: 1,
        sample_adaptive_offset_enabled_flag: true,
        ..Default::default()
    }
}

pub fn test_pps() -> Pps {
    Pps {
        loop_filter_across_slices_enabled_flag: true,
        loop_filter_across_tiles_enabled_flag: true,
        ..Default::default()
    }
}

/// An explicit st_ref_pic_set() made of `negative` and `positive`
/// `(delta_poc, used_by_curr_pic)` entries.
pub fn explicit_rps(negative: &[(i32, bool)], positive: &[(i32, bool)]) -> ShortTermRefPicSet {
    let mut rps = ShortTermRefPicSet {
        num_negative_pics: negative.len() as u8,
        num_delta_pocs: (negative.len() + positive.len()) as u8,
        ..Default::default()
    };

    for (i, (delta_poc, used)) in negative.iter().chain(positive).enumerate() {
        rps.delta_poc[i] = *delta_poc;
        rps.used[i] = *used;
    }

    rps
}

/// The first and only slice of an I picture.
pub fn intra_slice_header() -> SliceHeader {
    SliceHeader {
        first_slice_segment_in_pic_flag: true,
        type_: SliceType::I,
        pic_output_flag: true,
        ..Default::default()
    }
}

/// The first and only slice of a P picture with an explicit short-term RPS.
pub fn p_slice_header(pic_order_cnt_lsb: u32, rps: ShortTermRefPicSet) -> SliceHeader {
    SliceHeader {
        first_slice_segment_in_pic_flag: true,
        type_: SliceType::P,
        pic_output_flag: true,
        pic_order_cnt_lsb,
        short_term_ref_pic_set: rps,
        ..Default::default()
    }
}

pub fn vps_nalu(vps: &Vps) -> Vec<u8> {
    let mut buf = Vec::new();
    Synthesizer::<'_, Vps, _>::synthesize(vps, &mut buf, true).unwrap();
    buf
}

pub fn sps_nalu(sps: &Sps) -> Vec<u8> {
    let mut buf = Vec::new();
    Synthesizer::<'_, Sps, _>::synthesize(sps, &mut buf, true).unwrap();
    buf
}

pub fn pps_nalu(pps: &Pps) -> Vec<u8> {
    let mut buf = Vec::new();
    Synthesizer::<'_, Pps, _>::synthesize(pps, &mut buf, true).unwrap();
    buf
}

/// `pps` must be the parsed PPS, so that its SPS derived values are set.
pub fn slice_nalu(nalu_type: NaluType, temporal_id: u8, hdr: &SliceHeader, pps: &Pps) -> Vec<u8> {
    let mut buf = Vec::new();
    Synthesizer::<'_, SliceHeader, _>::synthesize(
        nalu_type,
        temporal_id,
        hdr,
        pps,
        &[0xa5, 0x5a, 0x80],
        &mut buf,
    )
    .unwrap();
    buf
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::codec::h265::nalu::Nalu;
    use crate::codec::h265::parser::Parser;

    fn nalu(bytes: &[u8]) -> Nalu {
        // Skip the four byte start code.
        Nalu::new(&bytes[4..], 4).unwrap()
    }

    #[test]
    fn synthesize_parameter_sets() {
        let mut parser = Parser::default();

        let vps = parser.parse_vps(&nalu(&vps_nalu(&test_vps()))).unwrap();
        assert_eq!(vps.profile_tier_level, main_profile_tier_level());
        assert_eq!(vps.max_dec_pic_buffering_minus1[0], 4);

        let sps = parser.parse_sps(&nalu(&sps_nalu(&test_sps()))).unwrap();
        assert_eq!(sps.pic_width_in_luma_samples, 64);
        assert_eq!(sps.ctb_size_y, 16);
        assert_eq!(sps.pic_size_in_ctbs_y, 16);
        assert_eq!(sps.max_pic_order_cnt_lsb(), 256);

        let pps = parser.parse_pps(&nalu(&pps_nalu(&test_pps()))).unwrap();
        assert!(pps.loop_filter_across_slices_enabled_flag);
        assert!(Rc::ptr_eq(&pps.sps, &sps));
    }

    #[test]
    fn unsupported_settings() {
        let sps = Sps {
            vui_parameters_present_flag: true,
            ..test_sps()
        };

        let mut buf = Vec::new();
        assert!(matches!(
            Synthesizer::<'_, Sps, _>::synthesize(&sps, &mut buf, true),
            Err(SynthesizerError::Unsupported(_))
        ));
    }
}
