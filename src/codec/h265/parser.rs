// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An h.265 syntax parser.
//!
//! Parses VPSs, SPSs, PPSs and slice segment headers from NALUs, and keeps
//! the parameter sets in fixed tables indexed by their ids.

use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context;
use enumn::N;
use thiserror::Error;

use crate::bitstream_utils::BitReader;
use crate::bitstream_utils::ReadBitsError;
use crate::codec::h265::nalu::Nalu;
use crate::codec::h265::nalu::NaluHeader;
use crate::codec::h265::nalu::NaluType;
use crate::codec::h265::rbsp::Rbsp;
use crate::codec::h265::rbsp::RbspError;
use crate::codec::h265::rps::ceil_log2;
use crate::codec::h265::rps::LongTermRefPicSet;
use crate::codec::h265::rps::ShortTermRefPicSet;
use crate::codec::h265::rps::MAX_RPS_ENTRIES;

// Given the max VPS id.
pub const MAX_VPS_COUNT: usize = 16;
// Given the max SPS id.
pub const MAX_SPS_COUNT: usize = 16;
// Given the max PPS id.
pub const MAX_PPS_COUNT: usize = 64;
// 7.4.7.1
pub const MAX_REF_IDX_ACTIVE: usize = 15;
// 7.4.3.2.1
const MAX_SHORT_TERM_REF_PIC_SETS: u32 = 64;
const MAX_LONG_TERM_REF_PICS_SPS: u32 = 32;
// sps_max_sub_layers_minus1 + 1.
const MAX_SUB_LAYERS: usize = 7;
// A.4.2, MaxDpbSize.
const MAX_DPB_PICS: u32 = 16;
// Table A.8 bounds for the highest levels.
const MAX_TILE_COLUMNS: u32 = 20;
const MAX_TILE_ROWS: u32 = 22;

// From Table 7-5.
const DEFAULT_SCALING_LIST_0: [u8; 16] = [16; 16];

// From Table 7-6.
const DEFAULT_SCALING_LIST_1: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 16, 17, 16, 17, 18, 17, 18, 18, 17, 18, 21, 19, 20,
    21, 20, 19, 21, 24, 22, 22, 24, 24, 22, 22, 24, 25, 25, 27, 30, 27, 25, 25, 29, 31, 35, 35, 31,
    29, 36, 41, 44, 41, 36, 47, 54, 54, 47, 65, 70, 65, 88, 88, 115,
];

// From Table 7-6.
const DEFAULT_SCALING_LIST_2: [u8; 64] = [
    16, 16, 16, 16, 16, 16, 16, 16, 16, 16, 17, 17, 17, 17, 17, 18, 18, 18, 18, 18, 18, 20, 20, 20,
    20, 20, 20, 20, 24, 24, 24, 24, 24, 24, 24, 24, 25, 25, 25, 25, 25, 25, 25, 28, 28, 28, 28, 28,
    28, 33, 33, 33, 33, 33, 41, 41, 41, 41, 54, 54, 54, 71, 71, 91,
];

#[derive(Debug, Error)]
pub enum ParseError {
    /// Malformed or inconsistent syntax. Only the current NAL unit is lost.
    #[error(transparent)]
    Stream(#[from] anyhow::Error),
    /// Valid syntax describing a stream this decoder cannot handle.
    #[error("unsupported stream: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Rbsp(#[from] RbspError),
}

impl From<ReadBitsError> for ParseError {
    fn from(err: ReadBitsError) -> Self {
        ParseError::Stream(anyhow::Error::new(err).context("Broken stream: failed to read syntax"))
    }
}

/// A fixed table of parameter sets indexed by id, with a validity bitmap.
///
/// Sets are handed out as `Rc`s so that a picture keeps the exact sets it
/// was parsed with even if the stream replaces them afterwards.
#[derive(Clone, Debug)]
pub struct ParamSetStore<T, const N: usize> {
    sets: [Rc<T>; N],
    empty: Rc<T>,
    present: u64,
}

impl<T: Default + PartialEq, const N: usize> ParamSetStore<T, N> {
    const FITS_BITMAP: () = assert!(N <= 64);

    pub fn new() -> Self {
        let () = Self::FITS_BITMAP;
        let empty = Rc::new(T::default());

        Self {
            sets: std::array::from_fn(|_| Rc::clone(&empty)),
            empty,
            present: 0,
        }
    }

    pub fn is_present(&self, id: usize) -> bool {
        id < N && self.present & (1 << id) != 0
    }

    pub fn get(&self, id: usize) -> Option<&Rc<T>> {
        if self.is_present(id) {
            Some(&self.sets[id])
        } else {
            None
        }
    }

    /// Stores `value` under `id`. A set equal to the stored one is dropped
    /// and the stored one kept. Returns the stored set and whether the
    /// table changed.
    pub fn put(&mut self, id: usize, value: T) -> anyhow::Result<(Rc<T>, bool)> {
        if id >= N {
            return Err(anyhow!("Invalid parameter set id {}, max is {}", id, N - 1));
        }

        if self.is_present(id) && *self.sets[id] == value {
            return Ok((Rc::clone(&self.sets[id]), false));
        }

        self.sets[id] = Rc::new(value);
        self.present |= 1 << id;

        Ok((Rc::clone(&self.sets[id]), true))
    }

    pub fn remove(&mut self, id: usize) -> Option<Rc<T>> {
        if !self.is_present(id) {
            return None;
        }

        self.present &= !(1 << id);
        Some(std::mem::replace(&mut self.sets[id], Rc::clone(&self.empty)))
    }

    /// Ids of the stored sets, in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = usize> + '_ {
        (0..N).filter(|id| self.is_present(*id))
    }

    pub fn clear(&mut self) {
        for id in 0..N {
            self.remove(id);
        }
    }
}

impl<T: Default + PartialEq, const N: usize> Default for ParamSetStore<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// The profile part of profile_tier_level(), shared by the general profile
/// and every sub-layer profile.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileInfo {
    pub profile_space: u8,
    pub tier_flag: bool,
    pub profile_idc: u8,
    pub profile_compatibility_flag: [bool; 32],
    pub progressive_source_flag: bool,
    pub interlaced_source_flag: bool,
    pub non_packed_constraint_flag: bool,
    pub frame_only_constraint_flag: bool,
    pub max_12bit_constraint_flag: bool,
    pub max_10bit_constraint_flag: bool,
    pub max_8bit_constraint_flag: bool,
    pub max_422chroma_constraint_flag: bool,
    pub max_420chroma_constraint_flag: bool,
    pub max_monochrome_constraint_flag: bool,
    pub intra_constraint_flag: bool,
    pub one_picture_only_constraint_flag: bool,
    pub lower_bit_rate_constraint_flag: bool,
    pub max_14bit_constraint_flag: bool,
    pub inbld_flag: bool,
}

impl ProfileInfo {
    /// Whether the profile is one of `idcs`, either directly or through the
    /// compatibility flags.
    fn is_any_of(&self, idcs: &[u8]) -> bool {
        idcs.iter().any(|&idc| {
            self.profile_idc == idc || self.profile_compatibility_flag[usize::from(idc)]
        })
    }

    fn parse(r: &mut BitReader) -> anyhow::Result<Self> {
        let mut p = ProfileInfo {
            profile_space: r.read_bits(2)?,
            tier_flag: r.read_bit()?,
            profile_idc: r.read_bits(5)?,
            ..Default::default()
        };

        for flag in p.profile_compatibility_flag.iter_mut() {
            *flag = r.read_bit()?;
        }

        p.progressive_source_flag = r.read_bit()?;
        p.interlaced_source_flag = r.read_bit()?;
        p.non_packed_constraint_flag = r.read_bit()?;
        p.frame_only_constraint_flag = r.read_bit()?;

        // 43 bits of constraint flags, whose meaning depends on the profile.
        if p.is_any_of(&[4, 5, 6, 7, 8, 9, 10, 11]) {
            p.max_12bit_constraint_flag = r.read_bit()?;
            p.max_10bit_constraint_flag = r.read_bit()?;
            p.max_8bit_constraint_flag = r.read_bit()?;
            p.max_422chroma_constraint_flag = r.read_bit()?;
            p.max_420chroma_constraint_flag = r.read_bit()?;
            p.max_monochrome_constraint_flag = r.read_bit()?;
            p.intra_constraint_flag = r.read_bit()?;
            p.one_picture_only_constraint_flag = r.read_bit()?;
            p.lower_bit_rate_constraint_flag = r.read_bit()?;

            if p.is_any_of(&[5, 9, 10, 11]) {
                p.max_14bit_constraint_flag = r.read_bit()?;
                r.skip_bits(33)?;
            } else {
                r.skip_bits(34)?;
            }
        } else if p.is_any_of(&[2]) {
            r.skip_bits(7)?;
            p.one_picture_only_constraint_flag = r.read_bit()?;
            r.skip_bits(35)?;
        } else {
            r.skip_bits(43)?;
        }

        if p.is_any_of(&[1, 2, 3, 4, 5, 9, 11]) {
            p.inbld_flag = r.read_bit()?;
        } else {
            r.skip_bits(1)?;
        }

        Ok(p)
    }
}

/// profile_tier_level(). See 7.3.3.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProfileTierLevel {
    pub general: ProfileInfo,
    /// general_level_idc, 30 times the level number.
    pub general_level_idc: u8,
    pub sub_layer_profile_present_flag: [bool; 6],
    pub sub_layer_level_present_flag: [bool; 6],
    pub sub_layer: [ProfileInfo; 6],
    pub sub_layer_level_idc: [u8; 6],
}

impl ProfileTierLevel {
    fn parse(r: &mut BitReader, max_sub_layers_minus1: u8) -> anyhow::Result<Self> {
        let mut ptl = ProfileTierLevel {
            general: ProfileInfo::parse(r)?,
            general_level_idc: r.read_bits(8)?,
            ..Default::default()
        };

        let num_sub_layers = usize::from(max_sub_layers_minus1);

        for i in 0..num_sub_layers {
            ptl.sub_layer_profile_present_flag[i] = r.read_bit()?;
            ptl.sub_layer_level_present_flag[i] = r.read_bit()?;
        }

        if num_sub_layers > 0 {
            // reserved_zero_2bits
            r.skip_bits(2 * (8 - num_sub_layers))?;
        }

        for i in 0..num_sub_layers {
            if ptl.sub_layer_profile_present_flag[i] {
                ptl.sub_layer[i] = ProfileInfo::parse(r)?;
            }

            if ptl.sub_layer_level_present_flag[i] {
                ptl.sub_layer_level_idc[i] = r.read_bits(8)?;
            }
        }

        Ok(ptl)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SublayerHrdParameters {
    pub bit_rate_value_minus1: [u32; 32],
    pub cpb_size_value_minus1: [u32; 32],
    pub cpb_size_du_value_minus1: [u32; 32],
    pub bit_rate_du_value_minus1: [u32; 32],
    pub cbr_flag: [bool; 32],
}

impl SublayerHrdParameters {
    fn parse(
        r: &mut BitReader,
        cpb_cnt: usize,
        sub_pic_hrd_params_present_flag: bool,
    ) -> anyhow::Result<Self> {
        let mut h = SublayerHrdParameters::default();

        for i in 0..cpb_cnt {
            h.bit_rate_value_minus1[i] = r.read_ue_max(u32::MAX - 1)?;
            h.cpb_size_value_minus1[i] = r.read_ue_max(u32::MAX - 1)?;
            if sub_pic_hrd_params_present_flag {
                h.cpb_size_du_value_minus1[i] = r.read_ue_max(u32::MAX - 1)?;
                h.bit_rate_du_value_minus1[i] = r.read_ue_max(u32::MAX - 1)?;
            }

            h.cbr_flag[i] = r.read_bit()?;
        }

        Ok(h)
    }
}

/// hrd_parameters(). See E.2.2.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HrdParams {
    pub nal_hrd_parameters_present_flag: bool,
    pub vcl_hrd_parameters_present_flag: bool,
    pub sub_pic_hrd_params_present_flag: bool,
    pub tick_divisor_minus2: u8,
    pub du_cpb_removal_delay_increment_length_minus1: u8,
    pub sub_pic_cpb_params_in_pic_timing_sei_flag: bool,
    pub dpb_output_delay_du_length_minus1: u8,
    pub bit_rate_scale: u8,
    pub cpb_size_scale: u8,
    pub cpb_size_du_scale: u8,
    pub initial_cpb_removal_delay_length_minus1: u8,
    pub au_cpb_removal_delay_length_minus1: u8,
    pub dpb_output_delay_length_minus1: u8,
    pub fixed_pic_rate_general_flag: [bool; MAX_SUB_LAYERS],
    pub fixed_pic_rate_within_cvs_flag: [bool; MAX_SUB_LAYERS],
    pub elemental_duration_in_tc_minus1: [u32; MAX_SUB_LAYERS],
    pub low_delay_hrd_flag: [bool; MAX_SUB_LAYERS],
    pub cpb_cnt_minus1: [u32; MAX_SUB_LAYERS],
    pub nal_hrd: [SublayerHrdParameters; MAX_SUB_LAYERS],
    pub vcl_hrd: [SublayerHrdParameters; MAX_SUB_LAYERS],
}

impl HrdParams {
    fn parse(
        r: &mut BitReader,
        common_inf_present_flag: bool,
        max_sub_layers_minus1: u8,
    ) -> anyhow::Result<Self> {
        let mut hrd = HrdParams::default();

        if common_inf_present_flag {
            hrd.nal_hrd_parameters_present_flag = r.read_bit()?;
            hrd.vcl_hrd_parameters_present_flag = r.read_bit()?;
            if hrd.nal_hrd_parameters_present_flag || hrd.vcl_hrd_parameters_present_flag {
                hrd.sub_pic_hrd_params_present_flag = r.read_bit()?;
                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.tick_divisor_minus2 = r.read_bits(8)?;
                    hrd.du_cpb_removal_delay_increment_length_minus1 = r.read_bits(5)?;
                    hrd.sub_pic_cpb_params_in_pic_timing_sei_flag = r.read_bit()?;
                    hrd.dpb_output_delay_du_length_minus1 = r.read_bits(5)?;
                }
                hrd.bit_rate_scale = r.read_bits(4)?;
                hrd.cpb_size_scale = r.read_bits(4)?;
                if hrd.sub_pic_hrd_params_present_flag {
                    hrd.cpb_size_du_scale = r.read_bits(4)?;
                }
                hrd.initial_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
                hrd.au_cpb_removal_delay_length_minus1 = r.read_bits(5)?;
                hrd.dpb_output_delay_length_minus1 = r.read_bits(5)?;
            }
        }

        for i in 0..=usize::from(max_sub_layers_minus1) {
            hrd.fixed_pic_rate_general_flag[i] = r.read_bit()?;
            // Inferred to be 1 when the general flag is set.
            hrd.fixed_pic_rate_within_cvs_flag[i] = if hrd.fixed_pic_rate_general_flag[i] {
                true
            } else {
                r.read_bit()?
            };

            if hrd.fixed_pic_rate_within_cvs_flag[i] {
                hrd.elemental_duration_in_tc_minus1[i] = r.read_ue_max(2047)?;
            } else {
                hrd.low_delay_hrd_flag[i] = r.read_bit()?;
            }

            if !hrd.low_delay_hrd_flag[i] {
                hrd.cpb_cnt_minus1[i] = r.read_ue_max(31)?;
            }

            let cpb_cnt = hrd.cpb_cnt_minus1[i] as usize + 1;

            if hrd.nal_hrd_parameters_present_flag {
                hrd.nal_hrd[i] =
                    SublayerHrdParameters::parse(r, cpb_cnt, hrd.sub_pic_hrd_params_present_flag)?;
            }

            if hrd.vcl_hrd_parameters_present_flag {
                hrd.vcl_hrd[i] =
                    SublayerHrdParameters::parse(r, cpb_cnt, hrd.sub_pic_hrd_params_present_flag)?;
            }
        }

        Ok(hrd)
    }
}

/// A H.265 Video Parameter Set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vps {
    /// Identifies the VPS for reference by other syntax elements.
    pub video_parameter_set_id: u8,
    pub base_layer_internal_flag: bool,
    pub base_layer_available_flag: bool,
    pub max_layers_minus1: u8,
    /// Plus 1 specifies the maximum number of temporal sub-layers that may be
    /// present in each CVS referring to the VPS.
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub sub_layer_ordering_info_present_flag: bool,
    pub max_dec_pic_buffering_minus1: [u32; MAX_SUB_LAYERS],
    pub max_num_reorder_pics: [u32; MAX_SUB_LAYERS],
    pub max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
    pub max_layer_id: u8,
    pub num_layer_sets_minus1: u32,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub num_hrd_parameters: u32,
    pub hrd_layer_set_idx: Vec<u32>,
    pub cprms_present_flag: Vec<bool>,
    pub hrd_parameters: Vec<HrdParams>,
    pub extension_flag: bool,
}

/// vui_parameters(). See E.2.1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VuiParams {
    pub aspect_ratio_info_present_flag: bool,
    pub aspect_ratio_idc: u32,
    pub sar_width: u32,
    pub sar_height: u32,
    pub overscan_info_present_flag: bool,
    pub overscan_appropriate_flag: bool,
    pub video_signal_type_present_flag: bool,
    pub video_format: u8,
    pub video_full_range_flag: bool,
    pub colour_description_present_flag: bool,
    pub colour_primaries: u32,
    pub transfer_characteristics: u32,
    pub matrix_coeffs: u32,
    pub chroma_loc_info_present_flag: bool,
    pub chroma_sample_loc_type_top_field: u32,
    pub chroma_sample_loc_type_bottom_field: u32,
    pub neutral_chroma_indication_flag: bool,
    pub field_seq_flag: bool,
    pub frame_field_info_present_flag: bool,
    pub default_display_window_flag: bool,
    pub def_disp_win_left_offset: u32,
    pub def_disp_win_right_offset: u32,
    pub def_disp_win_top_offset: u32,
    pub def_disp_win_bottom_offset: u32,
    pub timing_info_present_flag: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
    pub poc_proportional_to_timing_flag: bool,
    pub num_ticks_poc_diff_one_minus1: u32,
    pub hrd_parameters_present_flag: bool,
    pub hrd: HrdParams,
    pub bitstream_restriction_flag: bool,
    pub tiles_fixed_structure_flag: bool,
    pub motion_vectors_over_pic_boundaries_flag: bool,
    pub restricted_ref_pic_lists_flag: bool,
    pub min_spatial_segmentation_idc: u32,
    pub max_bytes_per_pic_denom: u32,
    pub max_bits_per_min_cu_denom: u32,
    pub log2_max_mv_length_horizontal: u32,
    pub log2_max_mv_length_vertical: u32,
}

impl Default for VuiParams {
    fn default() -> Self {
        Self {
            aspect_ratio_info_present_flag: false,
            aspect_ratio_idc: 0,
            sar_width: 0,
            sar_height: 0,
            overscan_info_present_flag: false,
            overscan_appropriate_flag: false,
            video_signal_type_present_flag: false,
            video_format: 5,
            video_full_range_flag: false,
            colour_description_present_flag: false,
            colour_primaries: 2,
            transfer_characteristics: 2,
            matrix_coeffs: 2,
            chroma_loc_info_present_flag: false,
            chroma_sample_loc_type_top_field: 0,
            chroma_sample_loc_type_bottom_field: 0,
            neutral_chroma_indication_flag: false,
            field_seq_flag: false,
            frame_field_info_present_flag: false,
            default_display_window_flag: false,
            def_disp_win_left_offset: 0,
            def_disp_win_right_offset: 0,
            def_disp_win_top_offset: 0,
            def_disp_win_bottom_offset: 0,
            timing_info_present_flag: false,
            num_units_in_tick: 0,
            time_scale: 0,
            poc_proportional_to_timing_flag: false,
            num_ticks_poc_diff_one_minus1: 0,
            hrd_parameters_present_flag: false,
            hrd: HrdParams::default(),
            bitstream_restriction_flag: false,
            tiles_fixed_structure_flag: false,
            motion_vectors_over_pic_boundaries_flag: true,
            restricted_ref_pic_lists_flag: false,
            min_spatial_segmentation_idc: 0,
            max_bytes_per_pic_denom: 2,
            max_bits_per_min_cu_denom: 1,
            log2_max_mv_length_horizontal: 15,
            log2_max_mv_length_vertical: 15,
        }
    }
}

impl VuiParams {
    fn parse(r: &mut BitReader, max_sub_layers_minus1: u8) -> anyhow::Result<Self> {
        const EXTENDED_SAR: u32 = 255;

        let mut vui = VuiParams {
            aspect_ratio_info_present_flag: r.read_bit()?,
            ..Default::default()
        };

        if vui.aspect_ratio_info_present_flag {
            vui.aspect_ratio_idc = r.read_bits(8)?;
            if vui.aspect_ratio_idc == EXTENDED_SAR {
                vui.sar_width = r.read_bits(16)?;
                vui.sar_height = r.read_bits(16)?;
            }
        }

        vui.overscan_info_present_flag = r.read_bit()?;
        if vui.overscan_info_present_flag {
            vui.overscan_appropriate_flag = r.read_bit()?;
        }

        vui.video_signal_type_present_flag = r.read_bit()?;
        if vui.video_signal_type_present_flag {
            vui.video_format = r.read_bits(3)?;
            vui.video_full_range_flag = r.read_bit()?;
            vui.colour_description_present_flag = r.read_bit()?;
            if vui.colour_description_present_flag {
                vui.colour_primaries = r.read_bits(8)?;
                vui.transfer_characteristics = r.read_bits(8)?;
                vui.matrix_coeffs = r.read_bits(8)?;
            }
        }

        vui.chroma_loc_info_present_flag = r.read_bit()?;
        if vui.chroma_loc_info_present_flag {
            vui.chroma_sample_loc_type_top_field = r.read_ue_max(5)?;
            vui.chroma_sample_loc_type_bottom_field = r.read_ue_max(5)?;
        }

        vui.neutral_chroma_indication_flag = r.read_bit()?;
        vui.field_seq_flag = r.read_bit()?;
        vui.frame_field_info_present_flag = r.read_bit()?;
        vui.default_display_window_flag = r.read_bit()?;

        if vui.default_display_window_flag {
            vui.def_disp_win_left_offset = r.read_ue()?;
            vui.def_disp_win_right_offset = r.read_ue()?;
            vui.def_disp_win_top_offset = r.read_ue()?;
            vui.def_disp_win_bottom_offset = r.read_ue()?;
        }

        vui.timing_info_present_flag = r.read_bit()?;
        if vui.timing_info_present_flag {
            vui.num_units_in_tick = r.read_bits(32)?;
            vui.time_scale = r.read_bits(32)?;

            vui.poc_proportional_to_timing_flag = r.read_bit()?;
            if vui.poc_proportional_to_timing_flag {
                vui.num_ticks_poc_diff_one_minus1 = r.read_ue_max(u32::MAX - 1)?;
            }

            vui.hrd_parameters_present_flag = r.read_bit()?;
            if vui.hrd_parameters_present_flag {
                vui.hrd = HrdParams::parse(r, true, max_sub_layers_minus1)?;
            }
        }

        vui.bitstream_restriction_flag = r.read_bit()?;
        if vui.bitstream_restriction_flag {
            vui.tiles_fixed_structure_flag = r.read_bit()?;
            vui.motion_vectors_over_pic_boundaries_flag = r.read_bit()?;
            vui.restricted_ref_pic_lists_flag = r.read_bit()?;

            vui.min_spatial_segmentation_idc = r.read_ue_max(4095)?;
            vui.max_bytes_per_pic_denom = r.read_ue_max(16)?;
            vui.max_bits_per_min_cu_denom = r.read_ue_max(16)?;
            vui.log2_max_mv_length_horizontal = r.read_ue_max(15)?;
            vui.log2_max_mv_length_vertical = r.read_ue_max(15)?;
        }

        Ok(vui)
    }
}

/// Scaling lists in coded (up-right diagonal) order. See 7.3.4.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScalingLists {
    pub scaling_list_4x4: [[u8; 16]; 6],
    pub scaling_list_8x8: [[u8; 64]; 6],
    pub scaling_list_16x16: [[u8; 64]; 6],
    pub scaling_list_32x32: [[u8; 64]; 6],
    /// scaling_list_dc_coef_minus8 + 8 for the 16x16 lists.
    pub scaling_list_dc_coef_16x16: [u8; 6],
    /// scaling_list_dc_coef_minus8 + 8 for the 32x32 lists.
    pub scaling_list_dc_coef_32x32: [u8; 6],
}

impl Default for ScalingLists {
    /// The lists inferred when scaling lists are enabled but not coded.
    fn default() -> Self {
        let mut sl = Self {
            scaling_list_4x4: [DEFAULT_SCALING_LIST_0; 6],
            scaling_list_8x8: [[0; 64]; 6],
            scaling_list_16x16: [[0; 64]; 6],
            scaling_list_32x32: [[0; 64]; 6],
            scaling_list_dc_coef_16x16: [16; 6],
            scaling_list_dc_coef_32x32: [16; 6],
        };

        for matrix_id in 0..6 {
            let list = Self::default_list(matrix_id);
            sl.scaling_list_8x8[matrix_id] = *list;
            sl.scaling_list_16x16[matrix_id] = *list;
            sl.scaling_list_32x32[matrix_id] = *list;
        }

        sl
    }
}

impl ScalingLists {
    fn default_list(matrix_id: usize) -> &'static [u8; 64] {
        // Intra matrices come first.
        if matrix_id < 3 {
            &DEFAULT_SCALING_LIST_1
        } else {
            &DEFAULT_SCALING_LIST_2
        }
    }

    fn list_mut(&mut self, size_id: usize, matrix_id: usize) -> &mut [u8] {
        match size_id {
            0 => &mut self.scaling_list_4x4[matrix_id],
            1 => &mut self.scaling_list_8x8[matrix_id],
            2 => &mut self.scaling_list_16x16[matrix_id],
            _ => &mut self.scaling_list_32x32[matrix_id],
        }
    }

    fn list(&self, size_id: usize, matrix_id: usize) -> &[u8] {
        match size_id {
            0 => &self.scaling_list_4x4[matrix_id],
            1 => &self.scaling_list_8x8[matrix_id],
            2 => &self.scaling_list_16x16[matrix_id],
            _ => &self.scaling_list_32x32[matrix_id],
        }
    }

    fn dc_coef_mut(&mut self, size_id: usize, matrix_id: usize) -> Option<&mut u8> {
        match size_id {
            2 => Some(&mut self.scaling_list_dc_coef_16x16[matrix_id]),
            3 => Some(&mut self.scaling_list_dc_coef_32x32[matrix_id]),
            _ => None,
        }
    }

    /// scaling_list_data(). See 7.3.4 and 7.4.5.
    fn parse(r: &mut BitReader) -> anyhow::Result<Self> {
        let mut sl = ScalingLists::default();

        for size_id in 0..4 {
            let step = if size_id == 3 { 3 } else { 1 };
            for matrix_id in (0..6).step_by(step) {
                let scaling_list_pred_mode_flag = r.read_bit()?;

                if !scaling_list_pred_mode_flag {
                    let delta: usize = r.read_ue_max(matrix_id as u32 / step as u32)?;

                    if delta == 0 {
                        // Inferred from the default lists.
                        if size_id == 0 {
                            sl.scaling_list_4x4[matrix_id] = DEFAULT_SCALING_LIST_0;
                        } else {
                            let list = Self::default_list(matrix_id);
                            sl.list_mut(size_id, matrix_id).copy_from_slice(list);
                        }

                        if let Some(dc) = sl.dc_coef_mut(size_id, matrix_id) {
                            *dc = 16;
                        }
                    } else {
                        // (7-42)
                        let ref_matrix_id = matrix_id - delta * step;
                        let list = sl.list(size_id, ref_matrix_id).to_vec();
                        sl.list_mut(size_id, matrix_id).copy_from_slice(&list);

                        let dc = match size_id {
                            2 => Some(sl.scaling_list_dc_coef_16x16[ref_matrix_id]),
                            3 => Some(sl.scaling_list_dc_coef_32x32[ref_matrix_id]),
                            _ => None,
                        };

                        if let (Some(dc), Some(dst)) = (dc, sl.dc_coef_mut(size_id, matrix_id)) {
                            *dst = dc;
                        }
                    }
                } else {
                    let mut next_coef = 8i32;
                    let coef_num = std::cmp::min(64, 1 << (4 + (size_id << 1)));

                    if size_id > 1 {
                        let scaling_list_dc_coef_minus8: i32 = r.read_se_bounded(-7, 247)?;
                        next_coef = scaling_list_dc_coef_minus8 + 8;
                        if let Some(dc) = sl.dc_coef_mut(size_id, matrix_id) {
                            *dc = next_coef as u8;
                        }
                    }

                    let list = sl.list_mut(size_id, matrix_id);
                    for coef in list.iter_mut().take(coef_num) {
                        let scaling_list_delta_coef: i32 = r.read_se_bounded(-128, 127)?;
                        next_coef = (next_coef + scaling_list_delta_coef + 256) % 256;
                        *coef = next_coef as u8;
                    }
                }
            }
        }

        Ok(sl)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpsRangeExtension {
    pub transform_skip_rotation_enabled_flag: bool,
    pub transform_skip_context_enabled_flag: bool,
    pub implicit_rdpcm_enabled_flag: bool,
    pub explicit_rdpcm_enabled_flag: bool,
    pub extended_precision_processing_flag: bool,
    pub intra_smoothing_disabled_flag: bool,
    pub high_precision_offsets_enabled_flag: bool,
    pub persistent_rice_adaptation_enabled_flag: bool,
    pub cabac_bypass_alignment_enabled_flag: bool,
}

impl SpsRangeExtension {
    fn parse(r: &mut BitReader) -> anyhow::Result<Self> {
        Ok(Self {
            transform_skip_rotation_enabled_flag: r.read_bit()?,
            transform_skip_context_enabled_flag: r.read_bit()?,
            implicit_rdpcm_enabled_flag: r.read_bit()?,
            explicit_rdpcm_enabled_flag: r.read_bit()?,
            extended_precision_processing_flag: r.read_bit()?,
            intra_smoothing_disabled_flag: r.read_bit()?,
            high_precision_offsets_enabled_flag: r.read_bit()?,
            persistent_rice_adaptation_enabled_flag: r.read_bit()?,
            cabac_bypass_alignment_enabled_flag: r.read_bit()?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpsSccExtension {
    /// When set, a picture in the CVS may be included in a reference picture
    /// list of a slice of the picture itself.
    pub curr_pic_ref_enabled_flag: bool,
    pub palette_mode_enabled_flag: bool,
    pub palette_max_size: u8,
    pub delta_palette_max_predictor_size: u8,
    pub palette_predictor_initializers_present_flag: bool,
    pub num_palette_predictor_initializer_minus1: u8,
    pub palette_predictor_initializer: [Vec<u32>; 3],
    pub motion_vector_resolution_control_idc: u8,
    pub intra_boundary_filtering_disabled_flag: bool,
}

impl SpsSccExtension {
    fn parse(r: &mut BitReader, sps: &Sps) -> anyhow::Result<Self> {
        let mut scc = SpsSccExtension {
            curr_pic_ref_enabled_flag: r.read_bit()?,
            palette_mode_enabled_flag: r.read_bit()?,
            ..Default::default()
        };

        if scc.palette_mode_enabled_flag {
            scc.palette_max_size = r.read_ue_max(64)?;
            scc.delta_palette_max_predictor_size =
                r.read_ue_max(128 - u32::from(scc.palette_max_size))?;
            scc.palette_predictor_initializers_present_flag = r.read_bit()?;
            if scc.palette_predictor_initializers_present_flag {
                let max = (u32::from(scc.palette_max_size)
                    + u32::from(scc.delta_palette_max_predictor_size))
                .saturating_sub(1);
                scc.num_palette_predictor_initializer_minus1 = r.read_ue_max(max)?;

                let num_comps = if sps.chroma_format_idc == 0 { 1 } else { 3 };
                for comp in 0..num_comps {
                    let num_bits = if comp == 0 {
                        sps.bit_depth_luma_minus8 + 8
                    } else {
                        sps.bit_depth_chroma_minus8 + 8
                    };

                    for _ in 0..=scc.num_palette_predictor_initializer_minus1 {
                        let entry = r.read_bits(usize::from(num_bits))?;
                        scc.palette_predictor_initializer[comp].push(entry);
                    }
                }
            }
        }

        scc.motion_vector_resolution_control_idc = r.read_bits(2)?;
        scc.intra_boundary_filtering_disabled_flag = r.read_bit()?;

        Ok(scc)
    }
}

/// A H.265 Sequence Parameter Set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sps {
    /// Specifies the value of the vps_video_parameter_set_id of the active
    /// VPS.
    pub video_parameter_set_id: u8,
    pub max_sub_layers_minus1: u8,
    pub temporal_id_nesting_flag: bool,
    pub profile_tier_level: ProfileTierLevel,
    pub seq_parameter_set_id: u8,
    pub chroma_format_idc: u8,
    pub separate_colour_plane_flag: bool,
    pub pic_width_in_luma_samples: u16,
    pub pic_height_in_luma_samples: u16,
    pub conformance_window_flag: bool,
    pub conf_win_left_offset: u32,
    pub conf_win_right_offset: u32,
    pub conf_win_top_offset: u32,
    pub conf_win_bottom_offset: u32,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    /// MaxPicOrderCntLsb = 2^(log2_max_pic_order_cnt_lsb_minus4 + 4).
    pub log2_max_pic_order_cnt_lsb_minus4: u8,
    pub sub_layer_ordering_info_present_flag: bool,
    pub max_dec_pic_buffering_minus1: [u8; MAX_SUB_LAYERS],
    pub max_num_reorder_pics: [u8; MAX_SUB_LAYERS],
    pub max_latency_increase_plus1: [u32; MAX_SUB_LAYERS],
    pub log2_min_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_luma_coding_block_size: u8,
    pub log2_min_luma_transform_block_size_minus2: u8,
    pub log2_diff_max_min_luma_transform_block_size: u8,
    pub max_transform_hierarchy_depth_inter: u8,
    pub max_transform_hierarchy_depth_intra: u8,
    pub scaling_list_enabled_flag: bool,
    pub scaling_list_data_present_flag: bool,
    /// Coded or inferred lists, meaningful when scaling_list_enabled_flag is
    /// set.
    pub scaling_list: ScalingLists,
    pub amp_enabled_flag: bool,
    pub sample_adaptive_offset_enabled_flag: bool,
    pub pcm_enabled_flag: bool,
    pub pcm_sample_bit_depth_luma_minus1: u8,
    pub pcm_sample_bit_depth_chroma_minus1: u8,
    pub log2_min_pcm_luma_coding_block_size_minus3: u8,
    pub log2_diff_max_min_pcm_luma_coding_block_size: u8,
    pub pcm_loop_filter_disabled_flag: bool,
    pub num_short_term_ref_pic_sets: u8,
    pub short_term_ref_pic_set: Vec<ShortTermRefPicSet>,
    pub long_term_ref_pics_present_flag: bool,
    pub num_long_term_ref_pics_sps: u8,
    pub lt_ref_pic_poc_lsb_sps: [u32; MAX_RPS_ENTRIES],
    pub used_by_curr_pic_lt_sps_flag: [bool; MAX_RPS_ENTRIES],
    pub temporal_mvp_enabled_flag: bool,
    pub strong_intra_smoothing_enabled_flag: bool,
    pub vui_parameters_present_flag: bool,
    pub vui_parameters: VuiParams,
    pub extension_present_flag: bool,
    pub range_extension_flag: bool,
    pub range_extension: SpsRangeExtension,
    pub scc_extension_flag: bool,
    pub scc_extension: SpsSccExtension,

    // Internal variables.
    pub chroma_array_type: u8,
    pub min_cb_log2_size_y: u32,
    pub ctb_log2_size_y: u32,
    pub ctb_size_y: u32,
    pub pic_width_in_ctbs_y: u32,
    pub pic_height_in_ctbs_y: u32,
    pub pic_size_in_ctbs_y: u32,
    pub max_tb_log2_size_y: u32,
    pub wp_offset_half_range_y: u32,
    pub wp_offset_half_range_c: u32,
}

impl Sps {
    /// MaxPicOrderCntLsb.
    pub fn max_pic_order_cnt_lsb(&self) -> u32 {
        1 << (u32::from(self.log2_max_pic_order_cnt_lsb_minus4) + 4)
    }

    pub fn bit_depth_luma(&self) -> u8 {
        self.bit_depth_luma_minus8 + 8
    }

    pub fn bit_depth_chroma(&self) -> u8 {
        self.bit_depth_chroma_minus8 + 8
    }

    /// sps_max_num_reorder_pics for the highest temporal sub-layer.
    pub fn num_reorder_pics(&self) -> u32 {
        u32::from(self.max_num_reorder_pics[usize::from(self.max_sub_layers_minus1)])
    }

    /// sps_max_dec_pic_buffering for the highest temporal sub-layer.
    pub fn max_dec_pic_buffering(&self) -> u32 {
        u32::from(self.max_dec_pic_buffering_minus1[usize::from(self.max_sub_layers_minus1)]) + 1
    }

    /// The size of the picture after applying the conformance window.
    pub fn visible_size(&self) -> (u32, u32) {
        let (sub_width_c, sub_height_c) = match self.chroma_array_type {
            1 => (2, 2),
            2 => (2, 1),
            _ => (1, 1),
        };

        let width = u32::from(self.pic_width_in_luma_samples).saturating_sub(
            sub_width_c * (self.conf_win_left_offset.saturating_add(self.conf_win_right_offset)),
        );
        let height = u32::from(self.pic_height_in_luma_samples).saturating_sub(
            sub_height_c * (self.conf_win_top_offset.saturating_add(self.conf_win_bottom_offset)),
        );

        (width, height)
    }

    /// Streams this decoder cannot process even though their syntax is
    /// valid.
    fn check_supported(&self) -> Result<(), String> {
        if self.chroma_format_idc > 1 {
            return Err(format!(
                "chroma_format_idc {} is not supported",
                self.chroma_format_idc
            ));
        }

        if self.bit_depth_luma() > 10 {
            return Err(format!(
                "luma bit depth {} is not supported",
                self.bit_depth_luma()
            ));
        }

        if self.chroma_format_idc != 0 && self.bit_depth_chroma() != self.bit_depth_luma() {
            return Err(format!(
                "different luma ({}) and chroma ({}) bit depths are not supported",
                self.bit_depth_luma(),
                self.bit_depth_chroma()
            ));
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpsRangeExtension {
    pub log2_max_transform_skip_block_size_minus2: u32,
    pub cross_component_prediction_enabled_flag: bool,
    pub chroma_qp_offset_list_enabled_flag: bool,
    pub diff_cu_chroma_qp_offset_depth: u32,
    pub chroma_qp_offset_list_len_minus1: u32,
    pub cb_qp_offset_list: [i8; 6],
    pub cr_qp_offset_list: [i8; 6],
    pub log2_sao_offset_scale_luma: u32,
    pub log2_sao_offset_scale_chroma: u32,
}

impl PpsRangeExtension {
    fn parse(r: &mut BitReader, pps: &Pps, sps: &Sps) -> anyhow::Result<Self> {
        let mut rext = PpsRangeExtension::default();

        if pps.transform_skip_enabled_flag {
            rext.log2_max_transform_skip_block_size_minus2 =
                r.read_ue_max(sps.max_tb_log2_size_y.saturating_sub(2))?;
        }

        rext.cross_component_prediction_enabled_flag = r.read_bit()?;
        rext.chroma_qp_offset_list_enabled_flag = r.read_bit()?;
        if rext.chroma_qp_offset_list_enabled_flag {
            rext.diff_cu_chroma_qp_offset_depth =
                r.read_ue_max(u32::from(sps.log2_diff_max_min_luma_coding_block_size))?;
            rext.chroma_qp_offset_list_len_minus1 = r.read_ue_max(5)?;
            for i in 0..=rext.chroma_qp_offset_list_len_minus1 as usize {
                rext.cb_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
                rext.cr_qp_offset_list[i] = r.read_se_bounded(-12, 12)?;
            }
        }

        rext.log2_sao_offset_scale_luma =
            r.read_ue_max(u32::from(sps.bit_depth_luma().saturating_sub(10)))?;
        rext.log2_sao_offset_scale_chroma =
            r.read_ue_max(u32::from(sps.bit_depth_chroma().saturating_sub(10)))?;

        Ok(rext)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PpsSccExtension {
    pub curr_pic_ref_enabled_flag: bool,
    pub residual_adaptive_colour_transform_enabled_flag: bool,
    pub slice_act_qp_offsets_present_flag: bool,
    pub act_y_qp_offset_plus5: i8,
    pub act_cb_qp_offset_plus5: i8,
    pub act_cr_qp_offset_plus3: i8,
    pub palette_predictor_initializers_present_flag: bool,
    pub num_palette_predictor_initializers: u32,
    pub monochrome_palette_flag: bool,
    pub luma_bit_depth_entry_minus8: u8,
    pub chroma_bit_depth_entry_minus8: u8,
    pub palette_predictor_initializer: [Vec<u32>; 3],
}

impl PpsSccExtension {
    fn parse(r: &mut BitReader, sps: &Sps) -> anyhow::Result<Self> {
        let mut scc = PpsSccExtension {
            curr_pic_ref_enabled_flag: r.read_bit()?,
            residual_adaptive_colour_transform_enabled_flag: r.read_bit()?,
            ..Default::default()
        };

        if scc.residual_adaptive_colour_transform_enabled_flag {
            scc.slice_act_qp_offsets_present_flag = r.read_bit()?;
            scc.act_y_qp_offset_plus5 = r.read_se_bounded(-7, 17)?;
            scc.act_cb_qp_offset_plus5 = r.read_se_bounded(-7, 17)?;
            scc.act_cr_qp_offset_plus3 = r.read_se_bounded(-9, 15)?;
        }

        scc.palette_predictor_initializers_present_flag = r.read_bit()?;
        if scc.palette_predictor_initializers_present_flag {
            let max = u32::from(sps.scc_extension.palette_max_size)
                + u32::from(sps.scc_extension.delta_palette_max_predictor_size);
            scc.num_palette_predictor_initializers = r.read_ue_max(max)?;
            if scc.num_palette_predictor_initializers > 0 {
                scc.monochrome_palette_flag = r.read_bit()?;
                scc.luma_bit_depth_entry_minus8 = r.read_ue_bounded(
                    sps.bit_depth_luma_minus8.into(),
                    sps.bit_depth_luma_minus8.into(),
                )?;
                if !scc.monochrome_palette_flag {
                    scc.chroma_bit_depth_entry_minus8 = r.read_ue_bounded(
                        sps.bit_depth_chroma_minus8.into(),
                        sps.bit_depth_chroma_minus8.into(),
                    )?;
                }

                let num_comps = if scc.monochrome_palette_flag { 1 } else { 3 };
                for comp in 0..num_comps {
                    let num_bits = if comp == 0 {
                        scc.luma_bit_depth_entry_minus8 + 8
                    } else {
                        scc.chroma_bit_depth_entry_minus8 + 8
                    };

                    for _ in 0..scc.num_palette_predictor_initializers {
                        let entry = r.read_bits(usize::from(num_bits))?;
                        scc.palette_predictor_initializer[comp].push(entry);
                    }
                }
            }
        }

        Ok(scc)
    }
}

/// A H.265 Picture Parameter Set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Pps {
    /// Identifies the PPS for reference by other syntax elements.
    pub pic_parameter_set_id: u8,
    pub seq_parameter_set_id: u8,
    pub dependent_slice_segments_enabled_flag: bool,
    pub output_flag_present_flag: bool,
    pub num_extra_slice_header_bits: u8,
    pub sign_data_hiding_enabled_flag: bool,
    pub cabac_init_present_flag: bool,
    pub num_ref_idx_l0_default_active_minus1: u8,
    pub num_ref_idx_l1_default_active_minus1: u8,
    pub init_qp_minus26: i8,
    pub constrained_intra_pred_flag: bool,
    pub transform_skip_enabled_flag: bool,
    pub cu_qp_delta_enabled_flag: bool,
    pub diff_cu_qp_delta_depth: u32,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub slice_chroma_qp_offsets_present_flag: bool,
    pub weighted_pred_flag: bool,
    pub weighted_bipred_flag: bool,
    pub transquant_bypass_enabled_flag: bool,
    pub tiles_enabled_flag: bool,
    pub entropy_coding_sync_enabled_flag: bool,
    pub num_tile_columns_minus1: u8,
    pub num_tile_rows_minus1: u8,
    pub uniform_spacing_flag: bool,
    /// Width of each tile column in CTBs, minus 1. Filled for uniform
    /// spacing as well.
    pub column_width_minus1: Vec<u32>,
    /// Height of each tile row in CTBs, minus 1.
    pub row_height_minus1: Vec<u32>,
    pub loop_filter_across_tiles_enabled_flag: bool,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub deblocking_filter_control_present_flag: bool,
    pub deblocking_filter_override_enabled_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub scaling_list_data_present_flag: bool,
    /// The PPS lists when coded, the SPS ones otherwise.
    pub scaling_list: ScalingLists,
    pub lists_modification_present_flag: bool,
    pub log2_parallel_merge_level_minus2: u8,
    pub slice_segment_header_extension_present_flag: bool,
    pub extension_present_flag: bool,
    pub range_extension_flag: bool,
    pub range_extension: PpsRangeExtension,
    pub scc_extension_flag: bool,
    pub scc_extension: PpsSccExtension,

    // Internal variables.
    pub qp_bd_offset_y: u32,
    /// TemporalId of the NALU carrying this PPS.
    pub temporal_id: u8,

    /// The SPS this PPS was parsed against.
    pub sps: Rc<Sps>,
}

/// Table 7-7 – Name association to slice_type
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SliceType {
    B = 0,
    P = 1,
    #[default]
    I = 2,
}

impl SliceType {
    /// Whether this is a P slice. See table 7-7.
    pub fn is_p(&self) -> bool {
        matches!(self, SliceType::P)
    }

    /// Whether this is a B slice. See table 7-7.
    pub fn is_b(&self) -> bool {
        matches!(self, SliceType::B)
    }

    /// Whether this is an I slice. See table 7-7.
    pub fn is_i(&self) -> bool {
        matches!(self, SliceType::I)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PredWeightTable {
    pub luma_log2_weight_denom: u8,
    pub delta_chroma_log2_weight_denom: i8,
    pub chroma_log2_weight_denom: u8,
    pub luma_weight_l0_flag: [bool; MAX_REF_IDX_ACTIVE],
    pub chroma_weight_l0_flag: [bool; MAX_REF_IDX_ACTIVE],
    pub delta_luma_weight_l0: [i8; MAX_REF_IDX_ACTIVE],
    pub luma_offset_l0: [i32; MAX_REF_IDX_ACTIVE],
    pub delta_chroma_weight_l0: [[i8; 2]; MAX_REF_IDX_ACTIVE],
    pub delta_chroma_offset_l0: [[i32; 2]; MAX_REF_IDX_ACTIVE],
    pub luma_weight_l1_flag: [bool; MAX_REF_IDX_ACTIVE],
    pub chroma_weight_l1_flag: [bool; MAX_REF_IDX_ACTIVE],
    pub delta_luma_weight_l1: [i8; MAX_REF_IDX_ACTIVE],
    pub luma_offset_l1: [i32; MAX_REF_IDX_ACTIVE],
    pub delta_chroma_weight_l1: [[i8; 2]; MAX_REF_IDX_ACTIVE],
    pub delta_chroma_offset_l1: [[i32; 2]; MAX_REF_IDX_ACTIVE],
}

/// The weights and offsets of one reference list.
struct ListWeights<'a> {
    luma_weight_flag: &'a mut [bool; MAX_REF_IDX_ACTIVE],
    chroma_weight_flag: &'a mut [bool; MAX_REF_IDX_ACTIVE],
    delta_luma_weight: &'a mut [i8; MAX_REF_IDX_ACTIVE],
    luma_offset: &'a mut [i32; MAX_REF_IDX_ACTIVE],
    delta_chroma_weight: &'a mut [[i8; 2]; MAX_REF_IDX_ACTIVE],
    delta_chroma_offset: &'a mut [[i32; 2]; MAX_REF_IDX_ACTIVE],
}

impl<'a> ListWeights<'a> {
    fn parse(&mut self, r: &mut BitReader, num_active: usize, sps: &Sps) -> anyhow::Result<()> {
        for i in 0..num_active {
            self.luma_weight_flag[i] = r.read_bit()?;
        }

        if sps.chroma_array_type != 0 {
            for i in 0..num_active {
                self.chroma_weight_flag[i] = r.read_bit()?;
            }
        }

        let wp_y = sps.wp_offset_half_range_y as i32;
        let wp_c = sps.wp_offset_half_range_c as i32;

        for i in 0..num_active {
            if self.luma_weight_flag[i] {
                self.delta_luma_weight[i] = r.read_se_bounded(-128, 127)?;
                self.luma_offset[i] = r.read_se_bounded(-wp_y, wp_y - 1)?;
            }

            if self.chroma_weight_flag[i] {
                for j in 0..2 {
                    self.delta_chroma_weight[i][j] = r.read_se_bounded(-128, 127)?;
                    self.delta_chroma_offset[i][j] = r.read_se_bounded(-4 * wp_c, 4 * wp_c - 1)?;
                }
            }
        }

        Ok(())
    }
}

impl PredWeightTable {
    /// pred_weight_table(). See 7.3.6.3.
    fn parse(r: &mut BitReader, hdr: &SliceHeader, sps: &Sps) -> anyhow::Result<Self> {
        let mut pwt = PredWeightTable {
            luma_log2_weight_denom: r.read_ue_max(7)?,
            ..Default::default()
        };

        if sps.chroma_array_type != 0 {
            pwt.delta_chroma_log2_weight_denom = r.read_se()?;
            let denom = i32::from(pwt.luma_log2_weight_denom)
                + i32::from(pwt.delta_chroma_log2_weight_denom);
            if !(0..=7).contains(&denom) {
                return Err(anyhow!("Invalid ChromaLog2WeightDenom {}", denom));
            }
            pwt.chroma_log2_weight_denom = denom as u8;
        }

        ListWeights {
            luma_weight_flag: &mut pwt.luma_weight_l0_flag,
            chroma_weight_flag: &mut pwt.chroma_weight_l0_flag,
            delta_luma_weight: &mut pwt.delta_luma_weight_l0,
            luma_offset: &mut pwt.luma_offset_l0,
            delta_chroma_weight: &mut pwt.delta_chroma_weight_l0,
            delta_chroma_offset: &mut pwt.delta_chroma_offset_l0,
        }
        .parse(r, usize::from(hdr.num_ref_idx_l0_active_minus1) + 1, sps)?;

        if hdr.type_.is_b() {
            ListWeights {
                luma_weight_flag: &mut pwt.luma_weight_l1_flag,
                chroma_weight_flag: &mut pwt.chroma_weight_l1_flag,
                delta_luma_weight: &mut pwt.delta_luma_weight_l1,
                luma_offset: &mut pwt.luma_offset_l1,
                delta_chroma_weight: &mut pwt.delta_chroma_weight_l1,
                delta_chroma_offset: &mut pwt.delta_chroma_offset_l1,
            }
            .parse(r, usize::from(hdr.num_ref_idx_l1_active_minus1) + 1, sps)?;
        }

        Ok(pwt)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RefPicListModification {
    pub ref_pic_list_modification_flag_l0: bool,
    pub list_entry_l0: [u8; MAX_REF_IDX_ACTIVE],
    pub ref_pic_list_modification_flag_l1: bool,
    pub list_entry_l1: [u8; MAX_REF_IDX_ACTIVE],
}

impl RefPicListModification {
    /// ref_pic_lists_modification(). See 7.3.6.2.
    fn parse(r: &mut BitReader, hdr: &SliceHeader) -> anyhow::Result<Self> {
        let mut rplm = RefPicListModification::default();
        let num_bits = ceil_log2(hdr.num_pic_total_curr);
        let max = hdr.num_pic_total_curr.saturating_sub(1);

        let read_entries = |r: &mut BitReader, entries: &mut [u8], num: u8| -> anyhow::Result<()> {
            for entry in entries.iter_mut().take(usize::from(num) + 1) {
                let value: u32 = r.read_bits(num_bits)?;
                if value > max {
                    return Err(anyhow!(
                        "Invalid list_entry {}, expected at most NumPicTotalCurr - 1: {}",
                        value,
                        max
                    ));
                }
                *entry = value as u8;
            }

            Ok(())
        };

        rplm.ref_pic_list_modification_flag_l0 = r.read_bit()?;
        if rplm.ref_pic_list_modification_flag_l0 {
            read_entries(r, &mut rplm.list_entry_l0, hdr.num_ref_idx_l0_active_minus1)?;
        }

        if hdr.type_.is_b() {
            rplm.ref_pic_list_modification_flag_l1 = r.read_bit()?;
            if rplm.ref_pic_list_modification_flag_l1 {
                read_entries(r, &mut rplm.list_entry_l1, hdr.num_ref_idx_l1_active_minus1)?;
            }
        }

        Ok(rplm)
    }
}

/// A H.265 slice segment header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SliceHeader {
    /// When set, specifies that the slice segment is the first slice segment
    /// of the picture in decoding order.
    pub first_slice_segment_in_pic_flag: bool,
    /// Affects the output of previously-decoded pictures in the decoded
    /// picture buffer after the decoding of an IDR or a BLA picture.
    pub no_output_of_prior_pics_flag: bool,
    pub pic_parameter_set_id: u8,
    pub dependent_slice_segment_flag: bool,
    /// The address of the first CTB in the slice segment, in the coding tree
    /// block raster scan of a picture.
    pub segment_address: u32,
    pub type_: SliceType,
    pub pic_output_flag: bool,
    pub colour_plane_id: u8,
    /// Specifies the picture order count modulo MaxPicOrderCntLsb for the
    /// current picture. 0 for IDR pictures.
    pub pic_order_cnt_lsb: u32,
    pub short_term_ref_pic_set_sps_flag: bool,
    /// The short-term RPS in use: either the one coded in this header or a
    /// copy of the SPS one selected by `short_term_ref_pic_set_idx`.
    pub short_term_ref_pic_set: ShortTermRefPicSet,
    pub short_term_ref_pic_set_idx: u8,
    /// Size in bits of the st_ref_pic_set() coded in this header.
    pub st_rps_bits: u32,
    pub long_term_ref_pic_set: LongTermRefPicSet,
    pub temporal_mvp_enabled_flag: bool,
    pub sao_luma_flag: bool,
    pub sao_chroma_flag: bool,
    pub num_ref_idx_active_override_flag: bool,
    pub num_ref_idx_l0_active_minus1: u8,
    pub num_ref_idx_l1_active_minus1: u8,
    pub ref_pic_list_modification: RefPicListModification,
    pub mvd_l1_zero_flag: bool,
    pub cabac_init_flag: bool,
    pub collocated_from_l0_flag: bool,
    pub collocated_ref_idx: u8,
    pub pred_weight_table: PredWeightTable,
    pub five_minus_max_num_merge_cand: u8,
    pub use_integer_mv_flag: bool,
    pub qp_delta: i8,
    pub cb_qp_offset: i8,
    pub cr_qp_offset: i8,
    pub slice_act_y_qp_offset: i8,
    pub slice_act_cb_qp_offset: i8,
    pub slice_act_cr_qp_offset: i8,
    pub cu_chroma_qp_offset_enabled_flag: bool,
    pub deblocking_filter_override_flag: bool,
    pub deblocking_filter_disabled_flag: bool,
    pub beta_offset_div2: i8,
    pub tc_offset_div2: i8,
    pub loop_filter_across_slices_enabled_flag: bool,
    pub num_entry_point_offsets: u32,
    pub offset_len_minus1: u8,
    pub entry_point_offset_minus1: Vec<u32>,

    // Internal variables.
    /// NumPicTotalCurr, see (7-55).
    pub num_pic_total_curr: u32,
    /// Size of the header in bits, emulation prevention bytes excluded.
    pub header_bit_size: u32,
    /// Offset of the slice data in the NALU, header and emulation
    /// prevention bytes included.
    pub data_offset: usize,
    pub n_emulation_prevention_bytes: u32,
}

impl SliceHeader {
    /// Sets the values inferred when the syntax elements are absent.
    fn set_defaults(&mut self, sps: &Sps, pps: &Pps) {
        self.pic_output_flag = true;
        self.collocated_from_l0_flag = true;
        self.deblocking_filter_disabled_flag = pps.deblocking_filter_disabled_flag;
        self.beta_offset_div2 = pps.beta_offset_div2;
        self.tc_offset_div2 = pps.tc_offset_div2;
        self.loop_filter_across_slices_enabled_flag = pps.loop_filter_across_slices_enabled_flag;
        self.num_ref_idx_l0_active_minus1 = pps.num_ref_idx_l0_default_active_minus1;
        self.num_ref_idx_l1_active_minus1 = pps.num_ref_idx_l1_default_active_minus1;
        self.use_integer_mv_flag = sps.scc_extension.motion_vector_resolution_control_idc != 0;
    }
}

/// A slice segment: its parsed header and the NALU it was parsed from.
#[derive(Clone, Debug)]
pub struct Slice<'a> {
    pub header: SliceHeader,
    pub nalu: Nalu<'a>,
    /// The PPS active for this slice. Its SPS is `pps.sps`.
    pub pps: Rc<Pps>,
}

#[derive(Debug, Default)]
pub struct Parser {
    vps: ParamSetStore<Vps, MAX_VPS_COUNT>,
    sps: ParamSetStore<Sps, MAX_SPS_COUNT>,
    pps: ParamSetStore<Pps, MAX_PPS_COUNT>,
}

fn check_nalu_type(nalu: &Nalu, expected: NaluType) -> anyhow::Result<()> {
    if nalu.header.type_() != expected {
        return Err(anyhow!(
            "Invalid NALU type, expected {:?}, got {:?}",
            expected,
            nalu.header.type_()
        ));
    }

    Ok(())
}

impl Parser {
    /// Parse a VPS NALU.
    pub fn parse_vps(&mut self, nalu: &Nalu) -> Result<Rc<Vps>, ParseError> {
        check_nalu_type(nalu, NaluType::VpsNut)?;

        let rbsp = Rbsp::extract(nalu.payload())?;
        let mut r = BitReader::new(rbsp.data());

        let mut vps = Vps {
            video_parameter_set_id: r.read_bits(4)?,
            base_layer_internal_flag: r.read_bit()?,
            base_layer_available_flag: r.read_bit()?,
            max_layers_minus1: r.read_bits(6)?,
            max_sub_layers_minus1: r.read_bits(3)?,
            temporal_id_nesting_flag: r.read_bit()?,
            ..Default::default()
        };

        if usize::from(vps.max_sub_layers_minus1) >= MAX_SUB_LAYERS {
            return Err(anyhow!(
                "Invalid vps_max_sub_layers_minus1 {}",
                vps.max_sub_layers_minus1
            )
            .into());
        }

        r.skip_bits(16)?; // vps_reserved_0xffff_16bits

        vps.profile_tier_level = ProfileTierLevel::parse(&mut r, vps.max_sub_layers_minus1)?;

        vps.sub_layer_ordering_info_present_flag = r.read_bit()?;

        let max_sub_layer = usize::from(vps.max_sub_layers_minus1);
        let start = if vps.sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layer
        };

        for i in start..=max_sub_layer {
            vps.max_dec_pic_buffering_minus1[i] = r.read_ue_max(MAX_DPB_PICS - 1)?;
            vps.max_num_reorder_pics[i] = r.read_ue_max(vps.max_dec_pic_buffering_minus1[i])?;
            vps.max_latency_increase_plus1[i] = r.read_ue_max(u32::MAX - 1)?;

            if i > 0 {
                if vps.max_dec_pic_buffering_minus1[i] < vps.max_dec_pic_buffering_minus1[i - 1] {
                    return Err(anyhow!(
                        "Invalid vps_max_dec_pic_buffering_minus1[{}]: {}",
                        i,
                        vps.max_dec_pic_buffering_minus1[i]
                    )
                    .into());
                }

                if vps.max_num_reorder_pics[i] < vps.max_num_reorder_pics[i - 1] {
                    return Err(anyhow!(
                        "Invalid vps_max_num_reorder_pics[{}]: {}",
                        i,
                        vps.max_num_reorder_pics[i]
                    )
                    .into());
                }
            }
        }

        // The values for the highest sub-layer apply to all of them.
        if !vps.sub_layer_ordering_info_present_flag {
            for i in 0..max_sub_layer {
                vps.max_dec_pic_buffering_minus1[i] = vps.max_dec_pic_buffering_minus1[max_sub_layer];
                vps.max_num_reorder_pics[i] = vps.max_num_reorder_pics[max_sub_layer];
                vps.max_latency_increase_plus1[i] = vps.max_latency_increase_plus1[max_sub_layer];
            }
        }

        vps.max_layer_id = r.read_bits(6)?;
        vps.num_layer_sets_minus1 = r.read_ue_max(1023)?;

        // layer_id_included_flag[i][j]
        r.skip_bits(vps.num_layer_sets_minus1 as usize * (usize::from(vps.max_layer_id) + 1))?;

        vps.timing_info_present_flag = r.read_bit()?;
        if vps.timing_info_present_flag {
            vps.num_units_in_tick = r.read_bits(32)?;
            vps.time_scale = r.read_bits(32)?;

            vps.poc_proportional_to_timing_flag = r.read_bit()?;
            if vps.poc_proportional_to_timing_flag {
                vps.num_ticks_poc_diff_one_minus1 = r.read_ue_max(u32::MAX - 1)?;
            }

            vps.num_hrd_parameters = r.read_ue_max(vps.num_layer_sets_minus1 + 1)?;
            for i in 0..vps.num_hrd_parameters as usize {
                vps.hrd_layer_set_idx.push(r.read_ue_max(vps.num_layer_sets_minus1)?);

                // cprms_present_flag[0] is inferred to be 1.
                let cprms_present_flag = if i > 0 { r.read_bit()? } else { true };
                vps.cprms_present_flag.push(cprms_present_flag);

                vps.hrd_parameters.push(HrdParams::parse(
                    &mut r,
                    cprms_present_flag,
                    vps.max_sub_layers_minus1,
                )?);
            }
        }

        vps.extension_flag = r.read_bit()?;

        let id = usize::from(vps.video_parameter_set_id);
        let (vps, changed) = self.vps.put(id, vps)?;

        if changed {
            // SPSs parsed against the previous content are stale.
            let stale: Vec<usize> = self
                .sps
                .ids()
                .filter(|sps_id| {
                    self.sps
                        .get(*sps_id)
                        .is_some_and(|sps| usize::from(sps.video_parameter_set_id) == id)
                })
                .collect();

            for sps_id in stale {
                log::debug!("VPS {} changed, dropping SPS {}", id, sps_id);
                self.remove_sps(sps_id);
            }
        }

        Ok(vps)
    }

    /// Removes an SPS and the PPSs referring to it.
    fn remove_sps(&mut self, id: usize) {
        if self.sps.remove(id).is_none() {
            return;
        }

        let stale: Vec<usize> = self
            .pps
            .ids()
            .filter(|pps_id| {
                self.pps
                    .get(*pps_id)
                    .is_some_and(|pps| usize::from(pps.seq_parameter_set_id) == id)
            })
            .collect();

        for pps_id in stale {
            log::debug!("SPS {} changed, dropping PPS {}", id, pps_id);
            self.pps.remove(pps_id);
        }
    }

    /// Parse a SPS NALU.
    pub fn parse_sps(&mut self, nalu: &Nalu) -> Result<Rc<Sps>, ParseError> {
        check_nalu_type(nalu, NaluType::SpsNut)?;

        let rbsp = Rbsp::extract(nalu.payload())?;
        let mut r = BitReader::new(rbsp.data());

        let mut sps = Sps {
            video_parameter_set_id: r.read_bits(4)?,
            max_sub_layers_minus1: r.read_bits(3)?,
            temporal_id_nesting_flag: r.read_bit()?,
            ..Default::default()
        };

        if self.vps.get(usize::from(sps.video_parameter_set_id)).is_none() {
            return Err(anyhow!(
                "Broken stream: SPS references VPS {} that has not been successfully parsed",
                sps.video_parameter_set_id
            )
            .into());
        }

        if usize::from(sps.max_sub_layers_minus1) >= MAX_SUB_LAYERS {
            return Err(anyhow!(
                "Invalid sps_max_sub_layers_minus1 {}",
                sps.max_sub_layers_minus1
            )
            .into());
        }

        sps.profile_tier_level = ProfileTierLevel::parse(&mut r, sps.max_sub_layers_minus1)?;

        sps.seq_parameter_set_id = r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?;
        sps.chroma_format_idc = r.read_ue_max(3)?;

        if sps.chroma_format_idc == 3 {
            sps.separate_colour_plane_flag = r.read_bit()?;
        }

        sps.chroma_array_type = if sps.separate_colour_plane_flag {
            0
        } else {
            sps.chroma_format_idc
        };

        sps.pic_width_in_luma_samples = r.read_ue_bounded(1, 16888)?;
        sps.pic_height_in_luma_samples = r.read_ue_bounded(1, 16888)?;

        sps.conformance_window_flag = r.read_bit()?;
        if sps.conformance_window_flag {
            sps.conf_win_left_offset = r.read_ue()?;
            sps.conf_win_right_offset = r.read_ue()?;
            sps.conf_win_top_offset = r.read_ue()?;
            sps.conf_win_bottom_offset = r.read_ue()?;
        }

        sps.bit_depth_luma_minus8 = r.read_ue_max(8)?;
        sps.bit_depth_chroma_minus8 = r.read_ue_max(8)?;
        sps.log2_max_pic_order_cnt_lsb_minus4 = r.read_ue_max(12)?;
        sps.sub_layer_ordering_info_present_flag = r.read_bit()?;

        let max_sub_layer = usize::from(sps.max_sub_layers_minus1);
        let start = if sps.sub_layer_ordering_info_present_flag {
            0
        } else {
            max_sub_layer
        };

        for i in start..=max_sub_layer {
            sps.max_dec_pic_buffering_minus1[i] = r.read_ue_max(MAX_DPB_PICS - 1)?;
            sps.max_num_reorder_pics[i] =
                r.read_ue_max(u32::from(sps.max_dec_pic_buffering_minus1[i]))?;
            sps.max_latency_increase_plus1[i] = r.read_ue_max(u32::MAX - 1)?;
        }

        if !sps.sub_layer_ordering_info_present_flag {
            for i in 0..max_sub_layer {
                sps.max_dec_pic_buffering_minus1[i] = sps.max_dec_pic_buffering_minus1[max_sub_layer];
                sps.max_num_reorder_pics[i] = sps.max_num_reorder_pics[max_sub_layer];
                sps.max_latency_increase_plus1[i] = sps.max_latency_increase_plus1[max_sub_layer];
            }
        }

        sps.log2_min_luma_coding_block_size_minus3 = r.read_ue_max(3)?;
        sps.log2_diff_max_min_luma_coding_block_size = r.read_ue_max(3)?;
        sps.log2_min_luma_transform_block_size_minus2 = r.read_ue_max(3)?;
        sps.log2_diff_max_min_luma_transform_block_size = r.read_ue_max(3)?;

        // (7-10)
        sps.min_cb_log2_size_y = u32::from(sps.log2_min_luma_coding_block_size_minus3) + 3;
        // (7-11)
        sps.ctb_log2_size_y =
            sps.min_cb_log2_size_y + u32::from(sps.log2_diff_max_min_luma_coding_block_size);

        if !(4..=6).contains(&sps.ctb_log2_size_y) {
            return Err(anyhow!("Invalid CtbLog2SizeY {}", sps.ctb_log2_size_y).into());
        }

        let min_cb_size_y = 1u32 << sps.min_cb_log2_size_y;
        if u32::from(sps.pic_width_in_luma_samples) % min_cb_size_y != 0
            || u32::from(sps.pic_height_in_luma_samples) % min_cb_size_y != 0
        {
            return Err(anyhow!(
                "Invalid picture size {}x{}, not a multiple of MinCbSizeY {}",
                sps.pic_width_in_luma_samples,
                sps.pic_height_in_luma_samples,
                min_cb_size_y
            )
            .into());
        }

        // (7-12)
        sps.ctb_size_y = 1 << sps.ctb_log2_size_y;
        // (7-15)
        sps.pic_width_in_ctbs_y =
            u32::from(sps.pic_width_in_luma_samples).div_ceil(sps.ctb_size_y);
        // (7-17)
        sps.pic_height_in_ctbs_y =
            u32::from(sps.pic_height_in_luma_samples).div_ceil(sps.ctb_size_y);
        sps.pic_size_in_ctbs_y = sps.pic_width_in_ctbs_y * sps.pic_height_in_ctbs_y;

        let min_tb_log2_size_y = u32::from(sps.log2_min_luma_transform_block_size_minus2) + 2;
        sps.max_tb_log2_size_y =
            min_tb_log2_size_y + u32::from(sps.log2_diff_max_min_luma_transform_block_size);

        if min_tb_log2_size_y >= sps.min_cb_log2_size_y
            || sps.max_tb_log2_size_y > std::cmp::min(sps.ctb_log2_size_y, 5)
        {
            return Err(anyhow!(
                "Invalid transform block sizes: MinTbLog2SizeY {}, MaxTbLog2SizeY {}",
                min_tb_log2_size_y,
                sps.max_tb_log2_size_y
            )
            .into());
        }

        let max_depth = sps.ctb_log2_size_y - min_tb_log2_size_y;
        sps.max_transform_hierarchy_depth_inter = r.read_ue_max(max_depth)?;
        sps.max_transform_hierarchy_depth_intra = r.read_ue_max(max_depth)?;

        sps.scaling_list_enabled_flag = r.read_bit()?;
        if sps.scaling_list_enabled_flag {
            sps.scaling_list_data_present_flag = r.read_bit()?;
            if sps.scaling_list_data_present_flag {
                sps.scaling_list = ScalingLists::parse(&mut r)?;
            }
        }

        sps.amp_enabled_flag = r.read_bit()?;
        sps.sample_adaptive_offset_enabled_flag = r.read_bit()?;

        sps.pcm_enabled_flag = r.read_bit()?;
        if sps.pcm_enabled_flag {
            sps.pcm_sample_bit_depth_luma_minus1 = r.read_bits(4)?;
            sps.pcm_sample_bit_depth_chroma_minus1 = r.read_bits(4)?;

            if sps.pcm_sample_bit_depth_luma_minus1 + 1 > sps.bit_depth_luma()
                || sps.pcm_sample_bit_depth_chroma_minus1 + 1 > sps.bit_depth_chroma()
            {
                return Err(anyhow!("Invalid PCM bit depths").into());
            }

            sps.log2_min_pcm_luma_coding_block_size_minus3 = r.read_ue_max(2)?;
            sps.log2_diff_max_min_pcm_luma_coding_block_size = r.read_ue_max(2)?;
            sps.pcm_loop_filter_disabled_flag = r.read_bit()?;
        }

        sps.num_short_term_ref_pic_sets = r.read_ue_max(MAX_SHORT_TERM_REF_PIC_SETS)?;
        for i in 0..usize::from(sps.num_short_term_ref_pic_sets) {
            let rps = ShortTermRefPicSet::parse(&mut r, i, &sps.short_term_ref_pic_set, false)
                .with_context(|| format!("Broken stream: invalid st_ref_pic_set({})", i))?;
            sps.short_term_ref_pic_set.push(rps);
        }

        sps.long_term_ref_pics_present_flag = r.read_bit()?;
        if sps.long_term_ref_pics_present_flag {
            sps.num_long_term_ref_pics_sps = r.read_ue_max(MAX_LONG_TERM_REF_PICS_SPS)?;
            let lsb_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
            for i in 0..usize::from(sps.num_long_term_ref_pics_sps) {
                sps.lt_ref_pic_poc_lsb_sps[i] = r.read_bits(lsb_bits)?;
                sps.used_by_curr_pic_lt_sps_flag[i] = r.read_bit()?;
            }
        }

        sps.temporal_mvp_enabled_flag = r.read_bit()?;
        sps.strong_intra_smoothing_enabled_flag = r.read_bit()?;

        sps.vui_parameters_present_flag = r.read_bit()?;
        if sps.vui_parameters_present_flag {
            sps.vui_parameters = VuiParams::parse(&mut r, sps.max_sub_layers_minus1)?;
        }

        sps.extension_present_flag = r.read_bit()?;
        if sps.extension_present_flag {
            sps.range_extension_flag = r.read_bit()?;
            let multilayer_extension_flag = r.read_bit()?;
            let three_d_extension_flag = r.read_bit()?;
            sps.scc_extension_flag = r.read_bit()?;
            r.skip_bits(4)?; // sps_extension_4bits

            if multilayer_extension_flag || three_d_extension_flag {
                self.remove_sps(usize::from(sps.seq_parameter_set_id));
                return Err(ParseError::Unsupported(
                    "multilayer and 3D SPS extensions".into(),
                ));
            }

            if sps.range_extension_flag {
                sps.range_extension = SpsRangeExtension::parse(&mut r)?;
            }

            if sps.scc_extension_flag {
                sps.scc_extension = SpsSccExtension::parse(&mut r, &sps)?;
            }
        }

        let shift = if sps.range_extension.high_precision_offsets_enabled_flag {
            u32::from(sps.bit_depth_luma_minus8) + 7
        } else {
            7
        };
        sps.wp_offset_half_range_y = 1 << shift;

        let shift = if sps.range_extension.high_precision_offsets_enabled_flag {
            u32::from(sps.bit_depth_chroma_minus8) + 7
        } else {
            7
        };
        sps.wp_offset_half_range_c = 1 << shift;

        let id = usize::from(sps.seq_parameter_set_id);

        if let Err(reason) = sps.check_supported() {
            // Keep dependent PPSs and slices from using a stale set.
            self.remove_sps(id);
            return Err(ParseError::Unsupported(reason));
        }

        let (sps, changed) = self.sps.put(id, sps)?;
        if changed {
            let stale: Vec<usize> = self
                .pps
                .ids()
                .filter(|pps_id| {
                    self.pps
                        .get(*pps_id)
                        .is_some_and(|pps| usize::from(pps.seq_parameter_set_id) == id)
                })
                .collect();

            for pps_id in stale {
                log::debug!("SPS {} changed, dropping PPS {}", id, pps_id);
                self.pps.remove(pps_id);
            }
        }

        Ok(sps)
    }

    /// Computes the tile column widths and row heights. See 6.5.1.
    fn parse_tiles(r: &mut BitReader, pps: &mut Pps, sps: &Sps) -> anyhow::Result<()> {
        pps.num_tile_columns_minus1 =
            r.read_ue_max(std::cmp::min(MAX_TILE_COLUMNS, sps.pic_width_in_ctbs_y) - 1)?;
        pps.num_tile_rows_minus1 =
            r.read_ue_max(std::cmp::min(MAX_TILE_ROWS, sps.pic_height_in_ctbs_y) - 1)?;

        let num_columns = u32::from(pps.num_tile_columns_minus1) + 1;
        let num_rows = u32::from(pps.num_tile_rows_minus1) + 1;

        pps.uniform_spacing_flag = r.read_bit()?;
        if pps.uniform_spacing_flag {
            // (6-3) and (6-4)
            pps.column_width_minus1 = (0..num_columns)
                .map(|i| {
                    ((i + 1) * sps.pic_width_in_ctbs_y) / num_columns
                        - (i * sps.pic_width_in_ctbs_y) / num_columns
                        - 1
                })
                .collect();

            pps.row_height_minus1 = (0..num_rows)
                .map(|j| {
                    ((j + 1) * sps.pic_height_in_ctbs_y) / num_rows
                        - (j * sps.pic_height_in_ctbs_y) / num_rows
                        - 1
                })
                .collect();
        } else {
            let mut read_sizes = |total: u32, count: u32, what: &str| -> anyhow::Result<Vec<u32>> {
                let mut sizes = Vec::with_capacity(count as usize);
                let mut sum = 0u32;

                for _ in 0..count - 1 {
                    let size_minus1: u32 = r.read_ue_max(total - 1)?;
                    sum += size_minus1 + 1;
                    sizes.push(size_minus1);
                }

                if sum >= total {
                    return Err(anyhow!("Invalid tile {}s, {} CTBs exceed {}", what, sum, total));
                }

                // The last one takes what is left.
                sizes.push(total - sum - 1);
                Ok(sizes)
            };

            pps.column_width_minus1 = read_sizes(sps.pic_width_in_ctbs_y, num_columns, "column")?;
            pps.row_height_minus1 = read_sizes(sps.pic_height_in_ctbs_y, num_rows, "row")?;
        }

        pps.loop_filter_across_tiles_enabled_flag = r.read_bit()?;

        Ok(())
    }

    /// Parse a PPS NALU.
    pub fn parse_pps(&mut self, nalu: &Nalu) -> Result<Rc<Pps>, ParseError> {
        check_nalu_type(nalu, NaluType::PpsNut)?;

        let rbsp = Rbsp::extract(nalu.payload())?;
        let mut r = BitReader::new(rbsp.data());

        let mut pps = Pps {
            pic_parameter_set_id: r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?,
            seq_parameter_set_id: r.read_ue_max(MAX_SPS_COUNT as u32 - 1)?,
            loop_filter_across_tiles_enabled_flag: true,
            ..Default::default()
        };

        let sps = Rc::clone(
            self.sps
                .get(usize::from(pps.seq_parameter_set_id))
                .context("Broken stream: stream references a SPS that has not been successfully parsed")?,
        );

        pps.dependent_slice_segments_enabled_flag = r.read_bit()?;
        pps.output_flag_present_flag = r.read_bit()?;
        pps.num_extra_slice_header_bits = r.read_bits(3)?;
        pps.sign_data_hiding_enabled_flag = r.read_bit()?;
        pps.cabac_init_present_flag = r.read_bit()?;

        // 7.4.7.1
        pps.num_ref_idx_l0_default_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE as u32 - 1)?;
        pps.num_ref_idx_l1_default_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE as u32 - 1)?;

        // (7-5)
        let qp_bd_offset_y = 6 * i32::from(sps.bit_depth_luma_minus8);

        pps.init_qp_minus26 = r.read_se_bounded(-(26 + qp_bd_offset_y), 25)?;
        pps.qp_bd_offset_y = qp_bd_offset_y as u32;
        pps.constrained_intra_pred_flag = r.read_bit()?;
        pps.transform_skip_enabled_flag = r.read_bit()?;
        pps.cu_qp_delta_enabled_flag = r.read_bit()?;

        if pps.cu_qp_delta_enabled_flag {
            pps.diff_cu_qp_delta_depth =
                r.read_ue_max(u32::from(sps.log2_diff_max_min_luma_coding_block_size))?;
        }

        pps.cb_qp_offset = r.read_se_bounded(-12, 12)?;
        pps.cr_qp_offset = r.read_se_bounded(-12, 12)?;

        pps.slice_chroma_qp_offsets_present_flag = r.read_bit()?;
        pps.weighted_pred_flag = r.read_bit()?;
        pps.weighted_bipred_flag = r.read_bit()?;
        pps.transquant_bypass_enabled_flag = r.read_bit()?;
        pps.tiles_enabled_flag = r.read_bit()?;
        pps.entropy_coding_sync_enabled_flag = r.read_bit()?;

        if pps.tiles_enabled_flag {
            Self::parse_tiles(&mut r, &mut pps, &sps)?;
        }

        pps.loop_filter_across_slices_enabled_flag = r.read_bit()?;
        pps.deblocking_filter_control_present_flag = r.read_bit()?;

        if pps.deblocking_filter_control_present_flag {
            pps.deblocking_filter_override_enabled_flag = r.read_bit()?;
            pps.deblocking_filter_disabled_flag = r.read_bit()?;
            if !pps.deblocking_filter_disabled_flag {
                pps.beta_offset_div2 = r.read_se_bounded(-6, 6)?;
                pps.tc_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        pps.scaling_list_data_present_flag = r.read_bit()?;
        pps.scaling_list = if pps.scaling_list_data_present_flag {
            ScalingLists::parse(&mut r)?
        } else {
            sps.scaling_list.clone()
        };

        pps.lists_modification_present_flag = r.read_bit()?;
        pps.log2_parallel_merge_level_minus2 = r.read_ue_max(sps.ctb_log2_size_y - 2)?;
        pps.slice_segment_header_extension_present_flag = r.read_bit()?;

        pps.extension_present_flag = r.read_bit()?;
        if pps.extension_present_flag {
            pps.range_extension_flag = r.read_bit()?;
            let multilayer_extension_flag = r.read_bit()?;
            let three_d_extension_flag = r.read_bit()?;
            pps.scc_extension_flag = r.read_bit()?;
            r.skip_bits(4)?; // pps_extension_4bits

            if multilayer_extension_flag || three_d_extension_flag {
                return Err(ParseError::Unsupported(
                    "multilayer and 3D PPS extensions".into(),
                ));
            }

            if pps.range_extension_flag {
                pps.range_extension = PpsRangeExtension::parse(&mut r, &pps, &sps)?;
            }

            if pps.scc_extension_flag {
                pps.scc_extension = PpsSccExtension::parse(&mut r, &sps)?;
            }
        }

        pps.temporal_id = nalu.header.temporal_id();
        pps.sps = sps;

        let id = usize::from(pps.pic_parameter_set_id);
        let (pps, _) = self.pps.put(id, pps)?;

        Ok(pps)
    }

    /// Parses the syntax elements that dependent slice segments inherit from
    /// the previous independent slice segment.
    fn parse_independent_fields(
        r: &mut BitReader,
        hdr: &mut SliceHeader,
        nalu_type: NaluType,
        sps: &Sps,
        pps: &Pps,
    ) -> anyhow::Result<()> {
        r.skip_bits(usize::from(pps.num_extra_slice_header_bits))?;

        let slice_type: u32 = r.read_ue()?;
        hdr.type_ = SliceType::n(slice_type).ok_or(anyhow!("Invalid slice type {}", slice_type))?;

        if nalu_type.is_irap() && !hdr.type_.is_i() && !pps.scc_extension.curr_pic_ref_enabled_flag
        {
            return Err(anyhow!("IRAP picture with a {:?} slice", hdr.type_));
        }

        if pps.output_flag_present_flag {
            hdr.pic_output_flag = r.read_bit()?;
        }

        if sps.separate_colour_plane_flag {
            hdr.colour_plane_id = r.read_bits(2)?;
        }

        if !nalu_type.is_idr() {
            let lsb_bits = usize::from(sps.log2_max_pic_order_cnt_lsb_minus4) + 4;
            hdr.pic_order_cnt_lsb = r.read_bits(lsb_bits)?;

            hdr.short_term_ref_pic_set_sps_flag = r.read_bit()?;

            let num_sets = usize::from(sps.num_short_term_ref_pic_sets);
            if !hdr.short_term_ref_pic_set_sps_flag {
                let start = r.position();
                hdr.short_term_ref_pic_set =
                    ShortTermRefPicSet::parse(r, num_sets, &sps.short_term_ref_pic_set, true)
                        .context("Broken stream: invalid slice st_ref_pic_set()")?;
                hdr.st_rps_bits = (r.position() - start) as u32;
            } else {
                if num_sets == 0 {
                    return Err(anyhow!(
                        "short_term_ref_pic_set_sps_flag set without SPS sets"
                    ));
                }

                if num_sets > 1 {
                    let num_bits = ceil_log2(num_sets as u32);
                    hdr.short_term_ref_pic_set_idx = r.read_bits(num_bits)?;
                }

                hdr.short_term_ref_pic_set = sps
                    .short_term_ref_pic_set
                    .get(usize::from(hdr.short_term_ref_pic_set_idx))
                    .cloned()
                    .ok_or(anyhow!(
                        "Invalid short_term_ref_pic_set_idx {}",
                        hdr.short_term_ref_pic_set_idx
                    ))?;
            }

            if sps.long_term_ref_pics_present_flag {
                hdr.long_term_ref_pic_set = LongTermRefPicSet::parse(r, sps)
                    .context("Broken stream: invalid long-term references")?;
            }

            if sps.temporal_mvp_enabled_flag {
                hdr.temporal_mvp_enabled_flag = r.read_bit()?;
            }
        }

        if sps.sample_adaptive_offset_enabled_flag {
            hdr.sao_luma_flag = r.read_bit()?;
            if sps.chroma_array_type != 0 {
                hdr.sao_chroma_flag = r.read_bit()?;
            }
        }

        if hdr.type_.is_p() || hdr.type_.is_b() {
            hdr.num_ref_idx_active_override_flag = r.read_bit()?;
            if hdr.num_ref_idx_active_override_flag {
                hdr.num_ref_idx_l0_active_minus1 = r.read_ue_max(MAX_REF_IDX_ACTIVE as u32 - 1)?;
                if hdr.type_.is_b() {
                    hdr.num_ref_idx_l1_active_minus1 =
                        r.read_ue_max(MAX_REF_IDX_ACTIVE as u32 - 1)?;
                }
            }

            // (7-55)
            hdr.num_pic_total_curr = (hdr.short_term_ref_pic_set.num_used()
                + hdr.long_term_ref_pic_set.num_used()) as u32;
            if pps.scc_extension.curr_pic_ref_enabled_flag {
                hdr.num_pic_total_curr += 1;
            }

            if hdr.num_pic_total_curr == 0 {
                return Err(anyhow!("Inter slice without any reference picture"));
            }

            if pps.lists_modification_present_flag && hdr.num_pic_total_curr > 1 {
                hdr.ref_pic_list_modification = RefPicListModification::parse(r, hdr)?;
            }

            if hdr.type_.is_b() {
                hdr.mvd_l1_zero_flag = r.read_bit()?;
            }

            if pps.cabac_init_present_flag {
                hdr.cabac_init_flag = r.read_bit()?;
            }

            if hdr.temporal_mvp_enabled_flag {
                if hdr.type_.is_b() {
                    hdr.collocated_from_l0_flag = r.read_bit()?;
                }

                let max = if hdr.collocated_from_l0_flag {
                    hdr.num_ref_idx_l0_active_minus1
                } else {
                    hdr.num_ref_idx_l1_active_minus1
                };

                if max > 0 {
                    hdr.collocated_ref_idx = r.read_ue_max(u32::from(max))?;
                }
            }

            if (pps.weighted_pred_flag && hdr.type_.is_p())
                || (pps.weighted_bipred_flag && hdr.type_.is_b())
            {
                hdr.pred_weight_table = PredWeightTable::parse(r, hdr, sps)?;
            }

            hdr.five_minus_max_num_merge_cand = r.read_ue_max(4)?;

            if sps.scc_extension.motion_vector_resolution_control_idc == 2 {
                hdr.use_integer_mv_flag = r.read_bit()?;
            }
        }

        hdr.qp_delta = r.read_se_bounded(-87, 77)?;

        let slice_qp_y = 26 + i32::from(pps.init_qp_minus26) + i32::from(hdr.qp_delta);
        if slice_qp_y < -(pps.qp_bd_offset_y as i32) || slice_qp_y > 51 {
            return Err(anyhow!("Invalid slice_qp_delta: {}", hdr.qp_delta));
        }

        if pps.slice_chroma_qp_offsets_present_flag {
            hdr.cb_qp_offset = r.read_se_bounded(-12, 12)?;
            hdr.cr_qp_offset = r.read_se_bounded(-12, 12)?;

            for (name, pps_offset, slice_offset) in [
                ("slice_cb_qp_offset", pps.cb_qp_offset, hdr.cb_qp_offset),
                ("slice_cr_qp_offset", pps.cr_qp_offset, hdr.cr_qp_offset),
            ] {
                let qp_offset = i32::from(pps_offset) + i32::from(slice_offset);
                if !(-12..=12).contains(&qp_offset) {
                    return Err(anyhow!("Invalid value for {}: {}", name, slice_offset));
                }
            }
        }

        if pps.scc_extension.slice_act_qp_offsets_present_flag {
            hdr.slice_act_y_qp_offset = r.read_se_bounded(-12, 12)?;
            hdr.slice_act_cb_qp_offset = r.read_se_bounded(-12, 12)?;
            hdr.slice_act_cr_qp_offset = r.read_se_bounded(-12, 12)?;
        }

        if pps.range_extension.chroma_qp_offset_list_enabled_flag {
            hdr.cu_chroma_qp_offset_enabled_flag = r.read_bit()?;
        }

        if pps.deblocking_filter_override_enabled_flag {
            hdr.deblocking_filter_override_flag = r.read_bit()?;
        }

        if hdr.deblocking_filter_override_flag {
            hdr.deblocking_filter_disabled_flag = r.read_bit()?;
            if !hdr.deblocking_filter_disabled_flag {
                hdr.beta_offset_div2 = r.read_se_bounded(-6, 6)?;
                hdr.tc_offset_div2 = r.read_se_bounded(-6, 6)?;
            }
        }

        if pps.loop_filter_across_slices_enabled_flag
            && (hdr.sao_luma_flag || hdr.sao_chroma_flag || !hdr.deblocking_filter_disabled_flag)
        {
            hdr.loop_filter_across_slices_enabled_flag = r.read_bit()?;
        }

        Ok(())
    }

    /// Parses a slice header from a slice NALU.
    ///
    /// Dependent slice segments take most of their header from
    /// `prev_independent`, the header of the last independent slice segment
    /// of the same picture.
    pub fn parse_slice_header<'a>(
        &self,
        nalu: Nalu<'a>,
        prev_independent: Option<&SliceHeader>,
    ) -> Result<Slice<'a>, ParseError> {
        let nalu_type = nalu.header.type_();
        if !nalu_type.is_slice() {
            return Err(anyhow!("Invalid NALU type: {:?} is not a slice NALU", nalu_type).into());
        }

        let rbsp = Rbsp::extract(nalu.payload())?;
        let mut r = BitReader::new(rbsp.data());

        let mut hdr = SliceHeader {
            first_slice_segment_in_pic_flag: r.read_bit()?,
            ..Default::default()
        };

        if nalu_type.is_irap() {
            hdr.no_output_of_prior_pics_flag = r.read_bit()?;
        }

        hdr.pic_parameter_set_id = r.read_ue_max(MAX_PPS_COUNT as u32 - 1)?;

        let pps = Rc::clone(self.pps.get(usize::from(hdr.pic_parameter_set_id)).context(
            "Broken stream: slice references PPS that has not been successfully parsed.",
        )?);

        let sps = Rc::clone(&pps.sps);
        if !self
            .sps
            .get(usize::from(pps.seq_parameter_set_id))
            .is_some_and(|stored| Rc::ptr_eq(stored, &sps))
        {
            return Err(anyhow!(
                "Broken stream: slice's PPS references SPS that has not been successfully parsed."
            )
            .into());
        }

        if !hdr.first_slice_segment_in_pic_flag {
            if pps.dependent_slice_segments_enabled_flag {
                hdr.dependent_slice_segment_flag = r.read_bit()?;
            }

            let num_bits = ceil_log2(sps.pic_size_in_ctbs_y);
            hdr.segment_address = r.read_bits(num_bits)?;

            if hdr.segment_address >= sps.pic_size_in_ctbs_y {
                return Err(anyhow!("Invalid slice_segment_address {}", hdr.segment_address).into());
            }
        }

        if hdr.dependent_slice_segment_flag {
            let prev = prev_independent.context(
                "Broken stream: dependent slice segment without an independent one before it",
            )?;

            if prev.pic_parameter_set_id != hdr.pic_parameter_set_id {
                return Err(anyhow!(
                    "Broken stream: dependent slice segment uses PPS {}, its picture uses PPS {}",
                    hdr.pic_parameter_set_id,
                    prev.pic_parameter_set_id
                )
                .into());
            }

            hdr = SliceHeader {
                first_slice_segment_in_pic_flag: hdr.first_slice_segment_in_pic_flag,
                no_output_of_prior_pics_flag: hdr.no_output_of_prior_pics_flag,
                pic_parameter_set_id: hdr.pic_parameter_set_id,
                dependent_slice_segment_flag: true,
                segment_address: hdr.segment_address,
                ..prev.clone()
            };
        } else {
            hdr.set_defaults(&sps, &pps);
            Self::parse_independent_fields(&mut r, &mut hdr, nalu_type, &sps, &pps)?;
        }

        hdr.num_entry_point_offsets = 0;
        hdr.offset_len_minus1 = 0;
        hdr.entry_point_offset_minus1.clear();

        if pps.tiles_enabled_flag || pps.entropy_coding_sync_enabled_flag {
            let num_tiles = (u32::from(pps.num_tile_columns_minus1) + 1)
                * (u32::from(pps.num_tile_rows_minus1) + 1);

            let max = if !pps.tiles_enabled_flag {
                sps.pic_height_in_ctbs_y - 1
            } else if !pps.entropy_coding_sync_enabled_flag {
                num_tiles - 1
            } else {
                (u32::from(pps.num_tile_columns_minus1) + 1) * sps.pic_height_in_ctbs_y - 1
            };

            hdr.num_entry_point_offsets = r.read_ue_max(max)?;
            if hdr.num_entry_point_offsets > 0 {
                hdr.offset_len_minus1 = r.read_ue_max(31)?;
                let num_bits = usize::from(hdr.offset_len_minus1) + 1;
                for _ in 0..hdr.num_entry_point_offsets {
                    hdr.entry_point_offset_minus1.push(r.read_bits(num_bits)?);
                }
            }
        }

        if pps.slice_segment_header_extension_present_flag {
            let segment_header_extension_length: usize = r.read_ue_max(256)?;
            // slice_segment_header_extension_data_byte[i]
            r.skip_bits(8 * segment_header_extension_length)?;
        }

        // byte_alignment()
        if !r.read_bit()? {
            return Err(anyhow!("Broken stream: alignment_bit_equal_to_one is 0").into());
        }
        r.skip_to_byte_boundary()?;

        let header_bytes = (r.position() / 8) as usize;
        hdr.header_bit_size = r.position() as u32;
        hdr.data_offset = NaluHeader::LEN + rbsp.raw_offset(header_bytes);
        hdr.n_emulation_prevention_bytes = (hdr.data_offset - NaluHeader::LEN - header_bytes) as u32;

        Ok(Slice {
            header: hdr,
            nalu,
            pps,
        })
    }

    /// Returns a previously parsed vps given `vps_id`, if any.
    pub fn get_vps(&self, vps_id: u8) -> Option<&Rc<Vps>> {
        self.vps.get(usize::from(vps_id))
    }

    /// Returns a previously parsed sps given `sps_id`, if any.
    pub fn get_sps(&self, sps_id: u8) -> Option<&Rc<Sps>> {
        self.sps.get(usize::from(sps_id))
    }

    /// Returns a previously parsed pps given `pps_id`, if any.
    pub fn get_pps(&self, pps_id: u8) -> Option<&Rc<Pps>> {
        self.pps.get(usize::from(pps_id))
    }

    /// Forgets every parameter set.
    pub fn reset(&mut self) {
        self.vps.clear();
        self.sps.clear();
        self.pps.clear();
    }
}
