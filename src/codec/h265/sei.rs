// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Supplemental enhancement information. See 7.3.5 and Annex D.
//!
//! Only the messages that affect decoding or travel with the decoded picture
//! are decoded. Everything else is skipped over.

use anyhow::anyhow;

use crate::bitstream_utils::BitReader;
use crate::codec::h265::nalu::Nalu;
use crate::codec::h265::nalu::NaluType;
use crate::codec::h265::parser::ParseError;
use crate::codec::h265::rbsp::Rbsp;

const SEI_RECOVERY_POINT: u32 = 6;
const SEI_MASTERING_DISPLAY_COLOUR_VOLUME: u32 = 137;
const SEI_CONTENT_LIGHT_LEVEL_INFO: u32 = 144;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryPoint {
    pub recovery_poc_cnt: i32,
    pub exact_match_flag: bool,
    pub broken_link_flag: bool,
}

/// Chromaticities are in units of 0.00002, luminances in units of 0.0001
/// candelas per square metre.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MasteringDisplayColourVolume {
    pub display_primaries_x: [u16; 3],
    pub display_primaries_y: [u16; 3],
    pub white_point_x: u16,
    pub white_point_y: u16,
    pub max_display_mastering_luminance: u32,
    pub min_display_mastering_luminance: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ContentLightLevelInfo {
    pub max_content_light_level: u16,
    pub max_pic_average_light_level: u16,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SeiMessage {
    RecoveryPoint(RecoveryPoint),
    MasteringDisplayColourVolume(MasteringDisplayColourVolume),
    ContentLightLevelInfo(ContentLightLevelInfo),
    /// A message that is not decoded.
    Skipped { payload_type: u32, payload_size: usize },
}

/// HDR metadata attached to the pictures of a coded video sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HdrMetadata {
    pub mastering_display: Option<MasteringDisplayColourVolume>,
    pub content_light_level: Option<ContentLightLevelInfo>,
}

impl HdrMetadata {
    /// Records the HDR messages among `messages`.
    pub fn update(&mut self, messages: &[SeiMessage]) {
        for message in messages {
            match message {
                SeiMessage::MasteringDisplayColourVolume(mdcv) => {
                    self.mastering_display = Some(mdcv.clone())
                }
                SeiMessage::ContentLightLevelInfo(cll) => {
                    self.content_light_level = Some(cll.clone())
                }
                _ => (),
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mastering_display.is_none() && self.content_light_level.is_none()
    }
}

/// Reads payloadType or payloadSize: a run of 0xff bytes followed by a last
/// byte, all added together.
fn read_ff_coded(data: &[u8], offset: &mut usize, name: &str) -> anyhow::Result<u32> {
    let mut value = 0u32;

    loop {
        let byte = *data
            .get(*offset)
            .ok_or_else(|| anyhow!("Broken stream: SEI {} is truncated", name))?;
        *offset += 1;

        value = value
            .checked_add(u32::from(byte))
            .ok_or_else(|| anyhow!("Broken stream: SEI {} overflows", name))?;

        if byte != 0xff {
            return Ok(value);
        }
    }
}

/// Whether `rest` only holds rbsp_trailing_bits().
fn is_trailing_bits(rest: &[u8]) -> bool {
    match rest.split_first() {
        None => true,
        Some((first, rest)) => *first == 0x80 && rest.iter().all(|b| *b == 0),
    }
}

fn parse_recovery_point(r: &mut BitReader) -> anyhow::Result<RecoveryPoint> {
    Ok(RecoveryPoint {
        recovery_poc_cnt: r.read_se()?,
        exact_match_flag: r.read_bit()?,
        broken_link_flag: r.read_bit()?,
    })
}

fn parse_mastering_display(r: &mut BitReader) -> anyhow::Result<MasteringDisplayColourVolume> {
    let mut mdcv = MasteringDisplayColourVolume::default();

    for c in 0..3 {
        mdcv.display_primaries_x[c] = r.read_bits(16)?;
        mdcv.display_primaries_y[c] = r.read_bits(16)?;
    }

    mdcv.white_point_x = r.read_bits(16)?;
    mdcv.white_point_y = r.read_bits(16)?;
    mdcv.max_display_mastering_luminance = r.read_bits(32)?;
    mdcv.min_display_mastering_luminance = r.read_bits(32)?;

    if mdcv.min_display_mastering_luminance >= mdcv.max_display_mastering_luminance {
        log::warn!(
            "Mastering display luminance range [{}, {}] is empty",
            mdcv.min_display_mastering_luminance,
            mdcv.max_display_mastering_luminance
        );
    }

    Ok(mdcv)
}

fn parse_content_light_level(r: &mut BitReader) -> anyhow::Result<ContentLightLevelInfo> {
    Ok(ContentLightLevelInfo {
        max_content_light_level: r.read_bits(16)?,
        max_pic_average_light_level: r.read_bits(16)?,
    })
}

/// Parses the sei_message()s of a prefix or suffix SEI NAL unit.
pub fn parse_sei(nalu: &Nalu) -> Result<Vec<SeiMessage>, ParseError> {
    let prefix = match nalu.header.type_() {
        NaluType::PrefixSeiNut => true,
        NaluType::SuffixSeiNut => false,
        other => {
            return Err(ParseError::Stream(anyhow!(
                "Invalid NALU type, expected an SEI, got {:?}",
                other
            )))
        }
    };

    let rbsp = Rbsp::extract(nalu.payload())?;
    let data = rbsp.data();
    let mut messages = vec![];
    let mut offset = 0;

    while !is_trailing_bits(&data[offset..]) {
        let payload_type = read_ff_coded(data, &mut offset, "payloadType")?;
        let payload_size = read_ff_coded(data, &mut offset, "payloadSize")? as usize;

        let payload = data.get(offset..offset + payload_size).ok_or_else(|| {
            anyhow!(
                "Broken stream: SEI payload {} of {} bytes, only {} left",
                payload_type,
                payload_size,
                data.len() - offset
            )
        })?;
        offset += payload_size;

        let mut r = BitReader::new(payload);
        let message = match payload_type {
            SEI_RECOVERY_POINT if prefix => {
                SeiMessage::RecoveryPoint(parse_recovery_point(&mut r)?)
            }
            SEI_MASTERING_DISPLAY_COLOUR_VOLUME if prefix => {
                SeiMessage::MasteringDisplayColourVolume(parse_mastering_display(&mut r)?)
            }
            SEI_CONTENT_LIGHT_LEVEL_INFO if prefix => {
                SeiMessage::ContentLightLevelInfo(parse_content_light_level(&mut r)?)
            }
            _ => {
                log::trace!(
                    "Skipping SEI payload {} ({} bytes)",
                    payload_type,
                    payload_size
                );
                SeiMessage::Skipped {
                    payload_type,
                    payload_size,
                }
            }
        };

        messages.push(message);
    }

    Ok(messages)
}
