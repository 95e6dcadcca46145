// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! NAL unit headers and the splitting of access units into NAL units, for
//! both Annex B byte streams and length-prefixed ("NALFF", hvcC-style)
//! streams.

use std::io::Cursor;

use byteorder::BigEndian;
use byteorder::ReadBytesExt;
use enumn::N;
use thiserror::Error;

/// Table 7-1 – NAL unit type codes and NAL unit type classes
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum NaluType {
    #[default]
    TrailN = 0,
    TrailR = 1,
    TsaN = 2,
    TsaR = 3,
    StsaN = 4,
    StsaR = 5,
    RadlN = 6,
    RadlR = 7,
    RaslN = 8,
    RaslR = 9,
    RsvVclN10 = 10,
    RsvVclR11 = 11,
    RsvVclN12 = 12,
    RsvVclR13 = 13,
    RsvVclN14 = 14,
    RsvVclR15 = 15,
    BlaWLp = 16,
    BlaWRadl = 17,
    BlaNLp = 18,
    IdrWRadl = 19,
    IdrNLp = 20,
    CraNut = 21,
    RsvIrapVcl22 = 22,
    RsvIrapVcl23 = 23,
    RsvVcl24 = 24,
    RsvVcl25 = 25,
    RsvVcl26 = 26,
    RsvVcl27 = 27,
    RsvVcl28 = 28,
    RsvVcl29 = 29,
    RsvVcl30 = 30,
    RsvVcl31 = 31,
    VpsNut = 32,
    SpsNut = 33,
    PpsNut = 34,
    AudNut = 35,
    EosNut = 36,
    EobNut = 37,
    FdNut = 38,
    PrefixSeiNut = 39,
    SuffixSeiNut = 40,
    RsvNvcl41 = 41,
    RsvNvcl42 = 42,
    RsvNvcl43 = 43,
    RsvNvcl44 = 44,
    RsvNvcl45 = 45,
    RsvNvcl46 = 46,
    RsvNvcl47 = 47,
    Unspec48 = 48,
    Unspec49 = 49,
    Unspec50 = 50,
    Unspec51 = 51,
    Unspec52 = 52,
    Unspec53 = 53,
    Unspec54 = 54,
    Unspec55 = 55,
    Unspec56 = 56,
    Unspec57 = 57,
    Unspec58 = 58,
    Unspec59 = 59,
    Unspec60 = 60,
    Unspec61 = 61,
    Unspec62 = 62,
    Unspec63 = 63,
}

impl NaluType {
    /// Whether this is an IDR NALU.
    pub fn is_idr(&self) -> bool {
        matches!(self, Self::IdrWRadl | Self::IdrNLp)
    }

    /// Whether this is an IRAP NALU.
    pub fn is_irap(&self) -> bool {
        let type_ = *self as u32;
        type_ >= Self::BlaWLp as u32 && type_ <= Self::RsvIrapVcl23 as u32
    }

    /// Whether this is a BLA NALU.
    pub fn is_bla(&self) -> bool {
        let type_ = *self as u32;
        type_ >= Self::BlaWLp as u32 && type_ <= Self::BlaNLp as u32
    }

    /// Whether this is a CRA NALU.
    pub fn is_cra(&self) -> bool {
        matches!(self, Self::CraNut)
    }

    /// Whether this is a RADL NALU.
    pub fn is_radl(&self) -> bool {
        matches!(self, Self::RadlN | Self::RadlR)
    }

    /// Whether this is a RASL NALU.
    pub fn is_rasl(&self) -> bool {
        matches!(self, Self::RaslN | Self::RaslR)
    }

    /// Whether this NALU carries a slice segment we know how to decode.
    pub fn is_slice(&self) -> bool {
        let type_ = *self as u32;
        type_ <= Self::RaslR as u32
            || (type_ >= Self::BlaWLp as u32 && type_ <= Self::CraNut as u32)
    }

    /// Whether this is a VCL NALU, including the reserved ranges.
    pub fn is_vcl(&self) -> bool {
        (*self as u32) < Self::VpsNut as u32
    }

    /// Whether a picture of this type can be used to update the POC of the
    /// previous TemporalId 0 picture. See 8.3.1.
    pub fn updates_prev_tid0_pic(&self) -> bool {
        !matches!(
            self,
            Self::TrailN
                | Self::TsaN
                | Self::StsaN
                | Self::RadlN
                | Self::RadlR
                | Self::RaslN
                | Self::RaslR
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NaluError {
    #[error("NAL unit of {0} bytes is shorter than its header")]
    TooShort(usize),
    #[error("forbidden_zero_bit is set")]
    ForbiddenBit,
    #[error("nuh_temporal_id_plus1 is 0")]
    InvalidTemporalId,
    #[error("length prefixed NAL unit needs {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("invalid NAL length field size {0}")]
    InvalidLengthSize(u8),
}

/// The two byte header of every NAL unit. See 7.3.1.2.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NaluHeader {
    /// The NALU type.
    type_: NaluType,
    /// Specifies the identifier of the layer to which a VCL NAL unit belongs or
    /// the identifier of a layer to which a non-VCL NAL unit applies.
    nuh_layer_id: u8,
    /// Minus 1 specifies a temporal identifier for the NAL unit. The value of
    /// nuh_temporal_id_plus1 shall not be equal to 0.
    nuh_temporal_id_plus1: u8,
}

impl NaluHeader {
    pub const LEN: usize = 2;

    pub fn new(type_: NaluType, nuh_layer_id: u8, nuh_temporal_id_plus1: u8) -> Self {
        Self {
            type_,
            nuh_layer_id,
            nuh_temporal_id_plus1,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, NaluError> {
        let (b0, b1) = match data {
            [b0, b1, ..] => (*b0, *b1),
            _ => return Err(NaluError::TooShort(data.len())),
        };

        if b0 & 0x80 != 0 {
            return Err(NaluError::ForbiddenBit);
        }

        let nuh_temporal_id_plus1 = b1 & 0x7;
        if nuh_temporal_id_plus1 == 0 {
            return Err(NaluError::InvalidTemporalId);
        }

        // Six bits can only produce valid values.
        let type_ = NaluType::n((b0 >> 1) & 0x3f).unwrap_or_default();

        Ok(Self {
            type_,
            nuh_layer_id: ((b0 & 0x1) << 5) | (b1 >> 3),
            nuh_temporal_id_plus1,
        })
    }

    pub fn type_(&self) -> NaluType {
        self.type_
    }

    pub fn layer_id(&self) -> u8 {
        self.nuh_layer_id
    }

    pub fn temporal_id(&self) -> u8 {
        self.nuh_temporal_id_plus1 - 1
    }

    pub fn temporal_id_plus1(&self) -> u8 {
        self.nuh_temporal_id_plus1
    }
}

/// A NAL unit borrowed from the access unit it was found in.
#[derive(Clone, Debug)]
pub struct Nalu<'a> {
    pub header: NaluHeader,
    /// The whole NAL unit, header included, emulation prevention bytes
    /// still in place.
    data: &'a [u8],
    /// Offset of the NAL header in the access unit.
    offset: usize,
}

impl<'a> Nalu<'a> {
    pub fn new(data: &'a [u8], offset: usize) -> Result<Self, NaluError> {
        Ok(Self {
            header: NaluHeader::parse(data)?,
            data,
            offset,
        })
    }

    /// The payload following the NAL header.
    pub fn payload(&self) -> &'a [u8] {
        &self.data[NaluHeader::LEN..]
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> AsRef<[u8]> for Nalu<'a> {
    fn as_ref(&self) -> &[u8] {
        self.data
    }
}

/// How NAL units are delimited inside an access unit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NalFraming {
    /// `00 00 01` start codes.
    #[default]
    AnnexB,
    /// Big-endian length fields of 1 to 4 bytes, as signalled by hvcC.
    LengthPrefixed(u8),
}

/// Walks a buffer and yields its NAL units in order.
///
/// A NAL unit with a broken header is reported as an error and skipped; a
/// truncated length-prefixed unit ends the iteration.
pub struct NalSplitter<'a> {
    data: &'a [u8],
    pos: usize,
    framing: NalFraming,
}

impl<'a> NalSplitter<'a> {
    pub fn new(data: &'a [u8], framing: NalFraming) -> Self {
        Self {
            data,
            pos: 0,
            framing,
        }
    }

    fn find_start_code(data: &[u8], offset: usize) -> Option<usize> {
        data.get(offset..)?
            .windows(3)
            .position(|window| window == [0x00, 0x00, 0x01])
            .map(|pos| pos + offset)
    }

    fn next_annex_b(&mut self) -> Option<Result<Nalu<'a>, NaluError>> {
        let sc = Self::find_start_code(self.data, self.pos)?;
        let nalu_offset = sc + 3;

        let mut end = Self::find_start_code(self.data, nalu_offset).unwrap_or(self.data.len());
        self.pos = end;

        // Discard trailing_zero_8bits, as well as the leading zero of a
        // four byte start code.
        while end > nalu_offset && self.data[end - 1] == 0x00 {
            end -= 1;
        }

        Some(Nalu::new(&self.data[nalu_offset..end], nalu_offset))
    }

    fn next_length_prefixed(&mut self, length_size: u8) -> Option<Result<Nalu<'a>, NaluError>> {
        if self.pos >= self.data.len() {
            return None;
        }

        if !(1..=4).contains(&length_size) {
            self.pos = self.data.len();
            return Some(Err(NaluError::InvalidLengthSize(length_size)));
        }

        let length_size = usize::from(length_size);
        let mut cursor = Cursor::new(&self.data[self.pos..]);
        let size = match cursor.read_uint::<BigEndian>(length_size) {
            Ok(size) => size as usize,
            Err(_) => {
                let available = self.data.len() - self.pos;
                self.pos = self.data.len();
                return Some(Err(NaluError::Truncated {
                    needed: length_size,
                    available,
                }));
            }
        };

        let nalu_offset = self.pos + length_size;
        let available = self.data.len() - nalu_offset;
        if size > available {
            self.pos = self.data.len();
            return Some(Err(NaluError::Truncated {
                needed: size,
                available,
            }));
        }

        self.pos = nalu_offset + size;
        Some(Nalu::new(&self.data[nalu_offset..self.pos], nalu_offset))
    }
}

impl<'a> Iterator for NalSplitter<'a> {
    type Item = Result<Nalu<'a>, NaluError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.framing {
            NalFraming::AnnexB => self.next_annex_b(),
            NalFraming::LengthPrefixed(length_size) => self.next_length_prefixed(length_size),
        }
    }
}
