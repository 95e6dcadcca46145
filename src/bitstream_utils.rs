// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::fmt;
use std::io::Cursor;
use std::io::Write;

use bytes::Buf;
use thiserror::Error;

/// A bit reader over RBSP data, i.e. data that has already gone through
/// emulation-prevention removal. Reading past the end of the buffer is an
/// error, never undefined behavior.
#[derive(Clone)]
pub struct BitReader<'a> {
    /// A reference into the next unread byte in the stream.
    data: Cursor<&'a [u8]>,
    /// Contents of the current byte. First unread bit starting at position 8 -
    /// num_remaining_bits_in_curr_bytes.
    curr_byte: u32,
    /// Number of bits remaining in `curr_byte`
    num_remaining_bits_in_curr_byte: usize,
    /// How many bits have been read so far.
    position: u64,
}

#[derive(Debug, Error)]
pub enum GetByteError {
    #[error("reader ran out of bits")]
    OutOfBits,
}

#[derive(Debug, Error)]
pub enum ReadBitsError {
    #[error("more than 32 ({0}) bits were requested")]
    TooManyBitsRequested(usize),
    #[error("failed to advance the current byte")]
    GetByte(#[from] GetByteError),
    #[error("failed to convert read input to target type")]
    ConversionFailed,
    #[error("exp-golomb prefix longer than 31 bits")]
    InvalidExpGolomb,
    #[error("value {value} out of bounds, expected {min} - {max}")]
    OutOfBounds { value: i64, min: i64, max: i64 },
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data: Cursor::new(data),
            curr_byte: Default::default(),
            num_remaining_bits_in_curr_byte: Default::default(),
            position: 0,
        }
    }

    /// Read a single bit from the stream.
    pub fn read_bit(&mut self) -> Result<bool, ReadBitsError> {
        let bit = self.read_bits::<u32>(1)?;
        Ok(bit == 1)
    }

    /// Read up to 32 bits from the stream.
    pub fn read_bits<U: TryFrom<u32>>(&mut self, num_bits: usize) -> Result<U, ReadBitsError> {
        if num_bits > 32 {
            return Err(ReadBitsError::TooManyBitsRequested(num_bits));
        }

        let mut bits_left = num_bits;
        let mut out = 0u64;

        while self.num_remaining_bits_in_curr_byte < bits_left {
            out |= u64::from(self.curr_byte) << (bits_left - self.num_remaining_bits_in_curr_byte);
            bits_left -= self.num_remaining_bits_in_curr_byte;
            self.update_curr_byte()?;
        }

        out |= u64::from(self.curr_byte >> (self.num_remaining_bits_in_curr_byte - bits_left));
        out &= (1u64 << num_bits) - 1;
        self.num_remaining_bits_in_curr_byte -= bits_left;
        self.position += num_bits as u64;

        let out = u32::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)?;
        U::try_from(out).map_err(|_| ReadBitsError::ConversionFailed)
    }

    /// Skip `num_bits` bits from the stream.
    pub fn skip_bits(&mut self, mut num_bits: usize) -> Result<(), ReadBitsError> {
        while num_bits > 0 {
            let n = std::cmp::min(num_bits, 32);
            self.read_bits::<u32>(n)?;
            num_bits -= n;
        }

        Ok(())
    }

    /// Returns the amount of bits left in the stream
    pub fn num_bits_left(&self) -> usize {
        self.data.remaining() * 8 + self.num_remaining_bits_in_curr_byte
    }

    /// Returns the number of bits consumed so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether the next read starts on a byte boundary.
    pub fn is_aligned(&self) -> bool {
        self.num_remaining_bits_in_curr_byte == 0
    }

    /// Skips the remaining bits of the current byte, if any.
    pub fn skip_to_byte_boundary(&mut self) -> Result<(), ReadBitsError> {
        self.skip_bits(self.num_remaining_bits_in_curr_byte)
    }

    /// Whether the stream still has RBSP data. Implements more_rbsp_data().
    pub fn has_more_rsbp_data(&mut self) -> bool {
        if self.num_remaining_bits_in_curr_byte == 0 && self.update_curr_byte().is_err() {
            // no more data at all in the rbsp
            return false;
        }

        // If the next bit is the stop bit, then we should only see unset bits
        // until the end of the data.
        if (self.curr_byte & ((1 << (self.num_remaining_bits_in_curr_byte - 1)) - 1)) != 0 {
            return true;
        }

        self.data.chunk().iter().any(|&b| b != 0)
    }

    /// Reads an unsigned Exp-Golomb coded number, i.e. ue(v). See 9.2.
    pub fn read_ue<U: TryFrom<u32>>(&mut self) -> Result<U, ReadBitsError> {
        let mut num_bits = 0;

        while self.read_bits::<u32>(1)? == 0 {
            num_bits += 1;
            if num_bits > 31 {
                return Err(ReadBitsError::InvalidExpGolomb);
            }
        }

        let suffix = u64::from(self.read_bits::<u32>(num_bits)?);
        let value = ((1u64 << num_bits) - 1) + suffix;
        let value = u32::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)?;

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_ue_bounded<U: TryFrom<u32>>(
        &mut self,
        min: u32,
        max: u32,
    ) -> Result<U, ReadBitsError> {
        let ue: u32 = self.read_ue()?;
        if ue > max || ue < min {
            Err(ReadBitsError::OutOfBounds {
                value: i64::from(ue),
                min: i64::from(min),
                max: i64::from(max),
            })
        } else {
            U::try_from(ue).map_err(|_| ReadBitsError::ConversionFailed)
        }
    }

    pub fn read_ue_max<U: TryFrom<u32>>(&mut self, max: u32) -> Result<U, ReadBitsError> {
        self.read_ue_bounded(0, max)
    }

    /// Reads a signed Exp-Golomb coded number, i.e. se(v). Odd codes map to
    /// positive values and even codes to negative ones. See 9.2.2.
    pub fn read_se<U: TryFrom<i32>>(&mut self) -> Result<U, ReadBitsError> {
        let ue = i64::from(self.read_ue::<u32>()?);

        let value = if ue % 2 == 0 { -(ue / 2) } else { ue / 2 + 1 };
        let value = i32::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)?;

        U::try_from(value).map_err(|_| ReadBitsError::ConversionFailed)
    }

    pub fn read_se_bounded<U: TryFrom<i32>>(
        &mut self,
        min: i32,
        max: i32,
    ) -> Result<U, ReadBitsError> {
        let se: i32 = self.read_se()?;
        if se < min || se > max {
            Err(ReadBitsError::OutOfBounds {
                value: i64::from(se),
                min: i64::from(min),
                max: i64::from(max),
            })
        } else {
            U::try_from(se).map_err(|_| ReadBitsError::ConversionFailed)
        }
    }

    fn get_byte(&mut self) -> Result<u8, GetByteError> {
        if !self.data.has_remaining() {
            return Err(GetByteError::OutOfBits);
        }

        Ok(self.data.get_u8())
    }

    fn update_curr_byte(&mut self) -> Result<(), GetByteError> {
        let byte = self.get_byte()?;

        self.num_remaining_bits_in_curr_byte = 8;
        self.curr_byte = u32::from(byte);
        Ok(())
    }
}

#[derive(Debug)]
pub enum BitWriterError {
    InvalidBitCount,
    Io(std::io::Error),
}

impl fmt::Display for BitWriterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BitWriterError::InvalidBitCount => write!(f, "invalid bit count"),
            BitWriterError::Io(x) => write!(f, "{}", x),
        }
    }
}

impl std::error::Error for BitWriterError {}

impl From<std::io::Error> for BitWriterError {
    fn from(err: std::io::Error) -> Self {
        BitWriterError::Io(err)
    }
}

pub type BitWriterResult<T> = std::result::Result<T, BitWriterError>;

pub struct BitWriter<W: Write> {
    out: W,
    nth_bit: u8,
    curr_byte: u8,
}

impl<W: Write> BitWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            out: writer,
            curr_byte: 0,
            nth_bit: 0,
        }
    }

    /// Writes fixed bit size integer (up to 32 bit)
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> BitWriterResult<usize> {
        let value = value.into();

        if bits > 32 {
            return Err(BitWriterError::InvalidBitCount);
        }

        let mut written = 0;
        for bit in (0..bits).rev() {
            let bit = 1u32 << bit;

            self.write_bit((value & bit) == bit)?;
            written += 1;
        }

        Ok(written)
    }

    /// Takes a single bit that will be outputed to [`std::io::Write`]
    pub fn write_bit(&mut self, bit: bool) -> BitWriterResult<()> {
        self.curr_byte |= (bit as u8) << (7u8 - self.nth_bit);
        self.nth_bit += 1;

        if self.nth_bit == 8 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        Ok(())
    }

    /// Immediately outputs any cached bits to [`std::io::Write`]
    pub fn flush(&mut self) -> BitWriterResult<()> {
        if self.nth_bit != 0 {
            self.out.write_all(&[self.curr_byte])?;
            self.nth_bit = 0;
            self.curr_byte = 0;
        }

        self.out.flush()?;
        Ok(())
    }

    /// Returns `true` if ['Self`] hold data that wasn't written to [`std::io::Write`]
    pub fn has_data_pending(&self) -> bool {
        self.nth_bit != 0
    }

    pub(crate) fn inner_mut(&mut self) -> &mut W {
        &mut self.out
    }
}

impl<W: Write> Drop for BitWriter<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush bits {e:?}");
        }
    }
}

/// Wrapper over [`std::io::Write`] inserting emulation prevention bytes
/// after every `00 00` pair followed by a byte lower or equal to 3.
pub struct EmulationPrevention<W: Write> {
    out: W,
    prev_bytes: [Option<u8>; 2],
    ep_enabled: bool,
}

impl<W: Write> EmulationPrevention<W> {
    fn new(writer: W, ep_enabled: bool) -> Self {
        Self {
            out: writer,
            prev_bytes: [None; 2],
            ep_enabled,
        }
    }

    fn write_byte(&mut self, curr_byte: u8) -> std::io::Result<()> {
        if self.prev_bytes[1] == Some(0x00) && self.prev_bytes[0] == Some(0x00) && curr_byte <= 0x03
        {
            self.out.write_all(&[0x00, 0x00, 0x03])?;
            // The current byte may start the next escaped pattern.
            self.prev_bytes = [Some(curr_byte), None];
        } else {
            if let Some(byte) = self.prev_bytes[1] {
                self.out.write_all(&[byte])?;
            }

            self.prev_bytes[1] = self.prev_bytes[0];
            self.prev_bytes[0] = Some(curr_byte);
        }

        Ok(())
    }

    /// Writes an Annex-B start code followed by a H.265 NAL unit header.
    fn write_header(
        &mut self,
        nal_unit_type: u8,
        nuh_layer_id: u8,
        temporal_id_plus1: u8,
    ) -> std::io::Result<()> {
        self.out.write_all(&[
            0x00,
            0x00,
            0x00,
            0x01,
            (nal_unit_type & 0x3f) << 1 | (nuh_layer_id >> 5) & 0x1,
            (nuh_layer_id & 0x1f) << 3 | (temporal_id_plus1 & 0x7),
        ])
    }
}

impl<W: Write> Write for EmulationPrevention<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if !self.ep_enabled {
            self.out.write_all(buf)?;
            return Ok(buf.len());
        }

        for byte in buf {
            self.write_byte(*byte)?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(byte) = self.prev_bytes[1].take() {
            self.out.write_all(&[byte])?;
        }

        if let Some(byte) = self.prev_bytes[0].take() {
            self.out.write_all(&[byte])?;
        }

        self.out.flush()
    }
}

impl<W: Write> Drop for EmulationPrevention<W> {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("Unable to flush pending bytes {e:?}");
        }
    }
}

#[derive(Error, Debug)]
pub enum NaluWriterError {
    #[error("value increment caused value overflow")]
    Overflow,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    BitWriterError(#[from] BitWriterError),
}

pub type NaluWriterResult<T> = std::result::Result<T, NaluWriterError>;

/// A writer for H.265 NAL units, capable of emitting emulation prevention
/// bytes. Used to synthesize bitstreams.
pub struct NaluWriter<W: Write>(BitWriter<EmulationPrevention<W>>);

impl<W: Write> NaluWriter<W> {
    pub fn new(writer: W, ep_enabled: bool) -> Self {
        Self(BitWriter::new(EmulationPrevention::new(writer, ep_enabled)))
    }

    /// Writes fixed bit size integer (up to 32 bit), i.e. `u(n)`.
    pub fn write_f<T: Into<u32>>(&mut self, bits: usize, value: T) -> NaluWriterResult<usize> {
        self.0
            .write_f(bits, value)
            .map_err(NaluWriterError::BitWriterError)
    }

    pub fn write_flag(&mut self, value: bool) -> NaluWriterResult<()> {
        self.write_f(1, value)?;
        Ok(())
    }

    /// Writes a number in exponential golomb format.
    fn write_exp_golomb(&mut self, value: u32) -> NaluWriterResult<()> {
        let value = value.checked_add(1).ok_or(NaluWriterError::Overflow)?;
        let bits = 32 - value.leading_zeros() as usize;
        let zeros = bits - 1;

        self.write_f(zeros, 0u32)?;
        self.write_f(bits, value)?;

        Ok(())
    }

    /// Writes an unsigned integer in exponential golomb format, i.e. `ue(v)`.
    pub fn write_ue<T: Into<u32>>(&mut self, value: T) -> NaluWriterResult<()> {
        self.write_exp_golomb(value.into())
    }

    /// Writes a signed integer in exponential golomb format, i.e. `se(v)`.
    pub fn write_se<T: Into<i32>>(&mut self, value: T) -> NaluWriterResult<()> {
        let value: i32 = value.into();
        let abs_value: u32 = value.unsigned_abs();

        if value <= 0 {
            self.write_ue(2 * abs_value)
        } else {
            self.write_ue(2 * abs_value - 1)
        }
    }

    /// Writes a start code and the two byte NAL unit header.
    pub fn write_header(
        &mut self,
        nal_unit_type: u8,
        nuh_layer_id: u8,
        temporal_id_plus1: u8,
    ) -> NaluWriterResult<()> {
        self.0.flush()?;
        self.0.inner_mut().flush()?;
        self.0
            .inner_mut()
            .write_header(nal_unit_type, nuh_layer_id, temporal_id_plus1)?;
        Ok(())
    }

    /// Writes rbsp_trailing_bits(): the stop bit and alignment zero bits.
    pub fn write_trailing_bits(&mut self) -> NaluWriterResult<()> {
        self.write_flag(true)?;
        while self.0.has_data_pending() {
            self.write_flag(false)?;
        }

        Ok(())
    }

    /// Returns `true` if next bits will be aligned to 8
    pub fn aligned(&self) -> bool {
        !self.0.has_data_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_stream_without_trailing_zero_bytes() {
        const RBSP: [u8; 6] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xa0];

        let mut reader = BitReader::new(&RBSP);
        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 47);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0x02);
        assert_eq!(reader.num_bits_left(), 39);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(31).unwrap(), 0x23456789);
        assert_eq!(reader.num_bits_left(), 8);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 1);
        assert_eq!(reader.num_bits_left(), 7);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(1).unwrap(), 0);
        assert_eq!(reader.num_bits_left(), 6);
        assert!(!reader.has_more_rsbp_data());
        assert_eq!(reader.position(), 42);
    }

    #[test]
    fn single_byte_stream() {
        const RBSP: [u8; 1] = [0x18];

        let mut reader = BitReader::new(&RBSP);
        assert_eq!(reader.num_bits_left(), 8);
        assert!(reader.has_more_rsbp_data());
        assert_eq!(reader.read_bits::<u32>(4).unwrap(), 1);
        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn stop_bit_occupy_full_byte() {
        const RBSP: [u8; 2] = [0xab, 0x80];

        let mut reader = BitReader::new(&RBSP);
        assert_eq!(reader.num_bits_left(), 16);
        assert!(reader.has_more_rsbp_data());

        assert_eq!(reader.read_bits::<u32>(8).unwrap(), 0xab);
        assert_eq!(reader.num_bits_left(), 8);

        assert!(!reader.has_more_rsbp_data());
    }

    #[test]
    fn read_full_32_bits() {
        let mut reader = BitReader::new(&[0xde, 0xad, 0xbe, 0xef, 0x80]);
        assert_eq!(reader.read_bits::<u32>(32).unwrap(), 0xdeadbeef);
        assert!(matches!(
            reader.read_bits::<u32>(33),
            Err(ReadBitsError::TooManyBitsRequested(33))
        ));
    }

    #[test]
    fn overrun_is_an_error() {
        let mut reader = BitReader::new(&[0xff]);
        reader.skip_bits(6).unwrap();
        assert!(matches!(
            reader.read_bits::<u32>(3),
            Err(ReadBitsError::GetByte(GetByteError::OutOfBits))
        ));

        let mut reader = BitReader::new(&[]);
        assert!(reader.read_bit().is_err());
        assert!(!reader.has_more_rsbp_data());
    }

    // Check that read_ue behaves properly with input at the limits.
    #[test]
    fn read_ue() {
        // Regular value.
        let mut reader = BitReader::new(&[0b0001_1010]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 12);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 1);

        // 0 value.
        let mut reader = BitReader::new(&[0b1000_0000]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 7);

        // No prefix stop bit.
        let mut reader = BitReader::new(&[0b0000_0000]);
        reader.read_ue::<u32>().unwrap_err();

        // u32 max value: 31 0-bits, 1 bit marker, 31 bits 1-bits.
        let mut reader = BitReader::new(&[
            0b0000_0000,
            0b0000_0000,
            0b0000_0000,
            0b0000_0001,
            0b1111_1111,
            0b1111_1111,
            0b1111_1111,
            0b1111_1110,
        ]);
        assert_eq!(reader.read_ue::<u32>().unwrap(), 0xffff_fffe);
        assert_eq!(reader.num_remaining_bits_in_curr_byte, 1);

        // 32 zero bits is not a valid prefix.
        let mut reader = BitReader::new(&[0, 0, 0, 0, 0x80]);
        assert!(matches!(
            reader.read_ue::<u32>(),
            Err(ReadBitsError::InvalidExpGolomb)
        ));
    }

    #[test]
    fn bounded_reads() {
        let mut reader = BitReader::new(&[0b0001_1010]);
        assert!(matches!(
            reader.read_ue_max::<u32>(11),
            Err(ReadBitsError::OutOfBounds { value: 12, .. })
        ));

        // se(v) of 0b00111 is codeNum 6, i.e. -3.
        let mut reader = BitReader::new(&[0b0011_1000]);
        assert!(reader.read_se_bounded::<i32>(-2, 2).is_err());
    }

    #[test]
    fn exp_golomb_round_trip() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, false);
            for n in 0..=(1u32 << 20) {
                writer.write_ue(n).unwrap();
            }
            writer.write_trailing_bits().unwrap();
        }

        let mut reader = BitReader::new(&buf);
        for n in 0..=(1u32 << 20) {
            assert_eq!(reader.read_ue::<u32>().unwrap(), n);
        }
        assert!(!reader.has_more_rsbp_data());

        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, false);
            for n in -(1i32 << 19)..=(1i32 << 19) {
                writer.write_se(n).unwrap();
            }
            writer.write_trailing_bits().unwrap();
        }

        let mut reader = BitReader::new(&buf);
        for n in -(1i32 << 19)..=(1i32 << 19) {
            assert_eq!(reader.read_se::<i32>().unwrap(), n);
        }
    }

    #[test]
    fn simple_first_few_ue() {
        fn single_ue(value: u32) -> Vec<u8> {
            let mut buf = Vec::<u8>::new();
            {
                let mut writer = NaluWriter::new(&mut buf, false);
                writer.write_ue(value).unwrap();
            }
            buf
        }

        assert_eq!(single_ue(0), vec![0b10000000u8]);
        assert_eq!(single_ue(1), vec![0b01000000u8]);
        assert_eq!(single_ue(2), vec![0b01100000u8]);
        assert_eq!(single_ue(3), vec![0b00100000u8]);
        assert_eq!(single_ue(7), vec![0b00010000u8]);
        assert_eq!(single_ue(9), vec![0b00010100u8]);
    }

    #[test]
    fn writer_emulation_prevention() {
        fn test(input: &[u8], bitstream: &[u8]) {
            let mut buf = Vec::<u8>::new();
            {
                let mut writer = NaluWriter::new(&mut buf, true);
                for byte in input {
                    writer.write_f(8, *byte).unwrap();
                }
            }
            assert_eq!(buf, bitstream);
        }

        test(&[0x00, 0x00, 0x00], &[0x00, 0x00, 0x03, 0x00]);
        test(&[0x00, 0x00, 0x01], &[0x00, 0x00, 0x03, 0x01]);
        test(&[0x00, 0x00, 0x03], &[0x00, 0x00, 0x03, 0x03]);
        test(&[0x00, 0x00, 0x04], &[0x00, 0x00, 0x04]);
        test(&[0x00, 0x00, 0x00, 0x00], &[0x00, 0x00, 0x03, 0x00, 0x00]);
        test(
            &[0x00, 0x00, 0x00, 0x00, 0x00],
            &[0x00, 0x00, 0x03, 0x00, 0x00, 0x03, 0x00],
        );
    }

    #[test]
    fn writer_header() {
        let mut buf = Vec::<u8>::new();
        {
            let mut writer = NaluWriter::new(&mut buf, true);
            // SPS_NUT, layer 0, temporal id 0.
            writer.write_header(33, 0, 1).unwrap();
            writer.write_f(8, 0xffu8).unwrap();
        }
        assert_eq!(buf, vec![0x00, 0x00, 0x00, 0x01, 0x42, 0x01, 0xff]);
    }
}
