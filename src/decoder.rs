// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The decoder front end.
//!
//! A [`CodecParser`] turns access units into [`PictureTask`]s: fully parsed
//! syntax together with the frame buffer slots of the current picture and of
//! its references. Frame buffers belong to a [`SlotPool`], and tasks are
//! executed by whatever sits behind a [`TaskSink`]; neither is implemented
//! here besides the [`dummy`] ones used for testing.

pub mod dummy;
pub mod h265;

use std::rc::Rc;

use anyhow::anyhow;
use thiserror::Error;

use crate::codec::h265::dpb::DpbError;
use crate::codec::h265::frame_splitter::FrameSplitError;
use crate::codec::h265::nalu::NaluError;
use crate::codec::h265::parser::ParseError;
use crate::codec::h265::parser::Pps;
use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::rbsp::RbspError;
use crate::codec::h265::sei::HdrMetadata;

/// Error returned by the [`CodecParser`] methods.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Malformed syntax. Only the current NAL unit is lost, and the picture
    /// it belongs to is flagged as broken.
    #[error(transparent)]
    StreamError(anyhow::Error),
    /// Valid syntax this decoder does not support.
    #[error("unsupported stream: {0}")]
    ProtocolError(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    /// The decoder state cannot be trusted anymore.
    #[error(transparent)]
    DecoderError(anyhow::Error),
}

impl DecodeError {
    /// Whether the decoder must be reset before it can be used again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::OutOfMemory(_) | Self::DecoderError(_))
    }
}

pub type DecodeResult<T> = Result<T, DecodeError>;

impl From<ParseError> for DecodeError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Stream(err) => Self::StreamError(err),
            ParseError::Unsupported(msg) => Self::ProtocolError(msg),
            ParseError::Rbsp(err) => err.into(),
        }
    }
}

impl From<RbspError> for DecodeError {
    fn from(err: RbspError) -> Self {
        Self::OutOfMemory(err.to_string())
    }
}

impl From<NaluError> for DecodeError {
    fn from(err: NaluError) -> Self {
        Self::StreamError(err.into())
    }
}

impl From<FrameSplitError> for DecodeError {
    fn from(err: FrameSplitError) -> Self {
        match err {
            FrameSplitError::OutOfMemory(_) => Self::OutOfMemory(err.to_string()),
            FrameSplitError::InvalidEnd { .. } => Self::DecoderError(err.into()),
        }
    }
}

impl From<DpbError> for DecodeError {
    fn from(err: DpbError) -> Self {
        match err {
            DpbError::TooManyRefs | DpbError::CurrentPictureReferenced(_) => {
                Self::StreamError(err.into())
            }
            DpbError::Full | DpbError::DuplicatePoc(_) | DpbError::StaleIndex(_) => {
                Self::DecoderError(err.into())
            }
        }
    }
}

/// How much of the parsed syntax is dumped with `log::trace!`. Each level
/// includes the previous ones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceLevel {
    #[default]
    Off,
    /// Parameter sets and SEI messages.
    Headers,
    /// Slice segment headers and reference picture lists.
    Slices,
    /// DPB state after every picture.
    Dpb,
}

#[derive(Clone, Debug, Default)]
pub struct DecoderConfig {
    pub trace_level: TraceLevel,
    /// Input does not come one access unit at a time and must go through the
    /// frame splitter.
    pub need_split: bool,
    /// Fail on missing references instead of generating them, and keep RASL
    /// pictures that cannot be decoded.
    pub disable_error_recovery: bool,
    /// Out of band parameter sets, either as an hvcC record or as an Annex B
    /// byte stream.
    pub extradata: Option<Vec<u8>>,
}

/// Run-time changes to the [`DecoderConfig`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCmd {
    SetTraceLevel(TraceLevel),
    SetNeedSplit(bool),
    SetDisableErrorRecovery(bool),
    SetExtradata(Vec<u8>),
}

/// Identifies a frame buffer of a [`SlotPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotProperty {
    Poc(i32),
    /// The content of the slot is known to be wrong.
    ErrorInfo(bool),
    /// Width and height after cropping.
    VisibleSize(u32, u32),
    HdrMetadata(HdrMetadata),
}

/// The frame buffers pictures are decoded into.
pub trait SlotPool {
    fn allocate_slot(&mut self) -> DecodeResult<SlotId>;
    fn set_property(&mut self, slot: SlotId, property: SlotProperty);
    /// Hands `slot` to the display path, in output order.
    fn enqueue_for_display(&mut self, slot: SlotId);
}

/// A reference picture of a [`PictureTask`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefSlot {
    pub slot: SlotId,
    pub poc: i32,
    pub long_term: bool,
}

#[derive(Clone, Debug)]
pub struct SliceTask {
    pub header: SliceHeader,
    /// The whole NAL unit, emulation prevention bytes included. The slice
    /// data starts at `header.data_offset`.
    pub nalu: Vec<u8>,
    /// RefPicList0 and RefPicList1.
    pub ref_pic_lists: [Vec<RefSlot>; 2],
}

/// Everything needed to decode one picture.
#[derive(Clone, Debug)]
pub struct PictureTask {
    pub slot: SlotId,
    pub poc: i32,
    pub sps: Rc<Sps>,
    pub pps: Rc<Pps>,
    /// RefPicSetStCurrBefore, RefPicSetStCurrAfter and RefPicSetLtCurr.
    pub st_curr_before: Vec<RefSlot>,
    pub st_curr_after: Vec<RefSlot>,
    pub lt_curr: Vec<RefSlot>,
    pub slices: Vec<SliceTask>,
    /// Part of the picture could not be parsed.
    pub error: bool,
    pub hdr: HdrMetadata,
}

/// Executes picture tasks, typically by programming the hardware.
pub trait TaskSink {
    fn submit(&mut self, task: PictureTask) -> DecodeResult<()>;
}

/// Completion status of a submitted task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskReport {
    pub slot: SlotId,
    pub error: bool,
}

/// Result of [`CodecParser::prepare`].
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Prepared {
    /// Number of input bytes consumed. The rest must be passed again.
    pub consumed: usize,
    pub access_unit: Option<Vec<u8>>,
}

/// A codec specific front end.
pub trait CodecParser {
    /// Applies `config`, including its extradata.
    fn init(&mut self, config: DecoderConfig) -> DecodeResult<()>;

    /// Releases all the state, parameter sets included.
    fn deinit(&mut self);

    /// Assembles access units out of `input`. Passing an empty `input`
    /// returns whatever is still buffered.
    fn prepare(&mut self, input: &[u8]) -> DecodeResult<Prepared>;

    /// Parses one access unit, submitting its picture and enqueuing the
    /// pictures that are ready for display.
    fn parse(&mut self, access_unit: &[u8]) -> DecodeResult<()>;

    /// Drops pictures and buffered input, keeping the parameter sets. Used
    /// when seeking.
    fn reset(&mut self);

    /// Enqueues every pending picture for display.
    fn flush(&mut self) -> DecodeResult<()>;

    fn control(&mut self, cmd: ControlCmd) -> DecodeResult<()>;

    /// Reports the completion of a task submitted earlier.
    fn callback(&mut self, report: TaskReport);
}

pub(crate) fn stream_error(msg: String) -> DecodeError {
    DecodeError::StreamError(anyhow!(msg))
}
