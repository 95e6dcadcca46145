// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::io::Cursor;
use std::rc::Rc;

use anyhow::Context;
use byteorder::BigEndian;
use byteorder::ReadBytesExt;

use crate::codec::h265::dpb::Dpb;
use crate::codec::h265::dpb::DpbIndex;
use crate::codec::h265::dpb::RefPicSet;
use crate::codec::h265::dpb::RpsCategory;
use crate::codec::h265::dpb::RpsEntry;
use crate::codec::h265::frame_splitter::FrameSplitter;
use crate::codec::h265::nalu::NalFraming;
use crate::codec::h265::nalu::NalSplitter;
use crate::codec::h265::nalu::Nalu;
use crate::codec::h265::nalu::NaluType;
use crate::codec::h265::parser::Parser;
use crate::codec::h265::parser::Slice;
use crate::codec::h265::parser::SliceHeader;
use crate::codec::h265::parser::Sps;
use crate::codec::h265::picture::PictureData;
use crate::codec::h265::sei::parse_sei;
use crate::codec::h265::sei::HdrMetadata;
use crate::codec::h265::sei::SeiMessage;
use crate::decoder::stream_error;
use crate::decoder::CodecParser;
use crate::decoder::ControlCmd;
use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::DecoderConfig;
use crate::decoder::PictureTask;
use crate::decoder::Prepared;
use crate::decoder::RefSlot;
use crate::decoder::SliceTask;
use crate::decoder::SlotId;
use crate::decoder::SlotPool;
use crate::decoder::SlotProperty;
use crate::decoder::TaskReport;
use crate::decoder::TaskSink;
use crate::decoder::TraceLevel;

/// Offset of lengthSizeMinusOne in an hvcC record.
const HVCC_LENGTH_SIZE_OFFSET: u64 = 21;
/// Size of the fixed part of an hvcC record.
const HVCC_HEADER_LEN: usize = 23;

/// The picture whose slices are being parsed.
struct CurrentPicture {
    pic: PictureData,
    rps: RefPicSet,
    task: PictureTask,
}

/// H.265 front end: parses access units, manages the DPB and hands one
/// [`PictureTask`] per picture to `S`.
pub struct H265Parser<P: SlotPool, S: TaskSink> {
    config: DecoderConfig,
    framing: NalFraming,
    splitter: FrameSplitter,
    parser: Parser,
    dpb: Dpb<SlotId>,
    pool: P,
    sink: S,

    /// The SPS of the last picture.
    active_sps: Option<Rc<Sps>>,
    /// PicOrderCntVal of prevTid0Pic.
    prev_tid0_poc: i32,
    /// Set at the start of the bitstream and after an end of sequence.
    first_picture_in_sequence: bool,
    /// NoRaslOutputFlag of the last IRAP picture.
    irap_no_rasl_output_flag: bool,
    last_independent_slice_header: Option<SliceHeader>,
    current: Option<CurrentPicture>,
    /// The slices of the current picture are dropped.
    skipping: bool,
    hdr: HdrMetadata,
}

fn ref_slot(dpb: &Dpb<SlotId>, index: DpbIndex) -> DecodeResult<RefSlot> {
    let entry = dpb.get(index)?;

    Ok(RefSlot {
        slot: dpb.slot(index)?,
        poc: entry.poc,
        long_term: entry.is_long_term(),
    })
}

fn ref_slots(dpb: &Dpb<SlotId>, indices: &[DpbIndex]) -> DecodeResult<Vec<RefSlot>> {
    indices.iter().map(|index| ref_slot(dpb, *index)).collect()
}

fn hvcc_error(err: std::io::Error) -> DecodeError {
    DecodeError::StreamError(anyhow::Error::new(err).context("Truncated hvcC record"))
}

impl<P: SlotPool, S: TaskSink> H265Parser<P, S> {
    pub fn new(pool: P, sink: S) -> Self {
        Self {
            config: Default::default(),
            framing: NalFraming::AnnexB,
            splitter: FrameSplitter::new(),
            parser: Default::default(),
            dpb: Dpb::new(),
            pool,
            sink,
            active_sps: None,
            prev_tid0_poc: 0,
            first_picture_in_sequence: true,
            irap_no_rasl_output_flag: false,
            last_independent_slice_header: None,
            current: None,
            skipping: false,
            hdr: Default::default(),
        }
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn dpb(&self) -> &Dpb<SlotId> {
        &self.dpb
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn pool(&self) -> &P {
        &self.pool
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn tracing(&self, level: TraceLevel) -> bool {
        self.config.trace_level >= level
    }

    /// Parses out of band parameter sets.
    fn parse_extradata(&mut self, data: &[u8]) -> DecodeResult<()> {
        if data.len() >= HVCC_HEADER_LEN && data[0] == 1 {
            self.parse_hvcc(data)
        } else {
            log::debug!("Parsing {} bytes of Annex B extradata", data.len());
            self.framing = NalFraming::AnnexB;
            self.parse(data)
        }
    }

    /// Parses an HEVCDecoderConfigurationRecord and switches to length
    /// prefixed input.
    fn parse_hvcc(&mut self, data: &[u8]) -> DecodeResult<()> {
        let mut cursor = Cursor::new(data);
        cursor.set_position(HVCC_LENGTH_SIZE_OFFSET);

        let length_size = (cursor.read_u8().map_err(hvcc_error)? & 0x3) + 1;
        let num_arrays = cursor.read_u8().map_err(hvcc_error)?;

        for _ in 0..num_arrays {
            // array_completeness, reserved and NAL_unit_type.
            let nalu_type = cursor.read_u8().map_err(hvcc_error)? & 0x3f;
            let num_nalus = cursor.read_u16::<BigEndian>().map_err(hvcc_error)?;

            for _ in 0..num_nalus {
                let len = usize::from(cursor.read_u16::<BigEndian>().map_err(hvcc_error)?);
                let start = cursor.position() as usize;
                let data = data.get(start..start + len).ok_or_else(|| {
                    stream_error(format!(
                        "hvcC NAL unit of {} bytes at {} overflows the record",
                        len, start
                    ))
                })?;
                cursor.set_position((start + len) as u64);

                let nalu = Nalu::new(data, start)?;
                log::debug!(
                    "hvcC array of type {} holds {:?}",
                    nalu_type,
                    nalu.header.type_()
                );
                match nalu.header.type_() {
                    NaluType::VpsNut
                    | NaluType::SpsNut
                    | NaluType::PpsNut
                    | NaluType::PrefixSeiNut
                    | NaluType::SuffixSeiNut => self.process_nalu(nalu)?,
                    other => log::warn!("Ignoring {:?} NAL unit in hvcC", other),
                }
            }
        }

        log::debug!("Using {} byte NAL unit lengths", length_size);
        self.framing = NalFraming::LengthPrefixed(length_size);

        Ok(())
    }

    fn process_nalu(&mut self, nalu: Nalu) -> DecodeResult<()> {
        log::debug!(
            "Processing NALU {:?}, length is {}",
            nalu.header.type_(),
            nalu.size()
        );

        if nalu.header.layer_id() > 0 {
            log::debug!("Skipping NALU of layer {}", nalu.header.layer_id());
            return Ok(());
        }

        match nalu.header.type_() {
            NaluType::VpsNut => {
                let vps = self.parser.parse_vps(&nalu)?;
                if self.tracing(TraceLevel::Headers) {
                    log::trace!("{:#?}", vps);
                }
            }
            NaluType::SpsNut => {
                let sps = self.parser.parse_sps(&nalu)?;
                if self.tracing(TraceLevel::Headers) {
                    log::trace!("{:#?}", sps);
                }
            }
            NaluType::PpsNut => {
                let pps = self.parser.parse_pps(&nalu)?;
                if self.tracing(TraceLevel::Headers) {
                    log::trace!("{:#?}", pps);
                }
            }
            NaluType::PrefixSeiNut | NaluType::SuffixSeiNut => {
                let messages = parse_sei(&nalu)?;
                if self.tracing(TraceLevel::Headers) {
                    log::trace!("{:#?}", messages);
                }

                for message in &messages {
                    if let SeiMessage::RecoveryPoint(rp) = message {
                        log::debug!("Recovery point in {} pictures", rp.recovery_poc_cnt);
                    }
                }

                self.hdr.update(&messages);
                if let Some(cur) = self.current.as_mut() {
                    cur.task.hdr = self.hdr.clone();
                }
            }
            NaluType::EosNut | NaluType::EobNut => {
                self.finish_picture()?;
                self.dpb.next_sequence();
                self.first_picture_in_sequence = true;
            }
            nalu_type if nalu_type.is_slice() => self.handle_slice(nalu)?,
            other => log::debug!("Ignoring NALU {:?}", other),
        }

        Ok(())
    }

    fn handle_slice(&mut self, nalu: Nalu) -> DecodeResult<()> {
        let slice = self
            .parser
            .parse_slice_header(nalu, self.last_independent_slice_header.as_ref())?;

        if !slice.header.dependent_slice_segment_flag {
            self.last_independent_slice_header = Some(slice.header.clone());
        }

        if slice.header.first_slice_segment_in_pic_flag {
            self.finish_picture()?;
            self.begin_picture(&slice)?;
        }

        if self.skipping {
            return Ok(());
        }

        let cur = self
            .current
            .as_mut()
            .context("Broken stream: slice segment without a first slice segment")
            .map_err(DecodeError::StreamError)?;

        let lists = cur
            .rps
            .ref_pic_lists(&slice.header)
            .map_err(|err| DecodeError::StreamError(err.into()))?;

        let mut ref_pic_lists: [Vec<RefSlot>; 2] = Default::default();
        for (dst, src) in ref_pic_lists.iter_mut().zip(lists.iter()) {
            *dst = ref_slots(&self.dpb, src)?;
        }

        if self.config.trace_level >= TraceLevel::Slices {
            log::trace!("{:#?}", slice.header);
            log::trace!("RefPicLists {:?}", ref_pic_lists);
        }

        cur.task.slices.push(SliceTask {
            header: slice.header,
            nalu: slice.nalu.as_ref().to_vec(),
            ref_pic_lists,
        });

        Ok(())
    }

    /// Called once per picture, on its first slice segment.
    fn begin_picture(&mut self, slice: &Slice) -> DecodeResult<()> {
        // Until proven otherwise.
        self.skipping = true;

        let sps = Rc::clone(&slice.pps.sps);
        let sps_changed = !self
            .active_sps
            .as_ref()
            .is_some_and(|active| Rc::ptr_eq(active, &sps));
        if sps_changed {
            log::debug!("Activating SPS {}", sps.seq_parameter_set_id);
            self.dpb.next_sequence();
            self.active_sps = Some(Rc::clone(&sps));
        }

        let max_poc_lsb = sps.max_pic_order_cnt_lsb();
        let pic = PictureData::new_from_slice(
            slice,
            self.first_picture_in_sequence,
            self.irap_no_rasl_output_flag,
            self.prev_tid0_poc,
            max_poc_lsb,
        );
        self.first_picture_in_sequence = false;
        let poc = pic.pic_order_cnt_val;

        if pic.is_irap() {
            self.irap_no_rasl_output_flag = pic.no_rasl_output_flag;
            // The pictures preceding this one are not referenced anymore and
            // are output before it.
            if pic.no_rasl_output_flag && !sps_changed {
                self.dpb.next_sequence();
            }
        } else if pic.nalu_type.is_rasl()
            && self.irap_no_rasl_output_flag
            && !self.config.disable_error_recovery
        {
            log::warn!(
                "Dropping RASL picture POC {}, its references are not in the bitstream",
                poc
            );
            return Ok(());
        }

        log::debug!("Decode picture POC {}", poc);

        let mut lt = slice.header.long_term_ref_pic_set.clone();
        lt.derive_pocs(poc, slice.header.pic_order_cnt_lsb, max_poc_lsb)
            .map_err(DecodeError::StreamError)?;
        let refs = RpsEntry::from_rps(
            poc,
            &slice.header.short_term_ref_pic_set,
            &lt,
            max_poc_lsb,
        );

        let slot = self.pool.allocate_slot()?;
        self.pool.set_property(slot, SlotProperty::Poc(poc));
        let (width, height) = sps.visible_size();
        self.pool.set_property(slot, SlotProperty::VisibleSize(width, height));
        if !self.hdr.is_empty() {
            self.pool.set_property(slot, SlotProperty::HdrMetadata(self.hdr.clone()));
        }

        let index = self.dpb.add_frame(poc, slot, pic.pic_output_flag)?;

        let recovery = !self.config.disable_error_recovery;
        let pool = &mut self.pool;
        let recovery_slot = |entry: &RpsEntry| -> DecodeResult<Option<SlotId>> {
            if !recovery {
                if entry.category.is_curr() {
                    return Err(stream_error(format!(
                        "Missing reference POC {} ({:?})",
                        entry.poc, entry.category
                    )));
                }

                log::debug!("Ignoring missing reference POC {}", entry.poc);
                return Ok(None);
            }

            let slot = pool.allocate_slot()?;
            pool.set_property(slot, SlotProperty::Poc(entry.poc));
            pool.set_property(slot, SlotProperty::ErrorInfo(true));
            Ok(Some(slot))
        };
        let rps_result = self.dpb.frame_rps(index, &refs, recovery_slot);

        let mut rps_error = None;
        let rps = match rps_result {
            Ok(rps) => rps,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                self.dpb.mark_error(slot);
                rps_error = Some(err);
                RefPicSet::default()
            }
        };

        if pic.no_output_of_prior_pics_flag {
            log::debug!("Discarding the output of the pictures before POC {}", poc);
            self.dpb.discard_prior_output(poc);
        }
        self.dpb.bump_frame(sps.max_dec_pic_buffering() as usize, poc);
        self.output_pictures(false, sps.num_reorder_pics() as usize);

        if pic.valid_for_prev_tid0_pic {
            self.prev_tid0_poc = poc;
        }

        let task = PictureTask {
            slot,
            poc,
            sps,
            pps: Rc::clone(&slice.pps),
            st_curr_before: ref_slots(&self.dpb, rps.get(RpsCategory::StCurrBefore))?,
            st_curr_after: ref_slots(&self.dpb, rps.get(RpsCategory::StCurrAfter))?,
            lt_curr: ref_slots(&self.dpb, rps.get(RpsCategory::LtCurr))?,
            slices: Vec::new(),
            error: rps_error.is_some(),
            hdr: self.hdr.clone(),
        };

        self.current = Some(CurrentPicture { pic, rps, task });
        self.skipping = false;

        match rps_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Submits the current picture, if any.
    fn finish_picture(&mut self) -> DecodeResult<()> {
        let Some(cur) = self.current.take() else {
            return Ok(());
        };

        log::debug!(
            "Finishing picture POC {}, {} slice segments",
            cur.pic.pic_order_cnt_val,
            cur.task.slices.len()
        );

        if cur.task.error {
            self.pool.set_property(cur.task.slot, SlotProperty::ErrorInfo(true));
        }

        if self.tracing(TraceLevel::Dpb) {
            log::trace!("{:#?}", self.dpb);
        }

        self.sink.submit(cur.task)
    }

    /// Enqueues the pictures the DPB lets go.
    fn output_pictures(&mut self, flush: bool, max_num_reorder: usize) {
        while let Some(frame) = self.dpb.output_frame(flush, max_num_reorder) {
            if frame.error_flag {
                self.pool.set_property(frame.slot, SlotProperty::ErrorInfo(true));
            }

            self.pool.enqueue_for_display(frame.slot);
        }
    }

    fn mark_current_error(&mut self) {
        if let Some(cur) = self.current.as_mut() {
            cur.task.error = true;
            self.dpb.mark_error(cur.task.slot);
        }
    }
}

impl<P: SlotPool, S: TaskSink> CodecParser for H265Parser<P, S> {
    fn init(&mut self, config: DecoderConfig) -> DecodeResult<()> {
        self.config = config;

        if let Some(extradata) = self.config.extradata.take() {
            let result = self.parse_extradata(&extradata);
            self.config.extradata = Some(extradata);
            result?;
        }

        Ok(())
    }

    fn deinit(&mut self) {
        self.reset();
        self.parser.reset();
        self.config = Default::default();
        self.framing = NalFraming::AnnexB;
        self.hdr = Default::default();
    }

    fn prepare(&mut self, input: &[u8]) -> DecodeResult<Prepared> {
        // Length prefixed input always comes in access units.
        if !self.config.need_split || self.framing != NalFraming::AnnexB {
            return Ok(Prepared {
                consumed: input.len(),
                access_unit: (!input.is_empty()).then(|| input.to_vec()),
            });
        }

        let (consumed, access_unit) = self.splitter.split(input)?;
        Ok(Prepared {
            consumed,
            access_unit,
        })
    }

    fn parse(&mut self, access_unit: &[u8]) -> DecodeResult<()> {
        let mut first_error = None;

        for nalu in NalSplitter::new(access_unit, self.framing) {
            let result = nalu
                .map_err(DecodeError::from)
                .and_then(|nalu| self.process_nalu(nalu));

            if let Err(err) = result {
                if err.is_fatal() {
                    log::error!("Fatal error: {:#}", err);
                    self.current = None;
                    return Err(err);
                }

                log::error!("Discarding NALU: {:#}", err);
                self.mark_current_error();
                first_error.get_or_insert(err);
            }
        }

        self.finish_picture()?;

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reset(&mut self) {
        log::debug!("Resetting the H.265 parser");
        self.current = None;
        self.dpb.clear();
        self.splitter.reset();
        self.active_sps = None;
        self.prev_tid0_poc = 0;
        self.first_picture_in_sequence = true;
        self.irap_no_rasl_output_flag = false;
        self.last_independent_slice_header = None;
        self.skipping = false;
    }

    fn flush(&mut self) -> DecodeResult<()> {
        log::debug!("Flushing the H.265 parser");
        self.finish_picture()?;
        self.output_pictures(true, 0);
        Ok(())
    }

    fn control(&mut self, cmd: ControlCmd) -> DecodeResult<()> {
        log::debug!("Control {:?}", cmd);

        match cmd {
            ControlCmd::SetTraceLevel(level) => self.config.trace_level = level,
            ControlCmd::SetNeedSplit(need_split) => {
                self.splitter.reset();
                self.config.need_split = need_split;
            }
            ControlCmd::SetDisableErrorRecovery(disable) => {
                self.config.disable_error_recovery = disable
            }
            ControlCmd::SetExtradata(extradata) => {
                self.parse_extradata(&extradata)?;
                self.config.extradata = Some(extradata);
            }
        }

        Ok(())
    }

    fn callback(&mut self, report: TaskReport) {
        if !report.error {
            return;
        }

        log::warn!("Picture in slot {:?} failed to decode", report.slot);
        if !self.dpb.mark_error(report.slot) {
            log::debug!("Slot {:?} already left the DPB", report.slot);
        }
        self.pool.set_property(report.slot, SlotProperty::ErrorInfo(true));
    }
}
