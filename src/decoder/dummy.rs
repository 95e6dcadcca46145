// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A slot pool and a task sink whose only purpose is to let the front end
//! run so we can test it in isolation.

use crate::decoder::DecodeError;
use crate::decoder::DecodeResult;
use crate::decoder::PictureTask;
use crate::decoder::SlotId;
use crate::decoder::SlotPool;
use crate::decoder::SlotProperty;
use crate::decoder::TaskSink;

/// Hands out slot ids in sequence, up to `capacity` of them, and records
/// everything it is told.
#[derive(Debug)]
pub struct DummySlotPool {
    capacity: u32,
    next: u32,
    pub properties: Vec<(SlotId, SlotProperty)>,
    pub displayed: Vec<SlotId>,
}

impl DummySlotPool {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            next: 0,
            properties: Vec::new(),
            displayed: Vec::new(),
        }
    }

    pub fn num_allocated(&self) -> u32 {
        self.next
    }

    /// Returns the last value of `Poc` set on `slot`.
    pub fn poc(&self, slot: SlotId) -> Option<i32> {
        self.properties.iter().rev().find_map(|(s, p)| match p {
            SlotProperty::Poc(poc) if *s == slot => Some(*poc),
            _ => None,
        })
    }

    /// POCs of the displayed slots, in display order.
    pub fn displayed_pocs(&self) -> Vec<Option<i32>> {
        self.displayed.iter().map(|slot| self.poc(*slot)).collect()
    }
}

impl Default for DummySlotPool {
    fn default() -> Self {
        Self::new(u32::MAX)
    }
}

impl SlotPool for DummySlotPool {
    fn allocate_slot(&mut self) -> DecodeResult<SlotId> {
        if self.next >= self.capacity {
            return Err(DecodeError::OutOfMemory(format!(
                "all {} slots are in use",
                self.capacity
            )));
        }

        let slot = SlotId(self.next);
        self.next += 1;
        Ok(slot)
    }

    fn set_property(&mut self, slot: SlotId, property: SlotProperty) {
        self.properties.push((slot, property));
    }

    fn enqueue_for_display(&mut self, slot: SlotId) {
        self.displayed.push(slot);
    }
}

/// Keeps every task it is given.
#[derive(Debug, Default)]
pub struct DummyTaskSink {
    pub tasks: Vec<PictureTask>,
}

impl TaskSink for DummyTaskSink {
    fn submit(&mut self, task: PictureTask) -> DecodeResult<()> {
        self.tasks.push(task);
        Ok(())
    }
}
