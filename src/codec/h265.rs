// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

pub mod dpb;
pub mod frame_splitter;
pub mod nalu;
pub mod parser;
pub mod picture;
pub mod rbsp;
pub mod rps;
pub mod sei;
#[cfg(test)]
pub(crate) mod synthesizer;
