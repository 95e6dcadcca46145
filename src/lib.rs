// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! H.265 bitstream parsing and reference picture management for hardware
//! accelerated decoders.
//!
//! [`codec::h265`] holds the syntax parsers and the reference picture logic,
//! [`decoder`] the stateful front end that drives them.

pub mod bitstream_utils;
pub mod codec;
pub mod decoder;
