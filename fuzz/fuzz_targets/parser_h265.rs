#![no_main]

use cros_hevc::decoder::dummy::DummySlotPool;
use cros_hevc::decoder::dummy::DummyTaskSink;
use cros_hevc::decoder::h265::H265Parser;
use cros_hevc::decoder::CodecParser;
use cros_hevc::decoder::DecoderConfig;
use cros_hevc::decoder::Prepared;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut parser = H265Parser::new(DummySlotPool::new(64), DummyTaskSink::default());
    let config = DecoderConfig {
        need_split: true,
        ..Default::default()
    };
    if parser.init(config).is_err() {
        return;
    }

    let mut input = data;
    loop {
        let prepared = match parser.prepare(input) {
            Ok(prepared) => prepared,
            Err(_) => return,
        };
        input = &input[prepared.consumed..];

        match prepared.access_unit {
            Some(au) => {
                if let Err(err) = parser.parse(&au) {
                    if err.is_fatal() {
                        return;
                    }
                }
            }
            None if input.is_empty() => break,
            None => (),
        }
    }

    if let Ok(Prepared { access_unit: Some(au), .. }) = parser.prepare(&[]) {
        let _ = parser.parse(&au);
    }
    let _ = parser.flush();
});
