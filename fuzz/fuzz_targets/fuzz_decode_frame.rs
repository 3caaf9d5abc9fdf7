//! Fuzz target for frame decoding.
//!
//! Arbitrary bytes must decode to a frame, "need more", or an error; never a
//! panic or an over-long consumed length.

#![no_main]

use asset_tree::wire::codec::{decode_frame, encode_frame, DEFAULT_COMPRESSION_THRESHOLD};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(Some((frame, consumed))) = decode_frame(data) {
        assert!(consumed <= data.len());
        // Anything we accept must re-encode
        let _ = encode_frame(&frame, DEFAULT_COMPRESSION_THRESHOLD);
    }
});
