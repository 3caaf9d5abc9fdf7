//! Fuzz target for frame payload decompression.
//!
//! Compressed payloads must either inflate within the frame limit or fail
//! with an error; plain payloads pass through untouched.

#![no_main]

use asset_tree::wire::codec::{maybe_decompress, MAX_FRAME_LEN};
use libfuzzer_sys::fuzz_target;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

fuzz_target!(|data: &[u8]| {
    match maybe_decompress(data) {
        Ok(out) => {
            assert!(out.len() <= MAX_FRAME_LEN.max(data.len()));
            if !data.starts_with(&ZSTD_MAGIC) {
                assert_eq!(out, data);
            }
        }
        Err(_) => assert!(data.starts_with(&ZSTD_MAGIC)),
    }
});
