//! Fuzz target for content-stream-path parsing.

#![no_main]

use asset_tree::RequestContext;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(uri) = std::str::from_utf8(data) {
        if let Ok(ctx) = RequestContext::parse(uri) {
            // Parsed paths are normalised
            assert!(ctx.full_name().is_empty() || ctx.full_name().starts_with('/'));
            // Rendering and parsing again gives the same context
            let again = RequestContext::parse(&ctx.to_string()).expect("rendered context parses");
            assert_eq!(again, ctx);
        }
    }
});
