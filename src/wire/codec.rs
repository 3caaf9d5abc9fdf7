//! Frame encoding.
//!
//! # Layout
//!
//! ```text
//! ┌──────────────┬──────┬──────────────────────────────┐
//! │ len: u32 BE  │ flag │ payload (len - 1 bytes)      │
//! └──────────────┴──────┴──────────────────────────────┘
//! ```
//!
//! The payload is the JSON document of the [`Frame`]. Payloads larger than
//! the compression threshold are zstd compressed and flagged with
//! [`FLAG_ZSTD`]; a flagged payload must start with the zstd magic.

use super::Frame;
use crate::error::{Result, TreeError};
use std::io::Read;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Payload is zstd compressed.
pub const FLAG_ZSTD: u8 = 0x01;

/// Upper bound on a frame body, compressed or not.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Default payload size above which frames are compressed.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 4096;

const HEADER_LEN: usize = 4;
const ZSTD_LEVEL: i32 = 3;

/// Encode `frame`, compressing payloads larger than `compression_threshold`.
pub fn encode_frame(frame: &Frame, compression_threshold: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(frame)?;
    let (flag, payload) = if json.len() > compression_threshold {
        let compressed = zstd::encode_all(json.as_slice(), ZSTD_LEVEL)
            .map_err(|e| TreeError::Codec(format!("zstd encode: {}", e)))?;
        (FLAG_ZSTD, compressed)
    } else {
        (0, json)
    };

    let body_len = payload.len() + 1;
    if body_len > MAX_FRAME_LEN {
        return Err(TreeError::Codec(format!(
            "frame of {} bytes exceeds limit of {}",
            body_len, MAX_FRAME_LEN
        )));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.push(flag);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` does not yet hold a whole frame, otherwise
/// the frame and the number of bytes it occupied.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>> {
    let Some(header) = buf.get(..HEADER_LEN) else {
        return Ok(None);
    };
    let mut len_bytes = [0u8; HEADER_LEN];
    len_bytes.copy_from_slice(header);
    let body_len = u32::from_be_bytes(len_bytes) as usize;
    if body_len == 0 {
        return Err(TreeError::Codec("empty frame".to_string()));
    }
    if body_len > MAX_FRAME_LEN {
        return Err(TreeError::Codec(format!(
            "frame of {} bytes exceeds limit of {}",
            body_len, MAX_FRAME_LEN
        )));
    }
    let Some(body) = buf.get(HEADER_LEN..HEADER_LEN + body_len) else {
        return Ok(None);
    };

    let flag = body[0];
    let payload = &body[1..];
    let json = if flag & FLAG_ZSTD != 0 {
        if !has_zstd_magic(payload) {
            return Err(TreeError::Codec("compressed frame lacks zstd magic".to_string()));
        }
        maybe_decompress(payload)?
    } else {
        payload.to_vec()
    };
    let frame: Frame = serde_json::from_slice(&json)?;
    Ok(Some((frame, HEADER_LEN + body_len)))
}

fn has_zstd_magic(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == ZSTD_MAGIC
}

/// Decompress zstd data if it has the magic header, otherwise return as-is.
///
/// Output is capped at [`MAX_FRAME_LEN`].
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if has_zstd_magic(data) {
        let decoder = zstd::Decoder::new(data)
            .map_err(|e| TreeError::Decompression(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .take(MAX_FRAME_LEN as u64 + 1)
            .read_to_end(&mut decompressed)
            .map_err(|e| TreeError::Decompression(format!("zstd decode: {}", e)))?;
        if decompressed.len() > MAX_FRAME_LEN {
            return Err(TreeError::Decompression(format!(
                "decompressed frame exceeds limit of {}",
                MAX_FRAME_LEN
            )));
        }
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}
