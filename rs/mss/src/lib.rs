//! # mss: Microsoft Smooth Streaming client demuxer
//!
//! `mss` parses a Smooth Streaming (PIFF) manifest, resolves per-track
//! fragment URLs, and demuxes the fragmented MP4 payloads they reference
//! into a single globally timestamp-ordered packet stream.
//!
//! ## Overview
//!
//! - **manifest**: The `SmoothStreamingMedia` XML document model and parser.
//! - **templater**: Fragment URL placeholder expansion.
//! - **codec**: Decoder-initialization parameters from manifest metadata.
//! - **source**: Per-track byte streaming across fragments, with live reload.
//! - **demux**: Incremental fMP4 atom reading and packet extraction.
//! - **interleave**: Cross-track DTS ordering with one-packet lookahead.
//! - **seek**: Fragment-timeline seeking.
//! - **session**: The entry point tying the above together.

mod error;

pub mod codec;
pub mod demux;
pub mod interleave;
pub mod manifest;
pub mod seek;
pub mod session;
pub mod source;
pub mod templater;

pub use error::*;
pub use session::Session;
