//! Filesystem-to-sequential-media backup engine.
//!
//! Walks a directory tree, packs file contents and metadata into
//! fixed-maximum-size checksummed chunks, and streams them to a
//! block-based sequential device (tape, virtual tape, or file) through a
//! backpressured pipeline: scanner → packer → post-processor → writer.

pub mod api;
pub mod chunk;
pub mod config;
pub mod device;
pub mod fs;
pub mod packer;
pub mod pipeline;
pub mod utils;
