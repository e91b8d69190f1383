//! Core library for av1grid, a distributed AV1 / VP9 re-encoding system.
//!
//! A single coordinator owns the authoritative project state: it plans
//! scenes at keyframe boundaries, hands open scenes to remote workers,
//! verifies uploaded encodes and concatenates the results. Workers fetch
//! scenes over HTTP, run the two-pass encoder pipeline and upload the
//! output. The HTTP adapters live in the `av1grid-coordinator` and
//! `av1grid-worker` binary crates; everything else is here.

mod util;

pub mod actions;
pub mod client;
pub mod encoder;
pub mod ffmpeg;
pub mod logging;
pub mod parse;
pub mod project;
pub mod registry;
pub mod scene_detect;
pub mod scenes;
pub mod split;
