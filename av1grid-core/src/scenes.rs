//! Persisted scene and segment records.
//!
//! A *segment* is a physical file carved out of the source; a *scene* is
//! a logical encode unit, a `[start, start + frames)` window inside one
//! segment. Scene keys are zero-padded five digit strings so that sorting
//! the map yields source order.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub type SceneMap = BTreeMap<String, SceneRecord>;
pub type SegmentMap = BTreeMap<String, SegmentRecord>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneRecord {
  /// File name of the physical segment this scene lives in.
  pub segment: String,
  /// Frame offset into the segment.
  pub start: usize,
  /// Length in frames.
  pub frames: usize,
  /// Size of the verified encode on disk; 0 means not yet encoded.
  pub filesize: u64,
  /// Marks a scene that must be skipped entirely.
  #[serde(default, skip_serializing_if = "skip_false")]
  pub bad: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
  /// Frame offset into the original source.
  pub start: usize,
  /// Length in frames.
  pub length: usize,
}

fn skip_false(b: &bool) -> bool {
  !*b
}

pub fn scene_key(n: usize) -> String {
  format!("{n:05}")
}

pub fn segment_name(n: usize) -> String {
  format!("{n:05}.mkv")
}

pub fn write_scene_map(scenes: &SceneMap, path: &Path) -> std::io::Result<()> {
  // serializing the map should never fail, so unwrap is OK
  let serialized = serde_json::to_string_pretty(scenes).unwrap();
  let mut file = File::create(path)?;
  file.write_all(serialized.as_bytes())?;
  Ok(())
}

pub fn read_scene_map(path: &Path) -> anyhow::Result<SceneMap> {
  let file = File::open(path)?;
  let reader = BufReader::new(file);
  serde_json::from_reader(reader).with_context(|| {
    format!(
      "failed to parse scene map {}, the file is likely corrupted",
      path.display()
    )
  })
}
