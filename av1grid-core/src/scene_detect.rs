//! Logical-keyframe detection for the scene planner.
//!
//! The encoder's own first-pass analysis decides where scenes should
//! start; we run the same detector over a yuv4mpegpipe decode of the
//! source instead of paying for a throwaway first pass.

use std::path::Path;
use std::process::{Command, Stdio};

use av_scenechange::{detect_scene_changes, DetectionOptions, SceneDetectionSpeed};

/// Detects logical keyframes over the whole source. Frame zero is always
/// part of the result.
pub fn logical_keyframes(
  input: &Path,
  callback: Option<Box<dyn Fn(usize, usize)>>,
) -> anyhow::Result<Vec<usize>> {
  let decoder = &mut y4m::Decoder::new(
    Command::new("ffmpeg")
      .args(["-r", "1", "-i"])
      .arg(input)
      .args([
        "-map",
        "0:v:0",
        "-pix_fmt",
        "yuv420p",
        "-f",
        "yuv4mpegpipe",
        "-strict",
        "-1",
        "-",
      ])
      .stdout(Stdio::piped())
      .stderr(Stdio::null())
      .spawn()?
      .stdout
      .unwrap(),
  )?;

  let options = DetectionOptions {
    analysis_speed: SceneDetectionSpeed::Standard,
    ..DetectionOptions::default()
  };

  let mut frames =
    detect_scene_changes::<_, u8>(decoder, options, None, callback.as_deref()).scene_changes;
  if frames.first() != Some(&0) {
    frames.insert(0, 0);
  }
  Ok(frames)
}
