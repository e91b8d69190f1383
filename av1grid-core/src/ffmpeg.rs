//! Spawn-and-parse wrappers around the external muxer and decoder.
//!
//! Everything here shells out to `ffmpeg`; nothing links against it. The
//! coordinator uses these for frame counting, keyframe enumeration, split
//! execution and concatenation.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{bail, Context};

use crate::parse;
use crate::regex;

/// Counts the frames of the first video stream. The fast variant decodes
/// nothing (`-c copy`); the slow variant runs a full decode and is the
/// ground truth when the container index lies.
pub fn num_frames(source: &Path, fast: bool) -> anyhow::Result<usize> {
  let mut cmd = Command::new("ffmpeg");
  cmd.args(["-hide_banner", "-i"]);
  cmd.arg(source);
  cmd.args(["-map", "0:v:0"]);
  if fast {
    cmd.args(["-c", "copy"]);
  }
  cmd.args(["-f", "null", "-"]);
  cmd.stdout(Stdio::piped());
  cmd.stderr(Stdio::piped());

  let out = cmd.output().context("failed to run ffmpeg")?;
  let text = format!(
    "{}{}",
    String::from_utf8_lossy(&out.stderr),
    String::from_utf8_lossy(&out.stdout)
  );

  parse::parse_ffmpeg_frame(&text)
    .with_context(|| format!("no frame count in ffmpeg output for {}", source.display()))
}

/// Returns the keyframe list of the first video stream plus the total
/// frame count, extracted from a full decode with the select filter's
/// debug output.
pub fn source_keyframes(source: &Path) -> anyhow::Result<(Vec<usize>, usize)> {
  let mut cmd = Command::new("ffmpeg");
  cmd.args(["-hide_banner", "-i"]);
  cmd.arg(source);
  cmd.args([
    "-map",
    "0:v:0",
    "-vf",
    r"select=eq(pict_type\,PICT_TYPE_I)",
    "-f",
    "null",
    "-loglevel",
    "debug",
    "-",
  ]);
  cmd.stdout(Stdio::null());
  cmd.stderr(Stdio::piped());

  let mut child = cmd.spawn().context("failed to run ffmpeg")?;
  let stderr = child.stderr.take().unwrap();

  let mut keyframes = Vec::new();
  let mut total_frames = 0;
  for line in BufReader::new(stderr).lines() {
    let line = match line {
      Ok(line) => line,
      Err(_) => break,
    };
    if let Some(cap) = regex!(r"n:([0-9]+)\.[0-9]+ pts:.+key:1.+pict_type:I").captures(&line) {
      keyframes.push(cap[1].parse()?);
    } else if let Some(cap) = regex!(r"video.+?([0-9]+?) frames decoded").captures(&line) {
      total_frames = cap[1].parse()?;
    }
  }

  let status = child.wait()?;
  if !status.success() {
    bail!("ffmpeg keyframe scan exited with {status}");
  }

  if keyframes.is_empty() {
    keyframes.push(0);
  }
  if total_frames == 0 {
    total_frames = num_frames(source, true)?;
  }

  Ok((keyframes, total_frames))
}

/// Runs an ffmpeg command to completion, feeding every `frame=` progress
/// update to the callback. ffmpeg separates progress updates with
/// carriage returns, so the stream is split on both `\r` and `\n`.
pub(crate) fn run(mut cmd: Command, mut progress: impl FnMut(usize)) -> anyhow::Result<()> {
  cmd.stdout(Stdio::piped());
  cmd.stderr(Stdio::piped());

  let mut child = cmd.spawn().context("failed to run ffmpeg")?;
  let stderr = child.stderr.take().unwrap();

  let mut reader = BufReader::new(stderr);
  let mut buf = Vec::with_capacity(256);
  loop {
    buf.clear();
    let read = reader.read_until(b'\r', &mut buf)?;
    if read == 0 {
      break;
    }
    let chunk = String::from_utf8_lossy(&buf);
    for line in chunk.split('\n') {
      if let Some(frame) = parse::parse_ffmpeg_frame(line) {
        progress(frame);
      }
    }
  }

  let status = child.wait()?;
  if !status.success() {
    bail!("ffmpeg exited with {status}");
  }
  Ok(())
}

/// Cuts the source into physical segments at the given frame offsets.
/// With `force_keyframes` the source is losslessly re-encoded so that
/// every cut lands on a keyframe; otherwise the split is a pure copy.
pub fn segment(
  input: &Path,
  split_dir: &Path,
  cut_frames: &[usize],
  force_keyframes: Option<&[usize]>,
  progress: impl FnMut(usize),
) -> anyhow::Result<()> {
  fs::create_dir_all(split_dir)
    .with_context(|| format!("failed to create {}", split_dir.display()))?;

  let mut cmd = Command::new("ffmpeg");
  cmd.args(["-y", "-hide_banner", "-i"]);
  cmd.arg(input);
  cmd.args(["-map", "0:v:0", "-an", "-avoid_negative_ts", "1", "-vsync", "0"]);

  match force_keyframes {
    Some(frames) => {
      let expr = frames
        .iter()
        .map(|f| format!("eq(n,{f})"))
        .collect::<Vec<_>>()
        .join("+");
      cmd.args([
        "-c:v",
        "libx264",
        "-x264-params",
        "scenecut=-1",
        "-preset",
        "veryfast",
        "-threads",
        "16",
        "-crf",
        "0",
        "-force_key_frames",
        &format!("expr:{expr}"),
      ]);
    }
    None => {
      cmd.args(["-c", "copy"]);
    }
  }

  // the first cut is always frame zero, which the segment muxer implies
  let interior: Vec<String> = cut_frames
    .iter()
    .skip(1)
    .map(ToString::to_string)
    .collect();
  if interior.is_empty() {
    cmd.arg(split_dir.join("00000.mkv"));
  } else {
    cmd.args(["-f", "segment", "-segment_frames", &interior.join(",")]);
    cmd.arg(split_dir.join("%05d.mkv"));
  }

  run(cmd, progress)
}

/// Losslessly re-cuts `[start, start + length)` of the source into a
/// fresh segment. Used to replace segments that failed verification.
pub fn recut_segment(
  input: &Path,
  output: &Path,
  start: usize,
  length: usize,
  progress: impl FnMut(usize),
) -> anyhow::Result<()> {
  let mut cmd = Command::new("ffmpeg");
  cmd.args(["-hide_banner", "-i"]);
  cmd.arg(input);
  cmd.args([
    "-map",
    "0:v:0",
    "-c:v",
    "libx264",
    "-crf",
    "0",
    "-vsync",
    "0",
    "-force_key_frames",
    &format!("expr:eq(n,{start})"),
    "-x264-params",
    "scenecut=0",
    "-vf",
    &format!(r"select=gte(n\,{start})"),
    "-frames:v",
    &length.to_string(),
    "-y",
  ]);
  cmd.arg(output);

  run(cmd, progress)
}

/// Concatenates encoded scenes with the concat demuxer into the final
/// output. The file list goes through a scratch file next to the output.
pub fn concat(
  sources: &[PathBuf],
  output: &Path,
  progress: impl FnMut(usize),
) -> anyhow::Result<()> {
  let mut list = tempfile::Builder::new()
    .prefix("concat-")
    .suffix(".txt")
    .tempfile_in(output.parent().unwrap_or_else(|| Path::new(".")))
    .context("failed to create concat list")?;
  for source in sources {
    // the concat demuxer wants forward slashes even on windows
    writeln!(list, "file '{}'", source.display().to_string().replace('\\', "/"))?;
  }
  list.flush()?;

  let mut cmd = Command::new("ffmpeg");
  cmd.args(["-hide_banner", "-f", "concat", "-safe", "0", "-y", "-i"]);
  cmd.arg(list.path());
  cmd.args(["-c", "copy"]);
  cmd.arg(output);

  run(cmd, progress)
}
