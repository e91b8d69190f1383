//! The scene planner: turns keyframe lists into a split plan, executes
//! the split and verifies the produced segments.
//!
//! Planning is pure (`plan_scenes`); only `split` and `verify_split`
//! touch the filesystem and the external muxer.

#[cfg(test)]
mod tests;

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use itertools::Itertools;
use tracing::{info, warn};

use crate::ffmpeg;
use crate::scene_detect;
use crate::scenes::{scene_key, segment_name, SceneMap, SceneRecord, SegmentMap, SegmentRecord};

/// A cut may snap onto a source keyframe this many frames away from its
/// ideal position, turning a re-encoded cut into a free copy cut.
pub const KEYFRAME_SNAP_TOLERANCE: usize = 5;

/// Output of the planning stage. `cut_frames` are the segment boundaries
/// fed to the muxer; `reencode` selects the lossless re-encode split
/// instead of the stream copy split.
#[derive(Debug, Clone)]
pub struct SplitPlan {
  pub scenes: SceneMap,
  pub segments: SegmentMap,
  pub cut_frames: Vec<usize>,
  pub reencode: bool,
}

/// Plans the scene partition of a source from its keyframe lists.
///
/// `min_frames`/`max_frames` bound scene lengths; -1 disables a bound.
/// Every scene boundary that coincides with a source keyframe can be cut
/// by stream copy; when at least half of the boundaries do, the plan
/// groups scenes into copy segments, otherwise it falls back to one
/// losslessly re-encoded segment per scene.
pub fn plan_scenes(
  source_kfs: &[usize],
  logical_kfs: &[usize],
  total_frames: usize,
  min_frames: i64,
  max_frames: i64,
) -> SplitPlan {
  let mut boundaries: Vec<usize> = logical_kfs.to_vec();
  if boundaries.first() != Some(&0) {
    boundaries.insert(0, 0);
  }

  if min_frames > 0 {
    boundaries = coalesce_short_scenes(&boundaries, total_frames, min_frames as usize);
  }
  if boundaries.last() != Some(&total_frames) {
    boundaries.push(total_frames);
  }
  if max_frames > 0 {
    boundaries = apply_max_dist(&boundaries, min_frames, max_frames as usize, source_kfs);
  }

  let source_set: BTreeSet<usize> = source_kfs.iter().copied().collect();
  let starts = &boundaries[..boundaries.len() - 1];
  let matching = starts.iter().filter(|f| source_set.contains(f)).count();

  if matching * 2 >= starts.len() {
    let (cut_frames, scenes, segments) =
      partition_with_source(&boundaries, source_kfs, total_frames);
    SplitPlan {
      scenes,
      segments,
      cut_frames,
      reencode: false,
    }
  } else {
    // too few boundaries land on source keyframes; cut every scene
    // exactly and force keyframes by re-encoding
    let mut scenes = SceneMap::new();
    let mut segments = SegmentMap::new();
    for (n, (&frame, &next)) in boundaries.iter().tuple_windows().enumerate() {
      scenes.insert(
        scene_key(n),
        SceneRecord {
          segment: segment_name(n),
          start: 0,
          frames: next - frame,
          filesize: 0,
          bad: false,
        },
      );
      segments.insert(
        segment_name(n),
        SegmentRecord {
          start: frame,
          length: next - frame,
        },
      );
    }
    SplitPlan {
      scenes,
      segments,
      cut_frames: starts.to_vec(),
      reencode: true,
    }
  }
}

/// Folds scenes shorter than `min` into a neighbor. A short scene is
/// deferred into the next scene while nothing has been emitted yet (the
/// first scene is never emitted short), merged into the previous scene
/// while that one is itself still short, and otherwise merged into
/// whichever neighbor is currently shorter. A trailing short scene stays
/// as emitted; only the last scene may end up below `min`.
fn coalesce_short_scenes(logical_kfs: &[usize], total_frames: usize, min: usize) -> Vec<usize> {
  let mut boundaries = logical_kfs.to_vec();
  boundaries.push(total_frames);

  let scenes: Vec<(usize, usize)> = boundaries
    .iter()
    .tuple_windows()
    .map(|(&start, &next)| (start, next - start))
    .collect();

  let mut emitted: Vec<(usize, usize)> = Vec::with_capacity(scenes.len());
  let mut accumulate = 0usize;

  for (i, &(start, len)) in scenes.iter().enumerate() {
    let (start, len) = (start - accumulate, len + accumulate);
    accumulate = 0;

    if len > min {
      emitted.push((start, len));
    } else if emitted.is_empty() {
      accumulate = len;
    } else {
      let last = *emitted.last().unwrap();
      let is_last_scene = i + 1 == scenes.len();
      if last.1 < min || is_last_scene {
        if is_last_scene && last.1 >= min {
          // the final scene is allowed to stay short
          emitted.push((start, len));
        } else {
          *emitted.last_mut().unwrap() = (last.0, last.1 + len);
        }
      } else if scenes[i + 1].1 < last.1 {
        // the upcoming scene is the smaller neighbor; defer into it
        accumulate = len;
      } else {
        *emitted.last_mut().unwrap() = (last.0, last.1 + len);
      }
    }
  }

  if emitted.is_empty() {
    // the whole source is shorter than the minimum
    emitted.push((0, total_frames));
  }

  emitted.into_iter().map(|(start, _)| start).collect()
}

/// Slices scenes longer than `max`. Each extra cut prefers a source
/// keyframe within the snap tolerance of the ideal offset (`start + max`
/// while more than one slice remains, the midpoint otherwise); failing
/// that it lands on the exact frame.
fn apply_max_dist(
  boundaries: &[usize],
  min: i64,
  max: usize,
  source_kfs: &[usize],
) -> Vec<usize> {
  let mut out = vec![boundaries[0]];

  for (&start, &next) in boundaries.iter().tuple_windows() {
    let mut frame = start;
    let mut length = next - frame;

    while length > max {
      let target = if length - max >= max {
        frame + max
      } else if (length / 2) as i64 > min {
        frame + length / 2
      } else {
        break;
      };

      frame = snap_to_keyframe(target, frame, next, source_kfs).unwrap_or(target);
      length = next - frame;
      out.push(frame);
    }

    out.push(next);
  }

  out
}

/// Nearest source keyframe within the snap tolerance of `target`, kept
/// strictly inside the scene being sliced.
fn snap_to_keyframe(
  target: usize,
  scene_start: usize,
  scene_end: usize,
  source_kfs: &[usize],
) -> Option<usize> {
  source_kfs
    .iter()
    .copied()
    .filter(|&kf| kf > scene_start && kf < scene_end)
    .filter(|&kf| kf.abs_diff(target) < KEYFRAME_SNAP_TOLERANCE)
    .min_by_key(|&kf| kf.abs_diff(target))
}

/// Builds the copy-split partition: every scene points at the nearest
/// preceding source keyframe as its segment, with `start` the offset into
/// that segment. Consecutive scenes behind the same keyframe share a
/// segment.
fn partition_with_source(
  boundaries: &[usize],
  source_kfs: &[usize],
  total_frames: usize,
) -> (Vec<usize>, SceneMap, SegmentMap) {
  let mut cuts: Vec<usize> = Vec::new();
  let mut scenes = SceneMap::new();
  let mut segments = SegmentMap::new();
  let source_set: BTreeSet<usize> = source_kfs.iter().copied().collect();
  let mut last_end = 0usize;

  for (&frame, &next) in boundaries.iter().tuple_windows() {
    let mut segment_n = cuts.len();
    let mut start = 0usize;
    let length = next - frame;

    if source_set.contains(&frame) {
      cuts.push(frame);
    } else {
      let preceding = source_kfs
        .iter()
        .copied()
        .filter(|&kf| kf < frame)
        .max()
        .unwrap_or(0);
      start = frame - preceding;
      if cuts.contains(&preceding) || preceding < last_end {
        // the previous scene already claimed this keyframe's segment
        segment_n = segment_n.saturating_sub(1);
        start = frame - cuts.last().copied().unwrap_or(0);
      } else {
        cuts.push(preceding);
      }
    }

    scenes.insert(
      scene_key(scenes.len()),
      SceneRecord {
        segment: segment_name(segment_n),
        start,
        frames: length,
        filesize: 0,
        bad: false,
      },
    );
    last_end = frame + length;
  }

  for (n, &cut) in cuts.iter().enumerate() {
    let end = cuts.get(n + 1).copied().unwrap_or(total_frames);
    segments.insert(
      segment_name(n),
      SegmentRecord {
        start: cut,
        length: end - cut,
      },
    );
  }

  (cuts, scenes, segments)
}

/// Runs the full split for a source: keyframe analysis, planning and the
/// muxer invocation. Returns the scene map, the total frame count and the
/// segment map for verification.
pub fn split(
  pid: &str,
  input: &Path,
  split_dir: &Path,
  min_frames: i64,
  max_frames: i64,
) -> anyhow::Result<(SceneMap, usize, SegmentMap)> {
  info!(target: "split", "{pid} getting source keyframes");
  let (source_kfs, total_frames) = ffmpeg::source_keyframes(input)?;
  info!(target: "split", "{pid} total frames: {total_frames}");
  info!(target: "split", "{pid} source keyframes: {}", source_kfs.len());

  let logical_kfs = scene_detect::logical_keyframes(input, None)?;
  info!(target: "split", "{pid} logical keyframes: {}", logical_kfs.len());

  let plan = plan_scenes(
    &source_kfs,
    &logical_kfs,
    total_frames,
    min_frames,
    max_frames,
  );
  if plan.reencode {
    info!(target: "split", "{pid} keyframes unreliable, re-encoding");
  }

  ffmpeg::segment(
    input,
    split_dir,
    &plan.cut_frames,
    plan.reencode.then_some(plan.cut_frames.as_slice()),
    |frame| info!(target: "split", "{pid} splitting {frame}/{total_frames}"),
  )?;

  Ok((plan.scenes, total_frames, plan.segments))
}

/// Verifies every produced segment: cumulative start, fast frame count
/// and slow frame count must all agree with the plan. A failing segment
/// is moved aside and re-cut losslessly from the source.
pub fn verify_split(
  pid: &str,
  input: &Path,
  split_dir: &Path,
  segments: &SegmentMap,
) -> anyhow::Result<()> {
  let mut cursor = 0usize;

  for (i, (name, segment)) in segments.iter().enumerate() {
    info!(target: "split", "{pid} verifying splits: {}/{}", i + 1, segments.len());
    let path = split_dir.join(name);
    let fast = ffmpeg::num_frames(&path, true)?;

    if cursor != segment.start {
      warn!(
        target: "split",
        "{pid} misalignment at {name} expected: {}, got: {cursor}", segment.start
      );
    } else if fast != segment.length {
      warn!(
        target: "split",
        "{pid} bad framecount {name} expected: {}, got: {fast}", segment.length
      );
    } else {
      let slow = ffmpeg::num_frames(&path, false)?;
      if fast == slow {
        cursor += fast;
        continue;
      }
      warn!(
        target: "split",
        "{pid} bad framecount {name} expected: {fast}, got: {slow}"
      );
    }

    let old_dir = split_dir.join("old");
    fs::create_dir_all(&old_dir)?;
    fs::rename(&path, old_dir.join(name))?;
    ffmpeg::recut_segment(input, &path, segment.start, segment.length, |frame| {
      info!(target: "split", "{pid} correcting split {frame}/{}", segment.length);
    })?;

    cursor = segment.start + segment.length;
  }

  Ok(())
}
