use super::*;

fn scene_frames(plan: &SplitPlan) -> Vec<usize> {
  plan.scenes.values().map(|s| s.frames).collect()
}

fn segment_starts(plan: &SplitPlan) -> Vec<usize> {
  plan.segments.values().map(|s| s.start).collect()
}

fn assert_partition_covers(plan: &SplitPlan, total_frames: usize) {
  // segments cover [0, total_frames) exactly, with no overlap
  let mut cursor = 0;
  for segment in plan.segments.values() {
    assert_eq!(segment.start, cursor);
    cursor += segment.length;
  }
  assert_eq!(cursor, total_frames);

  // scenes partition the source exactly once
  assert_eq!(
    plan.scenes.values().map(|s| s.frames).sum::<usize>(),
    total_frames
  );

  // every scene window fits inside its segment
  for scene in plan.scenes.values() {
    let segment = &plan.segments[&scene.segment];
    assert!(scene.start < segment.length);
    assert!(segment.start + scene.start + scene.frames <= total_frames);
  }
}

#[test]
fn copy_plan_at_matching_keyframes() {
  let plan = plan_scenes(&[0, 30, 60], &[0, 30, 60], 100, 0, 0);

  assert!(!plan.reencode);
  assert_eq!(scene_frames(&plan), vec![30, 30, 40]);
  assert_eq!(plan.segments.len(), 3);
  assert_eq!(segment_starts(&plan), vec![0, 30, 60]);
  assert!(plan.scenes.values().all(|s| s.start == 0));
  assert_partition_covers(&plan, 100);
}

#[test]
fn min_frames_merges_leading_short_scenes() {
  let plan = plan_scenes(&[0, 30, 60], &[0, 30, 60], 100, 50, 0);

  assert_eq!(scene_frames(&plan), vec![60, 40]);
  assert_partition_covers(&plan, 100);
}

#[test]
fn min_frames_never_emits_a_short_first_scene() {
  let plan = plan_scenes(&[0, 20, 80], &[0, 20, 80], 100, 30, 0);

  // the short head is pushed into the following keyframe; the trailing
  // scene is the only one allowed below the minimum
  assert_eq!(scene_frames(&plan), vec![80, 20]);
}

#[test]
fn min_frames_defers_into_the_smaller_neighbor() {
  // the scene after the short one is smaller than the scene before it,
  // so the short scene is deferred forward
  let plan = plan_scenes(&[], &[0, 60, 100, 120], 200, 50, 0);
  assert_eq!(scene_frames(&plan), vec![60, 60, 80]);

  // here the following scene is the larger neighbor, so the short scene
  // merges backwards instead
  let plan = plan_scenes(&[], &[0, 55, 95, 200], 260, 50, 0);
  assert_eq!(scene_frames(&plan), vec![95, 105, 60]);
}

#[test]
fn max_frames_slices_long_scenes() {
  let plan = plan_scenes(&[0, 30, 60], &[0, 30, 60], 100, 0, 25);

  assert!(plan.scenes.len() >= 4);
  assert!(plan.scenes.values().all(|s| s.frames <= 25));
  assert!(!plan.reencode);
  assert_partition_covers(&plan, 100);
}

#[test]
fn max_frames_snaps_to_a_nearby_source_keyframe() {
  // the ideal cut is frame 25; the source keyframe at 27 is within the
  // snap tolerance and wins
  let plan = plan_scenes(&[0, 27], &[0], 52, 0, 25);

  assert!(!plan.reencode);
  assert_eq!(scene_frames(&plan), vec![27, 25]);
  assert_eq!(segment_starts(&plan), vec![0, 27]);
}

#[test]
fn max_frames_cuts_exactly_without_a_nearby_keyframe() {
  let plan = plan_scenes(&[0], &[0], 60, 0, 25);

  // no source keyframes near the targets: exact cuts require re-encoding
  assert!(plan.reencode);
  assert_eq!(scene_frames(&plan), vec![25, 17, 18]);
  assert!(plan.scenes.values().all(|s| s.start == 0));
  assert_eq!(plan.segments.len(), plan.scenes.len());
  assert_partition_covers(&plan, 60);
}

#[test]
fn scenes_share_a_segment_behind_the_same_keyframe() {
  let plan = plan_scenes(&[0, 30], &[0, 10, 30], 60, 0, 0);

  assert!(!plan.reencode);
  let scenes: Vec<&SceneRecord> = plan.scenes.values().collect();
  assert_eq!(scenes.len(), 3);
  assert_eq!(scenes[0].segment, scenes[1].segment);
  assert_eq!(scenes[0].start, 0);
  assert_eq!(scenes[1].start, 10);
  assert_eq!(scenes[2].segment, "00001.mkv");
  assert_eq!(scenes[2].start, 0);
  assert_eq!(plan.segments.len(), 2);
  assert_partition_covers(&plan, 60);
}

#[test]
fn reencode_plan_when_keyframes_are_unreliable() {
  // only one of three boundaries lands on a source keyframe
  let plan = plan_scenes(&[0], &[0, 33, 66], 100, 0, 0);

  assert!(plan.reencode);
  assert_eq!(scene_frames(&plan), vec![33, 33, 34]);
  assert!(plan.scenes.values().all(|s| s.start == 0));
  assert_eq!(plan.cut_frames, vec![0, 33, 66]);
  assert_partition_covers(&plan, 100);
}

#[test]
fn whole_source_shorter_than_minimum_is_one_scene() {
  let plan = plan_scenes(&[0], &[0, 10], 20, 50, 0);

  assert_eq!(scene_frames(&plan), vec![20]);
  assert_partition_covers(&plan, 20);
}
