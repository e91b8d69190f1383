use std::fs;

use tempfile::TempDir;

use super::*;
use crate::project::ProjectSettings;
use crate::scenes::{scene_key, SceneRecord};

fn versions() -> Versions {
  Versions {
    aom: "AOMedia Project AV1 Encoder v3.6.0".to_owned(),
    vpx: "WebM Project VP9 Encoder v1.12.0".to_owned(),
    dav1d: "dav1d 1.2.0".to_owned(),
  }
}

fn test_registry(dir: &TempDir) -> (Arc<Registry>, Receiver<Action>) {
  Registry::new(dir.path().to_path_buf(), versions())
}

/// Builds a ready project with one open job per scene length. The split
/// directory gets a placeholder segment so that resume finds it.
fn add_ready_project(registry: &Registry, pid: &str, priority: i64, frames: &[usize]) {
  let mut project = Project::new(
    Some(pid.to_owned()),
    ProjectSettings {
      path_in: PathBuf::from("input.mkv"),
      encoder: Encoder::aom,
      encoder_params: "--cpu-used=6".to_owned(),
      ffmpeg_params: String::new(),
      min_frames: -1,
      max_frames: -1,
      priority,
      on_complete: String::new(),
      grain: false,
    },
    registry.jobs_dir(),
  );

  for (i, &len) in frames.iter().enumerate() {
    project.scenes.insert(
      scene_key(i),
      SceneRecord {
        segment: format!("{i:05}.mkv"),
        start: 0,
        frames: len,
        filesize: 0,
        bad: false,
      },
    );
  }
  project.input_total_frames = frames.iter().sum();

  fs::create_dir_all(&project.path_split).unwrap();
  fs::write(project.path_split.join("00000.mkv"), b"segment").unwrap();

  registry.add_project(project, false);
}

fn meta(registry: &Registry, pid: &str, scene: &str, client: &str) -> UploadMeta {
  UploadMeta {
    client: client.to_owned(),
    encoder: Encoder::aom,
    version: registry.versions().aom.clone(),
    encoder_params: "--cpu-used=6".to_owned(),
    ffmpeg_params: String::new(),
    projectid: pid.to_owned(),
    scene: scene.to_owned(),
    grain: false,
  }
}

fn stage_upload(dir: &TempDir, bytes: &[u8]) -> PathBuf {
  let path = dir.path().join("staged.ivf");
  fs::write(&path, bytes).unwrap();
  path
}

fn job_workers(registry: &Registry, pid: &str, scene: &str) -> Vec<String> {
  registry.with_projects(|projects| projects[pid].jobs[scene].workers.clone())
}

const W1: &str = "10.0.0.1:50000";
const W2: &str = "10.0.0.2:50001";

#[test]
fn dispatch_prefers_the_largest_open_scene() {
  let dir = TempDir::new().unwrap();
  let (registry, _rx) = test_registry(&dir);
  add_ready_project(&registry, "p", 0, &[100, 50, 200]);

  // an assigned scene sinks below unassigned ones on the next call
  let first = registry.get_job(&[], W1).unwrap();
  assert_eq!(first.scene, "00002");
  assert_eq!(first.frames, 200);
  let second = registry.get_job(&[], W1).unwrap();
  assert_eq!(second.frames, 100);
  let third = registry.get_job(&[], W1).unwrap();
  assert_eq!(third.frames, 50);
}

#[test]
fn dispatch_never_returns_a_held_scene() {
  let dir = TempDir::new().unwrap();
  let (registry, _rx) = test_registry(&dir);
  add_ready_project(&registry, "p", 0, &[100, 200]);

  let held = vec![HeldJob {
    projectid: "p".to_owned(),
    scene: "00001".to_owned(),
  }];
  let job = registry.get_job(&held, W1).unwrap();
  assert_eq!(job.scene, "00000");

  let held: Vec<HeldJob> = ["00000", "00001"]
    .iter()
    .map(|s| HeldJob {
      projectid: "p".to_owned(),
      scene: (*s).to_owned(),
    })
    .collect();
  assert!(registry.get_job(&held, W1).is_none());
}

#[test]
fn dispatch_orders_by_project_priority_first() {
  let dir = TempDir::new().unwrap();
  let (registry, _rx) = test_registry(&dir);
  add_ready_project(&registry, "low", 0, &[500]);
  add_ready_project(&registry, "high", -1, &[10]);

  let job = registry.get_job(&[], W1).unwrap();
  assert_eq!(job.projectid, "high");
}

#[test]
fn assignment_is_additive_not_exclusive() {
  let dir = TempDir::new().unwrap();
  let (registry, _rx) = test_registry(&dir);
  add_ready_project(&registry, "p", 0, &[100]);

  let first = registry.get_job(&[], W1).unwrap();
  let second = registry.get_job(&[], W2).unwrap();
  assert_eq!(first.scene, second.scene);
  assert_eq!(job_workers(&registry, "p", "00000"), vec![W1, W2]);
}

#[test]
fn dispatch_carries_the_job_parameters() {
  let dir = TempDir::new().unwrap();
  let (registry, _rx) = test_registry(&dir);
  add_ready_project(&registry, "p", 0, &[100]);

  let job = registry.get_job(&[], W1).unwrap();
  assert_eq!(job.projectid, "p");
  assert_eq!(job.filename, "00000.mkv");
  assert_eq!(job.encoder, Encoder::aom);
  assert_eq!(job.encoder_params, "--cpu-used=6");
  assert_eq!(job.version, registry.versions().aom);
  assert_eq!(job.start, 0);
  assert!(!job.grain);
}

#[test]
fn cancel_removes_only_the_calling_worker() {
  let dir = TempDir::new().unwrap();
  let (registry, _rx) = test_registry(&dir);
  add_ready_project(&registry, "p", 0, &[100]);

  registry.get_job(&[], W1).unwrap();
  registry.get_job(&[], W2).unwrap();
  assert!(matches!(
    registry.cancel_job(W1, "p", "00000"),
    CancelOutcome::Done
  ));
  assert_eq!(job_workers(&registry, "p", "00000"), vec![W2]);

  assert!(matches!(
    registry.cancel_job(W1, "nope", "00000"),
    CancelOutcome::ProjectNotFound
  ));
  assert!(matches!(
    registry.cancel_job(W1, "p", "99999"),
    CancelOutcome::JobNotFound
  ));
}

#[test]
fn bad_params_rejection_unassigns_the_caller() {
  let dir = TempDir::new().unwrap();
  let (registry, _rx) = test_registry(&dir);
  add_ready_project(&registry, "p", 0, &[100]);
  registry.get_job(&[], W1).unwrap();

  let mut upload = meta(&registry, "p", "00000", W1);
  upload.encoder_params = "--cpu-used=3".to_owned();
  assert_eq!(
    registry.precheck_upload(&upload),
    Err(UploadOutcome::BadParams)
  );

  // the scene stays open minus the caller
  assert!(job_workers(&registry, "p", "00000").is_empty());
  registry.with_projects(|projects| {
    assert_eq!(projects["p"].scenes["00000"].filesize, 0);
    assert!(projects["p"].jobs.contains_key("00000"));
  });
}

#[test]
fn upload_prechecks_report_state_divergence() {
  let dir = TempDir::new().unwrap();
  let (registry, _rx) = test_registry(&dir);
  add_ready_project(&registry, "p", 0, &[100]);

  assert_eq!(
    registry.precheck_upload(&meta(&registry, "ghost", "00000", W1)),
    Err(UploadOutcome::ProjectNotFound)
  );
  assert_eq!(
    registry.precheck_upload(&meta(&registry, "p", "99999", W1)),
    Err(UploadOutcome::JobNotFound)
  );
  assert_eq!(registry.precheck_upload(&meta(&registry, "p", "00000", W1)), Ok(()));
}

#[test]
fn frame_mismatch_deletes_the_upload_and_keeps_the_scene_open() {
  let dir = TempDir::new().unwrap();
  let (registry, _rx) = test_registry(&dir);
  add_ready_project(&registry, "p", 0, &[100]);
  registry.get_job(&[], W1).unwrap();

  let upload = meta(&registry, "p", "00000", W1);
  registry.precheck_upload(&upload).unwrap();
  let staged = stage_upload(&dir, b"encoded scene");
  assert_eq!(
    registry.commit_upload(&upload, &staged, 99),
    UploadOutcome::FrameMismatch
  );

  assert!(!staged.exists());
  registry.with_projects(|projects| {
    assert_eq!(projects["p"].scenes["00000"].filesize, 0);
    assert!(projects["p"].jobs.contains_key("00000"));
  });
}

#[test]
fn verified_upload_retires_the_scene_atomically() {
  let dir = TempDir::new().unwrap();
  let (registry, rx) = test_registry(&dir);
  add_ready_project(&registry, "p", 0, &[100]);
  registry.get_job(&[], W1).unwrap();
  while rx.try_recv().is_ok() {}

  let upload = meta(&registry, "p", "00000", W1);
  registry.precheck_upload(&upload).unwrap();
  let payload = b"encoded scene bytes";
  let staged = stage_upload(&dir, payload);
  assert_eq!(
    registry.commit_upload(&upload, &staged, 100),
    UploadOutcome::Saved
  );

  registry.with_projects(|projects| {
    let project = &projects["p"];
    assert_eq!(project.scenes["00000"].filesize, payload.len() as u64);
    assert!(project.jobs.is_empty());
    assert!(project
      .path_encode
      .join("00000.ivf")
      .is_file());
  });

  // the job is gone for good: no dispatch, and duplicates discard
  assert!(registry.get_job(&[], W2).is_none());
  let staged = stage_upload(&dir, payload);
  assert_eq!(
    registry.precheck_upload(&upload),
    Err(UploadOutcome::AlreadyDone)
  );
  assert_eq!(
    registry.commit_upload(&upload, &staged, 100),
    UploadOutcome::AlreadyDone
  );

  // the drained project queued its completion
  assert!(matches!(rx.try_recv(), Ok(Action::Complete(pid)) if pid == "p"));

  // telemetry picked up the accepted frames
  let (fph, since) = registry.telemetry();
  assert_eq!(fph, 100);
  assert!(!since.is_empty());
}

#[test]
fn persistence_round_trips_through_disk() {
  let dir = TempDir::new().unwrap();
  {
    let (registry, _rx) = test_registry(&dir);
    add_ready_project(&registry, "p", 3, &[60, 40]);
    registry.save_projects();
  }

  let (registry, _rx) = test_registry(&dir);
  registry.load_projects();
  registry.with_projects(|projects| {
    let project = &projects["p"];
    assert_eq!(project.priority, 3);
    assert_eq!(project.scenes.len(), 2);
    assert_eq!(project.input_total_frames, 100);
    assert_eq!(project.jobs.len(), 2);
    assert_eq!(project.status, ProjectStatus::Ready);
  });
}

#[test]
fn modify_and_delete_projects() {
  let dir = TempDir::new().unwrap();
  let (registry, _rx) = test_registry(&dir);
  add_ready_project(&registry, "p", 0, &[100]);

  assert!(registry.modify_project("p", Some(-5), Some("merge".to_owned())));
  registry.with_projects(|projects| {
    assert_eq!(projects["p"].priority, -5);
    assert_eq!(projects["p"].on_complete, "merge");
  });
  assert!(!registry.modify_project("ghost", Some(1), None));

  assert!(registry.delete_project("p"));
  assert!(!registry.delete_project("p"));
  assert!(registry.get_job(&[], W1).is_none());
}
