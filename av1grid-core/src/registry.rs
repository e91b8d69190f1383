//! The process-wide project registry: a single lock over all project
//! state, the serialized action queue for slow operations, the priority
//! dispatcher and the upload verification state machine.
//!
//! Splitting and concatenation mutate shared scene maps and take minutes;
//! they run one at a time on the action thread, never on a request
//! thread, and every processed action is followed by a full persistence
//! dump. Dumps are best-effort; the last successful dump is authoritative.

#[cfg(test)]
mod tests;

use std::collections::{BTreeMap, VecDeque};
use std::cmp::Reverse;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Deserialize;
use time::format_description::FormatItem;
use time::macros::format_description;
use tracing::{debug, error, info, warn};

use crate::actions::{self, ActionContext};
use crate::encoder::{Encoder, Versions};
use crate::ffmpeg;
use crate::project::{Project, ProjectRecord, ProjectStatus, StartOutcome};
use crate::scenes::{read_scene_map, write_scene_map, SceneMap};
use crate::split;

/// Reason strings exchanged with workers in the `finish_job` body. The
/// worker maps each reason onto its retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::IntoStaticStr)]
pub enum UploadOutcome {
  #[strum(serialize = "project not found")]
  ProjectNotFound,
  #[strum(serialize = "job not found")]
  JobNotFound,
  #[strum(serialize = "bad params")]
  BadParams,
  #[strum(serialize = "bad encoder version")]
  BadEncoderVersion,
  #[strum(serialize = "bad upload")]
  BadUpload,
  #[strum(serialize = "bad encode")]
  BadEncode,
  #[strum(serialize = "frame mismatch")]
  FrameMismatch,
  #[strum(serialize = "already done")]
  AlreadyDone,
  #[strum(serialize = "saved")]
  Saved,
}

impl std::fmt::Display for UploadOutcome {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(<&'static str>::from(self))
  }
}

/// A `(projectid, scene)` pair the calling worker already holds, so the
/// dispatcher never hands the same scene back to it.
#[derive(Debug, Clone, Deserialize)]
pub struct HeldJob {
  pub projectid: String,
  pub scene: String,
}

/// Project-scoped slow operations, processed one at a time.
#[derive(Debug, Clone)]
pub enum Action {
  Split(String),
  Complete(String),
  Post(String),
}

/// Everything the transport needs to answer a successful `get_job`.
#[derive(Debug, Clone)]
pub struct Dispatched {
  pub projectid: String,
  pub scene: String,
  pub filename: String,
  pub path: PathBuf,
  pub encoder: Encoder,
  pub encoder_params: String,
  pub ffmpeg_params: String,
  pub version: String,
  pub start: usize,
  pub frames: usize,
  pub grain: bool,
}

/// The form fields accompanying an upload.
#[derive(Debug, Clone)]
pub struct UploadMeta {
  pub client: String,
  pub encoder: Encoder,
  pub version: String,
  pub encoder_params: String,
  pub ffmpeg_params: String,
  pub projectid: String,
  pub scene: String,
  pub grain: bool,
}

pub enum CancelOutcome {
  Done,
  ProjectNotFound,
  JobNotFound,
}

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
  format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Rolling hourly throughput: every accepted scene appends a sample,
/// samples older than an hour fall off.
struct Telemetry {
  encodes: VecDeque<(usize, SystemTime)>,
  fph: usize,
  fph_time: String,
}

impl Telemetry {
  fn new() -> Telemetry {
    Telemetry {
      encodes: VecDeque::new(),
      fph: 0,
      fph_time: String::new(),
    }
  }

  fn hit(&mut self, frames: usize) {
    let now = SystemTime::now();
    self.encodes.retain(|(_, at)| {
      now
        .duration_since(*at)
        .map(|age| age < Duration::from_secs(3600))
        .unwrap_or(false)
    });
    self.encodes.push_back((frames, now));
    self.fph = self.encodes.iter().map(|(frames, _)| frames).sum();
    self.fph_time = time::OffsetDateTime::from(now)
      .format(TIMESTAMP_FORMAT)
      .unwrap_or_default();
  }
}

struct State {
  projects: BTreeMap<String, Project>,
  telemetry: Telemetry,
}

pub struct Registry {
  state: Mutex<State>,
  working_dir: PathBuf,
  path_projects: PathBuf,
  path_scenes: PathBuf,
  path_jobs: PathBuf,
  versions: Versions,
  actions_tx: Sender<Action>,
}

impl Registry {
  pub fn new(working_dir: PathBuf, versions: Versions) -> (Arc<Registry>, Receiver<Action>) {
    let (actions_tx, actions_rx) = unbounded();
    let registry = Registry {
      state: Mutex::new(State {
        projects: BTreeMap::new(),
        telemetry: Telemetry::new(),
      }),
      path_projects: working_dir.join("projects.json"),
      path_scenes: working_dir.join("scenes"),
      path_jobs: working_dir.join("jobs"),
      working_dir,
      versions,
      actions_tx,
    };
    (Arc::new(registry), actions_rx)
  }

  /// Spawns the serialized action thread. Every action is followed by a
  /// full dump.
  pub fn start_action_loop(self: &Arc<Self>, actions_rx: Receiver<Action>) -> thread::JoinHandle<()> {
    let registry = Arc::clone(self);
    thread::spawn(move || {
      for action in actions_rx {
        registry.process_action(action);
        registry.save_projects();
      }
    })
  }

  pub fn working_dir(&self) -> &Path {
    &self.working_dir
  }

  pub fn jobs_dir(&self) -> &Path {
    &self.path_jobs
  }

  pub fn versions(&self) -> &Versions {
    &self.versions
  }

  pub fn enqueue(&self, action: Action) {
    // the receiver lives as long as the process; a send can only fail
    // during shutdown
    let _ = self.actions_tx.send(action);
  }

  /// Registers a project and kicks off its lifecycle: a fresh project is
  /// sent to the splitter, a resumed one gets a completion check.
  pub fn add_project(&self, mut project: Project, save: bool) {
    info!(target: "project", "added project {}", project.projectid);
    let outcome = project.start();
    let pid = project.projectid.clone();
    {
      let mut state = self.state.lock();
      state.projects.insert(pid.clone(), project);
      if save {
        self.save_locked(&state);
      }
    }
    match outcome {
      StartOutcome::NeedsSplit => self.enqueue(Action::Split(pid)),
      StartOutcome::Started => self.enqueue(Action::Complete(pid)),
    }
  }

  /// Loads the persisted registry. A project that fails to load is
  /// skipped; the others still come up.
  pub fn load_projects(&self) {
    let file = match File::open(&self.path_projects) {
      Ok(file) => file,
      Err(_) => return,
    };
    let records: BTreeMap<String, ProjectRecord> = match serde_json::from_reader(BufReader::new(file)) {
      Ok(records) => records,
      Err(e) => {
        error!("failed to parse {}: {e}", self.path_projects.display());
        return;
      }
    };

    for (pid, record) in records {
      let scene_path = self.path_scenes.join(format!("{pid}.json"));
      let scenes = if scene_path.is_file() {
        match read_scene_map(&scene_path) {
          Ok(scenes) => scenes,
          Err(e) => {
            info!("failed to load project {pid}: {e:#}");
            continue;
          }
        }
      } else {
        SceneMap::new()
      };
      let project = Project::from_record(pid, record, scenes, &self.path_jobs);
      self.add_project(project, false);
    }
  }

  /// Picks the next job for a worker: ascending by project priority, then
  /// fewest assigned workers, then largest frame count (long scenes first
  /// to keep the tail short). The worker is appended to the job's
  /// assignment list; the job stays open until a verified upload lands.
  pub fn get_job(&self, held: &[HeldJob], worker_id: &str) -> Option<Dispatched> {
    let mut state = self.state.lock();
    let state = &mut *state;

    let mut candidates: Vec<(i64, usize, Reverse<usize>, String, String)> = Vec::new();
    for (pid, project) in &state.projects {
      for (key, job) in &project.jobs {
        if held
          .iter()
          .any(|h| h.projectid == *pid && h.scene == *key)
        {
          continue;
        }
        candidates.push((
          project.priority,
          job.workers.len(),
          Reverse(job.frames),
          pid.clone(),
          key.clone(),
        ));
      }
    }
    candidates.sort();
    let (_, _, _, pid, scene) = candidates.into_iter().next()?;

    let project = state.projects.get_mut(&pid)?;
    let job = project.jobs.get_mut(&scene)?;
    job.workers.push(worker_id.to_owned());
    let record = &project.scenes[&scene];

    Some(Dispatched {
      projectid: pid.clone(),
      scene,
      filename: record.segment.clone(),
      path: project.path_split.join(&record.segment),
      encoder: project.encoder,
      encoder_params: project.encoder_params.clone(),
      ffmpeg_params: project.ffmpeg_params.clone(),
      version: self.versions.of(project.encoder).to_owned(),
      start: job.start,
      frames: job.frames,
      grain: project.grain,
    })
  }

  /// A worker returns a job: drop it from the assignment list. Nothing
  /// else changes; the scene stays open.
  pub fn cancel_job(&self, client: &str, projectid: &str, scene: &str) -> CancelOutcome {
    let mut state = self.state.lock();
    let Some(project) = state.projects.get_mut(projectid) else {
      return CancelOutcome::ProjectNotFound;
    };
    let Some(job) = project.jobs.get_mut(scene) else {
      return CancelOutcome::JobNotFound;
    };
    if let Some(pos) = job.workers.iter().position(|w| w == client) {
      job.workers.remove(pos);
      info!(target: "net", "cancel {projectid} {scene} by {client}");
    }
    CancelOutcome::Done
  }

  /// Pre-checks an upload before its body is verified. The caller is
  /// unassigned from the job either way; a parameter mismatch rejects
  /// the upload outright.
  pub fn precheck_upload(&self, meta: &UploadMeta) -> Result<(), UploadOutcome> {
    let mut state = self.state.lock();
    let Some(project) = state.projects.get_mut(&meta.projectid) else {
      info!(target: "net", "project not found {}", meta.projectid);
      return Err(UploadOutcome::ProjectNotFound);
    };

    // a retired scene answers `already done` even though its job is gone,
    // so late duplicate uploads are discarded silently by the worker
    match project.scenes.get(&meta.scene) {
      Some(scene) if scene.filesize > 0 => {
        info!(
          target: "net",
          "discard from {} {} {} already done", meta.client, meta.projectid, meta.scene
        );
        return Err(UploadOutcome::AlreadyDone);
      }
      Some(_) => {}
      None => {
        info!(target: "net", "job not found {} {}", meta.projectid, meta.scene);
        return Err(UploadOutcome::JobNotFound);
      }
    }

    let Some(job) = project.jobs.get_mut(&meta.scene) else {
      info!(target: "net", "job not found {} {}", meta.projectid, meta.scene);
      return Err(UploadOutcome::JobNotFound);
    };

    if let Some(pos) = job.workers.iter().position(|w| *w == meta.client) {
      job.workers.remove(pos);
    }

    if project.encoder != meta.encoder
      || project.encoder_params != meta.encoder_params
      || project.ffmpeg_params != meta.ffmpeg_params
    {
      info!(
        target: "net",
        "discard from {} {} {} bad params", meta.client, meta.projectid, meta.scene
      );
      return Err(UploadOutcome::BadParams);
    }

    Ok(())
  }

  /// Commits a verified upload: the staged file moves into the encode
  /// directory and the scene retires, all under the registry lock so the
  /// `filesize` transition happens at most once.
  pub fn commit_upload(
    &self,
    meta: &UploadMeta,
    staged: &Path,
    decoded_frames: usize,
  ) -> UploadOutcome {
    let mut state = self.state.lock();
    let state = &mut *state;

    let Some(project) = state.projects.get_mut(&meta.projectid) else {
      let _ = fs::remove_file(staged);
      return UploadOutcome::ProjectNotFound;
    };

    match project.scenes.get(&meta.scene) {
      None => {
        let _ = fs::remove_file(staged);
        return UploadOutcome::JobNotFound;
      }
      Some(scene) if scene.filesize > 0 => {
        let _ = fs::remove_file(staged);
        return UploadOutcome::AlreadyDone;
      }
      Some(scene) if decoded_frames != scene.frames => {
        info!(
          target: "net",
          "discard from {} {} {} frame mismatch {decoded_frames}/{}",
          meta.client, meta.projectid, meta.scene, scene.frames
        );
        let _ = fs::remove_file(staged);
        return UploadOutcome::FrameMismatch;
      }
      Some(_) => {}
    }
    if !project.jobs.contains_key(&meta.scene) {
      let _ = fs::remove_file(staged);
      return UploadOutcome::JobNotFound;
    }

    let encoded = project.path_encode.join(Project::encoded_filename(&meta.scene));
    if let Err(e) = fs::create_dir_all(&project.path_encode) {
      error!("failed to create {}: {e}", project.path_encode.display());
      return UploadOutcome::BadUpload;
    }
    if let Err(e) = fs::rename(staged, &encoded) {
      error!("failed to store upload {}: {e}", encoded.display());
      return UploadOutcome::BadUpload;
    }

    let scene = project.scenes.get_mut(&meta.scene).unwrap();
    scene.filesize = fs::metadata(&encoded).map(|m| m.len()).unwrap_or(0);
    let frames = scene.frames;

    // the job is removed atomically with the scene transition
    let job = project.jobs.remove(&meta.scene).unwrap();
    if job.workers.contains(&meta.client) {
      project.encoded_frames += frames;
    }

    info!(
      target: "net",
      "recv {} {} from {}", meta.projectid, meta.scene, meta.client
    );
    state.telemetry.hit(frames);

    let drained = project.ready_to_complete();
    let pid = meta.projectid.clone();
    self.save_locked(state);

    if drained {
      info!(target: "project", "{pid} done");
      self.enqueue(Action::Complete(pid));
    }

    UploadOutcome::Saved
  }

  pub fn delete_project(&self, projectid: &str) -> bool {
    let mut state = self.state.lock();
    if state.projects.remove(projectid).is_none() {
      return false;
    }
    self.save_locked(&state);
    true
  }

  pub fn modify_project(
    &self,
    projectid: &str,
    priority: Option<i64>,
    on_complete: Option<String>,
  ) -> bool {
    let mut state = self.state.lock();
    let Some(project) = state.projects.get_mut(projectid) else {
      return false;
    };
    if let Some(priority) = priority {
      project.priority = priority;
    }
    if let Some(on_complete) = on_complete {
      project.on_complete = on_complete;
    }
    self.save_locked(&state);
    true
  }

  /// Runs a closure against the locked project map; for read-mostly
  /// consumers like the HTTP views.
  pub fn with_projects<R>(&self, f: impl FnOnce(&BTreeMap<String, Project>) -> R) -> R {
    let state = self.state.lock();
    f(&state.projects)
  }

  /// Frames-per-hour over the rolling window plus the timestamp of the
  /// most recent accepted scene.
  pub fn telemetry(&self) -> (usize, String) {
    let state = self.state.lock();
    (state.telemetry.fph, state.telemetry.fph_time.clone())
  }

  pub fn save_projects(&self) {
    let state = self.state.lock();
    self.save_locked(&state);
  }

  fn save_locked(&self, state: &State) {
    if let Err(e) = fs::create_dir_all(&self.path_scenes) {
      error!("failed to create {}: {e}", self.path_scenes.display());
      return;
    }

    let records: BTreeMap<&String, ProjectRecord> = state
      .projects
      .iter()
      .map(|(pid, project)| (pid, project.record()))
      .collect();
    match File::create(&self.path_projects) {
      Ok(file) => {
        if let Err(e) = serde_json::to_writer_pretty(file, &records) {
          error!("failed to save {}: {e}", self.path_projects.display());
        }
      }
      Err(e) => error!("failed to save {}: {e}", self.path_projects.display()),
    }

    for (pid, project) in &state.projects {
      let path = self.path_scenes.join(format!("{pid}.json"));
      if let Err(e) = write_scene_map(&project.scenes, &path) {
        error!("failed to save {}: {e}", path.display());
      }
    }
  }

  /// Action-thread entry point.
  pub fn process_action(&self, action: Action) {
    match action {
      Action::Split(pid) => self.run_split(&pid),
      Action::Complete(pid) => self.run_complete(&pid),
      Action::Post(pid) => self.run_post(&pid),
    }
  }

  fn run_split(&self, pid: &str) {
    let prep = {
      let mut state = self.state.lock();
      state.projects.get_mut(pid).map(|project| {
        project.status = ProjectStatus::Splitting;
        (
          project.path_in.clone(),
          project.path_split.clone(),
          project.min_frames,
          project.max_frames,
        )
      })
    };
    let Some((path_in, path_split, min_frames, max_frames)) = prep else {
      return;
    };

    info!(target: "project", "{pid} splitting");
    let (scenes, total_frames, segments) =
      match split::split(pid, &path_in, &path_split, min_frames, max_frames) {
        Ok(result) => result,
        Err(e) => {
          error!(target: "project", "{pid} split failed: {e:#}");
          return;
        }
      };

    {
      let mut state = self.state.lock();
      // the project may have been deleted while the split ran
      let Some(project) = state.projects.get_mut(pid) else {
        return;
      };
      project.scenes = scenes;
      project.input_total_frames = total_frames;
      project.status = ProjectStatus::VerifyingSplit;
    }

    info!(target: "project", "{pid} verifying split");
    if let Err(e) = split::verify_split(pid, &path_in, &path_split, &segments) {
      error!(target: "project", "{pid} split verification failed: {e:#}");
    }

    let outcome = {
      let mut state = self.state.lock();
      let Some(project) = state.projects.get_mut(pid) else {
        return;
      };
      let outcome = project.start();
      self.save_locked(&state);
      outcome
    };
    if let StartOutcome::Started = outcome {
      self.enqueue(Action::Complete(pid.to_owned()));
    }
  }

  fn run_complete(&self, pid: &str) {
    let prep = {
      let mut state = self.state.lock();
      let Some(project) = state.projects.get_mut(pid) else {
        return;
      };
      if !project.ready_to_complete() {
        return;
      }
      if project.path_out.is_file() {
        project.status = ProjectStatus::Complete;
        return;
      }
      project.status = ProjectStatus::Joining;
      (
        project.concat_sources(),
        project.path_out.clone(),
        project.total_frames,
        project.on_complete.clone(),
      )
    };
    let (sources, path_out, total_frames, on_complete) = prep;

    info!(target: "project", "{pid} concat");
    match ffmpeg::concat(&sources, &path_out, |frame| {
      debug!(target: "project", "{pid} concat {frame}/{total_frames}");
    }) {
      Ok(()) => {
        if let Some(project) = self.state.lock().projects.get_mut(pid) {
          project.status = ProjectStatus::Complete;
        }
        info!(target: "project", "{pid} completed");
        if !on_complete.is_empty() {
          self.enqueue(Action::Post(pid.to_owned()));
        }
      }
      Err(e) => {
        error!(target: "project", "{pid} concat failed: {e:#}");
        if let Some(project) = self.state.lock().projects.get_mut(pid) {
          project.status = ProjectStatus::Ready;
        }
      }
    }
  }

  fn run_post(&self, pid: &str) {
    let prep = {
      let state = self.state.lock();
      state.projects.get(pid).map(|project| {
        (
          project.on_complete.clone(),
          ActionContext {
            projectid: project.projectid.clone(),
            path_in: project.path_in.clone(),
            path_out: project.path_out.clone(),
            total_frames: project.total_frames,
            working_dir: self.working_dir.clone(),
          },
        )
      })
    };
    let Some((tag, ctx)) = prep else {
      return;
    };
    if let Err(e) = actions::run(&tag, &ctx) {
      warn!(target: "project", "{pid} action {tag} failed: {e:#}");
    }
  }
}
