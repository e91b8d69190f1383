//! Per-project state: configuration, the scene map, the derived open-job
//! set and the lifecycle bookkeeping around splitting and completion.
//!
//! Slow operations (splitting, concatenation) are orchestrated by the
//! registry's action queue; this module only holds the state transitions
//! that run under the registry lock.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::encoder::Encoder;
use crate::scenes::SceneMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum ProjectStatus {
  #[strum(serialize = "starting")]
  Starting,
  #[strum(serialize = "splitting")]
  Splitting,
  #[strum(serialize = "verifying split")]
  VerifyingSplit,
  #[strum(serialize = "ready")]
  Ready,
  #[strum(serialize = "joining files")]
  Joining,
  #[strum(serialize = "complete")]
  Complete,
  #[strum(serialize = "total frame mismatch")]
  TotalFrameMismatch,
}

impl std::fmt::Display for ProjectStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(<&'static str>::from(self))
  }
}

/// The open-work projection of a scene that still needs encoding. The
/// worker list is additive: a scene may be handed to several workers at
/// once as the backstop against silent worker failure.
#[derive(Debug, Clone)]
pub struct Job {
  pub scene: String,
  pub start: usize,
  pub frames: usize,
  pub workers: Vec<String>,
}

/// The persisted form of a project inside `projects.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
  pub priority: i64,
  pub path_in: PathBuf,
  pub encoder: Encoder,
  pub encoder_params: String,
  #[serde(default)]
  pub ffmpeg_params: String,
  #[serde(default = "unset")]
  pub min_frames: i64,
  #[serde(default = "unset")]
  pub max_frames: i64,
  #[serde(default)]
  pub input_frames: usize,
  #[serde(default)]
  pub on_complete: String,
  #[serde(default, skip_serializing_if = "skip_false")]
  pub grain: bool,
}

fn unset() -> i64 {
  -1
}

fn skip_false(b: &bool) -> bool {
  !*b
}

/// Operator-supplied settings for a new project.
#[derive(Debug, Clone)]
pub struct ProjectSettings {
  pub path_in: PathBuf,
  pub encoder: Encoder,
  pub encoder_params: String,
  pub ffmpeg_params: String,
  pub min_frames: i64,
  pub max_frames: i64,
  pub priority: i64,
  pub on_complete: String,
  pub grain: bool,
}

#[derive(Debug)]
pub struct Project {
  pub projectid: String,
  pub path_in: PathBuf,
  pub path_out: PathBuf,
  pub path_split: PathBuf,
  pub path_encode: PathBuf,
  pub path_grain: PathBuf,
  pub encoder: Encoder,
  pub encoder_params: String,
  pub ffmpeg_params: String,
  pub min_frames: i64,
  pub max_frames: i64,
  pub priority: i64,
  pub on_complete: String,
  pub grain: bool,
  pub status: ProjectStatus,
  /// Frame count of the source, measured at split time.
  pub input_total_frames: usize,
  /// Sum of all scene lengths, accumulated on `start`.
  pub total_frames: usize,
  pub total_jobs: usize,
  /// Frames encoded by workers that were still assigned at upload time.
  pub encoded_frames: usize,
  pub scenes: SceneMap,
  pub jobs: BTreeMap<String, Job>,
}

pub enum StartOutcome {
  /// No split output exists yet; the caller has to enqueue a split.
  NeedsSplit,
  Started,
}

impl Project {
  pub fn new(id: Option<String>, settings: ProjectSettings, jobs_dir: &Path) -> Project {
    let projectid = id.unwrap_or_else(default_id);
    Project::assemble(projectid, settings, SceneMap::new(), 0, jobs_dir)
  }

  pub fn from_record(
    projectid: String,
    record: ProjectRecord,
    scenes: SceneMap,
    jobs_dir: &Path,
  ) -> Project {
    let input_frames = record.input_frames;
    let settings = ProjectSettings {
      path_in: record.path_in,
      encoder: record.encoder,
      encoder_params: record.encoder_params,
      ffmpeg_params: record.ffmpeg_params,
      min_frames: record.min_frames,
      max_frames: record.max_frames,
      priority: record.priority,
      on_complete: record.on_complete,
      grain: record.grain,
    };
    Project::assemble(projectid, settings, scenes, input_frames, jobs_dir)
  }

  fn assemble(
    projectid: String,
    settings: ProjectSettings,
    scenes: SceneMap,
    input_total_frames: usize,
    jobs_dir: &Path,
  ) -> Project {
    let root = jobs_dir.join(&projectid);
    Project {
      path_out: root.join("completed.webm"),
      path_split: root.join("split"),
      path_encode: root.join("encode"),
      path_grain: root.join("grain"),
      projectid,
      path_in: settings.path_in,
      encoder: settings.encoder,
      encoder_params: settings.encoder_params,
      ffmpeg_params: settings.ffmpeg_params,
      min_frames: settings.min_frames,
      max_frames: settings.max_frames,
      priority: settings.priority,
      on_complete: settings.on_complete,
      grain: settings.grain,
      status: ProjectStatus::Starting,
      input_total_frames,
      total_frames: 0,
      total_jobs: 0,
      encoded_frames: 0,
      scenes,
      jobs: BTreeMap::new(),
    }
  }

  pub fn record(&self) -> ProjectRecord {
    ProjectRecord {
      priority: self.priority,
      path_in: self.path_in.clone(),
      encoder: self.encoder,
      encoder_params: self.encoder_params.clone(),
      ffmpeg_params: self.ffmpeg_params.clone(),
      min_frames: self.min_frames,
      max_frames: self.max_frames,
      input_frames: self.input_total_frames,
      on_complete: self.on_complete.clone(),
      grain: self.grain,
    }
  }

  pub fn encoded_filename(scene_key: &str) -> String {
    format!("{scene_key}.ivf")
  }

  /// Sum of frames across scenes whose encode has landed.
  pub fn encoded_frames_total(&self) -> usize {
    self
      .scenes
      .values()
      .filter(|s| s.filesize != 0)
      .map(|s| s.frames)
      .sum()
  }

  /// Resumes the project from disk. Scene file sizes are re-read, the
  /// open-job set is rebuilt and the status settles on `ready`,
  /// `complete` or `total frame mismatch`.
  pub fn start(&mut self) -> StartOutcome {
    let has_split = fs::read_dir(&self.path_split)
      .map(|mut dir| dir.next().is_some())
      .unwrap_or(false);
    if !has_split {
      return StartOutcome::NeedsSplit;
    }

    self.total_jobs = self.scenes.len();
    self.total_frames = 0;
    let path_encode = self.path_encode.clone();
    for (key, scene) in self.scenes.iter_mut() {
      let encoded = path_encode.join(Project::encoded_filename(key));
      scene.filesize = fs::metadata(&encoded).map(|m| m.len()).unwrap_or(0);
      self.total_frames += scene.frames;
    }

    info!(target: "project", "{} loaded", self.projectid);

    if self.input_total_frames == self.total_frames {
      self.rebuild_jobs();
      self.status = ProjectStatus::Ready;
    } else {
      warn!(
        target: "project",
        "{} total frame mismatch {} {}",
        self.projectid, self.total_frames, self.input_total_frames
      );
      self.status = ProjectStatus::TotalFrameMismatch;
    }

    if self.path_out.is_file() {
      self.status = ProjectStatus::Complete;
    }

    StartOutcome::Started
  }

  /// Rebuilds the open-job set: a job exists iff the scene is unencoded
  /// and not marked bad.
  pub fn rebuild_jobs(&mut self) {
    self.jobs.clear();
    for (key, scene) in &self.scenes {
      if scene.filesize > 0 || scene.bad {
        continue;
      }
      self.jobs.insert(
        key.clone(),
        Job {
          scene: key.clone(),
          start: scene.start,
          frames: scene.frames,
          workers: Vec::new(),
        },
      );
    }
  }

  /// True once every open job has drained and the encoded frames add up.
  pub fn ready_to_complete(&self) -> bool {
    self.jobs.is_empty() && self.encoded_frames_total() == self.total_frames
  }

  /// Encoded scene files in source order, for concatenation.
  pub fn concat_sources(&self) -> Vec<PathBuf> {
    self
      .scenes
      .keys()
      .map(|key| self.path_encode.join(Project::encoded_filename(key)))
      .collect()
  }
}

fn default_id() -> String {
  let now = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default();
  format!("{:.2}", now.as_secs_f64())
}
