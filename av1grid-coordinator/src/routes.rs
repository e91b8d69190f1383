//! The HTTP adapter between remote workers / operators and the registry.
//! Job metadata rides on response headers so the body can be the raw
//! segment; logical failures answer 200 with the reason in the body.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{ConnectInfo, DefaultBodyLimit, Multipart, Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::task::spawn_blocking;
use tower_http::trace::TraceLayer;
use tracing::info;

use av1grid_core::actions;
use av1grid_core::encoder::{self, Encoder};
use av1grid_core::ffmpeg;
use av1grid_core::project::{Project, ProjectSettings};
use av1grid_core::registry::{CancelOutcome, HeldJob, Registry, UploadMeta, UploadOutcome};

#[derive(Clone)]
pub struct AppState {
  pub registry: Arc<Registry>,
  pub password: Option<String>,
}

pub fn router(state: AppState) -> Router {
  Router::new()
    .route("/scene/:projectid/:scene", get(get_scene))
    .route("/completed/:projectid", get(get_completed))
    .route("/cancel_job", post(cancel_job))
    .route("/finish_job", post(finish_job))
    .nest(
      "/api",
      Router::new()
        .route("/get_job/:held", get(get_job))
        .route("/get_grain/:projectid/:scene", get(get_grain))
        .route("/get_project/:projectid", get(get_project))
        .route("/get_projects", get(get_projects))
        .route("/get_home", get(get_home))
        .route("/get_info", get(get_info))
        .route("/list_directory", get(list_directory))
        .route("/add_project", post(add_project))
        .route("/modify/:projectid", post(modify_project))
        .route("/delete_project/:projectid", post(delete_project)),
    )
    .layer(DefaultBodyLimit::disable())
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

fn password_ok(state: &AppState, provided: Option<&str>) -> bool {
  match state.password.as_deref() {
    Some(expected) if provided != Some(expected) => {
      info!(target: "net", "bad password");
      false
    }
    _ => true,
  }
}

fn failure(reason: impl Into<String>) -> Json<Value> {
  Json(json!({ "success": false, "reason": reason.into() }))
}

async fn get_job(
  State(state): State<AppState>,
  ConnectInfo(addr): ConnectInfo<SocketAddr>,
  Path(held): Path<String>,
) -> Response {
  let held: Vec<HeldJob> = serde_json::from_str(&held).unwrap_or_default();
  let workerid = addr.to_string();

  let Some(job) = state.registry.get_job(&held, &workerid) else {
    return StatusCode::NOT_FOUND.into_response();
  };

  info!(
    target: "net",
    "sent {} {} to {workerid} ({} frames)", job.projectid, job.scene, job.frames
  );

  let Ok(body) = tokio::fs::read(&job.path).await else {
    return StatusCode::NOT_FOUND.into_response();
  };

  let mut headers = HeaderMap::new();
  let mut put = |name: &'static str, value: String| {
    if let Ok(value) = HeaderValue::from_str(&value) {
      headers.insert(name, value);
    }
  };
  put("projectid", job.projectid);
  put("filename", job.filename);
  put("scene", job.scene);
  put("id", workerid);
  put("encoder", job.encoder.to_string());
  put("encoder_params", job.encoder_params);
  put("ffmpeg_params", job.ffmpeg_params);
  put("version", job.version);
  put("start", job.start.to_string());
  put("frames", job.frames.to_string());
  put("grain", if job.grain { "1" } else { "0" }.to_owned());

  (headers, body).into_response()
}

#[derive(Deserialize)]
struct CancelForm {
  client: Option<String>,
  id: Option<String>,
  projectid: String,
  scene: String,
}

async fn cancel_job(
  State(state): State<AppState>,
  Form(form): Form<CancelForm>,
) -> (StatusCode, &'static str) {
  let client = form.client.or(form.id).unwrap_or_default();
  match state.registry.cancel_job(&client, &form.projectid, &form.scene) {
    CancelOutcome::ProjectNotFound => (StatusCode::NOT_FOUND, "project not found"),
    CancelOutcome::JobNotFound => (StatusCode::NOT_FOUND, "job not found"),
    CancelOutcome::Done => (StatusCode::OK, "saved"),
  }
}

async fn finish_job(State(state): State<AppState>, mut multipart: Multipart) -> Response {
  let mut fields: HashMap<String, String> = HashMap::new();
  let mut staged: Option<(tempfile::TempPath, u64)> = None;

  loop {
    let field = match multipart.next_field().await {
      Ok(Some(field)) => field,
      Ok(None) => break,
      Err(_) => return (StatusCode::OK, UploadOutcome::BadUpload.to_string()).into_response(),
    };
    let name = field.name().unwrap_or_default().to_owned();

    if name == "file" {
      let Ok(temp) = tempfile::Builder::new()
        .prefix("upload-")
        .suffix(".ivf")
        .tempfile_in(state.registry.working_dir())
      else {
        return (StatusCode::OK, UploadOutcome::BadUpload.to_string()).into_response();
      };
      let (std_file, temp_path) = temp.into_parts();
      let mut file = tokio::fs::File::from_std(std_file);
      let mut size = 0u64;

      let mut field = field;
      loop {
        match field.chunk().await {
          Ok(Some(chunk)) => {
            size += chunk.len() as u64;
            if file.write_all(&chunk).await.is_err() {
              return (StatusCode::OK, UploadOutcome::BadUpload.to_string()).into_response();
            }
          }
          Ok(None) => break,
          Err(_) => {
            return (StatusCode::OK, UploadOutcome::BadUpload.to_string()).into_response()
          }
        }
      }
      if file.flush().await.is_err() {
        return (StatusCode::OK, UploadOutcome::BadUpload.to_string()).into_response();
      }
      staged = Some((temp_path, size));
    } else {
      fields.insert(name, field.text().await.unwrap_or_default());
    }
  }

  // strict field set: extras are ignored, missing required fields reject
  let required = [
    "client",
    "encoder",
    "version",
    "encoder_params",
    "ffmpeg_params",
    "projectid",
    "scene",
  ];
  let mut missing: Vec<&str> = required
    .iter()
    .filter(|key| !fields.contains_key(**key))
    .copied()
    .collect();
  if staged.is_none() {
    missing.push("file");
  }
  if !missing.is_empty() {
    return (
      StatusCode::BAD_REQUEST,
      format!("missing fields {}", missing.join(",")),
    )
      .into_response();
  }

  let Ok(encoder_kind) = fields["encoder"].parse::<Encoder>() else {
    return (StatusCode::BAD_REQUEST, "unknown encoder").into_response();
  };

  if fields["version"] != state.registry.versions().of(encoder_kind) {
    return (StatusCode::OK, UploadOutcome::BadEncoderVersion.to_string()).into_response();
  }

  let meta = UploadMeta {
    client: fields["client"].clone(),
    encoder: encoder_kind,
    version: fields["version"].clone(),
    encoder_params: fields["encoder_params"].clone(),
    ffmpeg_params: fields["ffmpeg_params"].clone(),
    projectid: fields["projectid"].clone(),
    scene: fields["scene"].clone(),
    grain: fields.get("grain").map(|g| g != "0").unwrap_or(false),
  };

  if let Err(reason) = state.registry.precheck_upload(&meta) {
    return (StatusCode::OK, reason.to_string()).into_response();
  }

  let (temp_path, size) = staged.unwrap();
  if size == 0 {
    info!(
      target: "net",
      "discard from {} {} {} bad upload", meta.client, meta.projectid, meta.scene
    );
    return (StatusCode::OK, UploadOutcome::BadUpload.to_string()).into_response();
  }

  // decode verification runs off the request thread
  let staged_path = temp_path.to_path_buf();
  let decode = {
    let staged_path = staged_path.clone();
    spawn_blocking(move || match encoder_kind {
      Encoder::aom => encoder::dav1d_decode_check(&staged_path),
      Encoder::vpx => ffmpeg::num_frames(&staged_path, false).map(Some),
    })
    .await
  };
  let decoded_frames = match decode {
    Ok(Ok(Some(frames))) => frames,
    _ => {
      info!(
        target: "net",
        "discard from {} {} {} bad encode", meta.client, meta.projectid, meta.scene
      );
      return (StatusCode::OK, UploadOutcome::BadEncode.to_string()).into_response();
    }
  };

  let outcome = {
    let registry = Arc::clone(&state.registry);
    let meta = meta.clone();
    let staged_path = staged_path.clone();
    spawn_blocking(move || registry.commit_upload(&meta, &staged_path, decoded_frames))
      .await
      .unwrap_or(UploadOutcome::BadUpload)
  };

  // on success the staged file was renamed away; dropping the temp path
  // for any other outcome removes the leftover
  drop(temp_path);

  (StatusCode::OK, outcome.to_string()).into_response()
}

fn artifact_name_is_safe(name: &str) -> bool {
  !name.contains('/') && !name.contains('\\') && !name.contains("..")
}

async fn serve_file(path: Option<PathBuf>) -> Response {
  let Some(path) = path else {
    return StatusCode::NOT_FOUND.into_response();
  };
  match tokio::fs::read(&path).await {
    Ok(bytes) => bytes.into_response(),
    Err(_) => StatusCode::NOT_FOUND.into_response(),
  }
}

async fn get_scene(
  State(state): State<AppState>,
  Path((projectid, scene)): Path<(String, String)>,
) -> Response {
  if !artifact_name_is_safe(&scene) {
    return StatusCode::NOT_FOUND.into_response();
  }
  let path = state
    .registry
    .with_projects(|projects| projects.get(&projectid).map(|p| p.path_encode.join(&scene)));
  serve_file(path).await
}

async fn get_completed(
  State(state): State<AppState>,
  Path(projectid): Path<String>,
) -> Response {
  let path = state
    .registry
    .with_projects(|projects| projects.get(&projectid).map(|p| p.path_out.clone()));
  serve_file(path).await
}

async fn get_grain(
  State(state): State<AppState>,
  Path((projectid, scene)): Path<(String, String)>,
) -> Response {
  if !artifact_name_is_safe(&scene) {
    return StatusCode::NOT_FOUND.into_response();
  }
  let path = state.registry.with_projects(|projects| {
    projects
      .get(&projectid)
      .filter(|p| p.grain)
      .map(|p| p.path_grain.join(format!("{scene}.table")))
  });
  serve_file(path).await
}

async fn get_project(
  State(state): State<AppState>,
  Path(projectid): Path<String>,
) -> Response {
  let detail = state.registry.with_projects(|projects| {
    projects.get(&projectid).map(|p| {
      json!({
        "projectid": p.projectid,
        "input": p.path_in,
        "frames": p.encoded_frames_total(),
        "total_frames": p.input_total_frames,
        "jobs": p.jobs.len(),
        "total_jobs": p.total_jobs,
        "status": p.status.to_string(),
        "encoder_params": p.encoder_params,
        "ffmpeg_params": p.ffmpeg_params,
        "encoder": p.encoder,
        "scenes": p.scenes,
        "priority": p.priority,
        "workers": p
          .jobs
          .iter()
          .filter(|(_, job)| !job.workers.is_empty())
          .map(|(scene, _)| scene.clone())
          .collect::<Vec<String>>(),
      })
    })
  });
  match detail {
    Some(detail) => Json(detail).into_response(),
    None => StatusCode::NOT_FOUND.into_response(),
  }
}

async fn get_projects(State(state): State<AppState>) -> Json<Value> {
  let summaries = state.registry.with_projects(|projects| {
    projects
      .values()
      .map(|p| {
        json!({
          "projectid": p.projectid,
          "input": p.path_in,
          "frames": p.encoded_frames_total(),
          "total_frames": p.input_total_frames,
          "jobs": p.jobs.len(),
          "total_jobs": p.total_jobs,
          "status": p.status.to_string(),
          "size": p.scenes.values().map(|s| s.filesize).sum::<u64>(),
          "priority": p.priority,
        })
      })
      .collect::<Vec<Value>>()
  });
  Json(Value::Array(summaries))
}

async fn get_home(State(state): State<AppState>) -> Json<Value> {
  let versions = state.registry.versions();
  let (fph, fph_time) = state.registry.telemetry();
  let (projects, jobs) = state
    .registry
    .with_projects(|projects| {
      (
        projects.len(),
        projects.values().map(|p| p.jobs.len()).sum::<usize>(),
      )
    });
  Json(json!({
    "versions": {
      "libaom": versions.aom,
      "libvpx": versions.vpx,
      "dav1d": versions.dav1d,
    },
    "projects": projects,
    "jobs": jobs,
    "frames per hour": { "since": fph_time, "frames": fph },
  }))
}

async fn get_info(State(state): State<AppState>) -> Json<Value> {
  let versions = state.registry.versions();
  Json(json!({
    "encoders": {
      "aomenc": versions.aom,
      "vpxenc": versions.vpx,
    },
    "actions": actions::names(),
    "protocols": ["http-get"],
    "logs": ["error", "warn", "info", "debug", "trace"],
    "password": state.password.is_some(),
  }))
}

async fn list_directory(State(state): State<AppState>) -> Json<Value> {
  let dir = state.registry.working_dir().join("inputfiles");
  let mut names = Vec::new();
  if let Ok(mut entries) = tokio::fs::read_dir(&dir).await {
    while let Ok(Some(entry)) = entries.next_entry().await {
      names.push(entry.file_name().to_string_lossy().into_owned());
    }
  }
  names.sort();
  Json(json!(names))
}

fn json_password(content: &Value) -> Option<&str> {
  content.get("password").and_then(Value::as_str)
}

/// Reads an optional integer field. `Err` means the field is present but
/// not an integer.
fn json_integer(content: &Value, key: &str) -> Result<Option<i64>, ()> {
  match content.get(key) {
    None | Some(Value::Null) => Ok(None),
    Some(value) => value.as_i64().map(Some).ok_or(()),
  }
}

/// Reads an optional numeric field, truncating floats. `Err` means the
/// field is present but not a number.
fn json_number(content: &Value, key: &str) -> Result<Option<i64>, ()> {
  match content.get(key) {
    None | Some(Value::Null) => Ok(None),
    Some(value) => value
      .as_i64()
      .or_else(|| value.as_f64().map(|f| f as i64))
      .map(Some)
      .ok_or(()),
  }
}

async fn add_project(
  State(state): State<AppState>,
  Json(content): Json<Value>,
) -> Json<Value> {
  if !password_ok(&state, json_password(&content)) {
    return failure("Bad password.");
  }

  // presence and types are checked field by field so every rejection
  // answers with the uniform success/reason document
  let missing: Vec<&str> = ["input", "encoder", "encoder_params"]
    .iter()
    .filter(|key| content.get(**key).is_none())
    .copied()
    .collect();
  if !missing.is_empty() {
    return failure(format!("Missing fields {}", missing.join(",")));
  }

  let (Ok(min_frames), Ok(max_frames)) = (
    json_integer(&content, "min_frames"),
    json_integer(&content, "max_frames"),
  ) else {
    return failure("min_frames and max_frames must be of type integer");
  };
  let Ok(priority) = json_number(&content, "priority") else {
    return failure("priority must be a number");
  };

  let Some(input) = content["input"].as_array() else {
    return failure("input must be a list of file paths");
  };
  let mut inputs: Vec<String> = Vec::with_capacity(input.len());
  for item in input {
    match item.as_str() {
      Some(path) => inputs.push(path.to_owned()),
      None => return failure("input must be a list of file paths"),
    }
  }
  if inputs.is_empty() {
    return failure("input is empty");
  }

  let Some(encoder) = content["encoder"].as_str() else {
    return failure("encoder must be a string");
  };
  let Ok(encoder) = encoder.parse::<Encoder>() else {
    return failure(format!("unknown encoder {encoder}"));
  };
  let Some(encoder_params) = content["encoder_params"].as_str() else {
    return failure("encoder_params must be a string");
  };
  let encoder_params = encoder_params.to_owned();
  let ffmpeg_params = content
    .get("ffmpeg_params")
    .and_then(Value::as_str)
    .unwrap_or_default()
    .to_owned();
  let on_complete = content
    .get("on_complete")
    .and_then(Value::as_str)
    .unwrap_or_default()
    .to_owned();
  let grain = content.get("grain").and_then(Value::as_bool).unwrap_or(false);
  let prefix = content
    .get("id")
    .and_then(Value::as_str)
    .filter(|id| !id.is_empty())
    .map(str::to_owned);

  let missing_files: Vec<&str> = inputs
    .iter()
    .filter(|f| !std::path::Path::new(f.as_str()).is_file())
    .map(String::as_str)
    .collect();
  if !missing_files.is_empty() {
    return failure(format!(
      "Input files not found: {}",
      missing_files.join(",")
    ));
  }

  if let Some(prefix) = &prefix {
    let candidates: Vec<String> = if inputs.len() > 1 {
      (1..=inputs.len())
        .map(|i| format!("{prefix}{i:02}"))
        .collect()
    } else {
      vec![prefix.clone()]
    };
    let existing: Vec<String> = state.registry.with_projects(|projects| {
      candidates
        .iter()
        .filter(|id| projects.contains_key(*id))
        .cloned()
        .collect()
    });
    if !existing.is_empty() {
      return failure(format!(
        "Projects with ids {} already exist",
        existing.join(",")
      ));
    }
  }

  let registry = Arc::clone(&state.registry);
  let result = spawn_blocking(move || {
    for (i, input) in inputs.iter().enumerate() {
      info!(target: "net", "add project {input}");
      let id = prefix.as_ref().map(|prefix| {
        if inputs.len() > 1 {
          format!("{prefix}{:02}", i + 1)
        } else {
          prefix.clone()
        }
      });
      let project = Project::new(
        id,
        ProjectSettings {
          path_in: PathBuf::from(input),
          encoder,
          encoder_params: encoder_params.clone(),
          ffmpeg_params: ffmpeg_params.clone(),
          min_frames: min_frames.unwrap_or(-1),
          max_frames: max_frames.unwrap_or(-1),
          priority: priority.unwrap_or(0),
          on_complete: on_complete.clone(),
          grain,
        },
        registry.jobs_dir(),
      );
      registry.add_project(project, true);
    }
  })
  .await;

  match result {
    Ok(()) => Json(json!({ "success": true })),
    Err(_) => failure("failed to add project"),
  }
}

async fn modify_project(
  State(state): State<AppState>,
  Path(projectid): Path<String>,
  Json(changes): Json<Value>,
) -> Json<Value> {
  if !password_ok(&state, json_password(&changes)) {
    return failure("Bad password.");
  }
  let Ok(priority) = json_number(&changes, "priority") else {
    return failure("priority must be a number");
  };
  let on_complete = changes
    .get("on_complete")
    .and_then(Value::as_str)
    .map(str::to_owned);

  if state
    .registry
    .modify_project(&projectid, priority, on_complete)
  {
    Json(json!({ "success": true }))
  } else {
    failure("Project does not exist.")
  }
}

async fn delete_project(
  State(state): State<AppState>,
  Path(projectid): Path<String>,
  Json(content): Json<Value>,
) -> Json<Value> {
  if !password_ok(&state, json_password(&content)) {
    return failure("Bad password.");
  }
  if state.registry.delete_project(&projectid) {
    Json(json!({ "success": true }))
  } else {
    failure("Project does not exist.")
  }
}
