//! The worker fleet core: a pool of parallel encode workers fed by a
//! bounded prefetch queue, with a single upload consumer retrying
//! failed uploads.
//!
//! One download producer tops the prefetch queue up to capacity (with
//! capacity zero, workers download their own jobs one at a time). Every
//! queue wait is condition-variable driven and checks the shutdown flag
//! on wakeup, so `stop` unblocks the whole fleet within a second.

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tempfile::TempPath;
use tracing::{debug, error, info, warn};

use crate::encoder::{self, EncodeParams, Encoder, ToolPaths};
use crate::registry::UploadOutcome;

#[derive(Debug, Clone)]
pub struct ClientArgs {
  /// Coordinator base URL.
  pub target: String,
  /// Initial number of encode workers.
  pub workers: usize,
  /// Threads handed to each encoder process.
  pub threads: usize,
  /// Prefetch queue capacity; 0 disables prefetching.
  pub queue: usize,
  pub tools: ToolPaths,
  pub vmaf_model_path: Option<String>,
  pub noui: bool,
}

/// Locally detected encoder versions, compared against the version the
/// coordinator advertises with every job.
#[derive(Debug, Clone)]
pub struct LocalVersions {
  pub aom: String,
  pub vpx: String,
}

impl LocalVersions {
  fn of(&self, encoder: Encoder) -> &str {
    match encoder {
      Encoder::aom => &self.aom,
      Encoder::vpx => &self.vpx,
    }
  }
}

/// A job as parsed from the coordinator's response headers.
#[derive(Debug, Clone)]
pub struct RemoteJob {
  /// Worker id the coordinator minted for this assignment.
  pub id: String,
  pub projectid: String,
  pub filename: String,
  pub scene: String,
  pub encoder: Encoder,
  pub encoder_params: String,
  pub ffmpeg_params: String,
  pub version: String,
  pub start: usize,
  pub frames: usize,
  pub grain: bool,
}

fn header<'a>(headers: &'a reqwest::header::HeaderMap, name: &str) -> anyhow::Result<&'a str> {
  headers
    .get(name)
    .and_then(|v| v.to_str().ok())
    .with_context(|| format!("missing job header {name}"))
}

impl RemoteJob {
  fn from_headers(headers: &reqwest::header::HeaderMap) -> anyhow::Result<RemoteJob> {
    Ok(RemoteJob {
      id: header(headers, "id")?.to_owned(),
      projectid: header(headers, "projectid")?.to_owned(),
      filename: header(headers, "filename")?.to_owned(),
      scene: header(headers, "scene")?.to_owned(),
      encoder: header(headers, "encoder")?
        .parse()
        .map_err(|_| anyhow::anyhow!("unknown encoder"))?,
      encoder_params: header(headers, "encoder_params")?.to_owned(),
      ffmpeg_params: header(headers, "ffmpeg_params")?.to_owned(),
      version: header(headers, "version")?.to_owned(),
      start: header(headers, "start")?.parse()?,
      frames: header(headers, "frames")?.parse()?,
      grain: header(headers, "grain")? != "0",
    })
  }
}

/// A downloaded job: the metadata plus the segment staged on disk. The
/// temp file disappears when the job is dropped.
pub struct FetchedJob {
  pub job: RemoteJob,
  pub file: TempPath,
}

pub enum Popped {
  Job(FetchedJob),
  Empty,
  Closed,
}

/// Bounded buffer of downloaded-but-not-yet-encoded jobs. The producer
/// parks on `space`, consumers park on `available`; closing wakes
/// everyone.
pub struct PrefetchQueue {
  capacity: usize,
  inner: Mutex<VecDeque<FetchedJob>>,
  available: Condvar,
  space: Condvar,
  closed: AtomicBool,
}

impl PrefetchQueue {
  pub fn new(capacity: usize) -> PrefetchQueue {
    PrefetchQueue {
      capacity,
      inner: Mutex::new(VecDeque::new()),
      available: Condvar::new(),
      space: Condvar::new(),
      closed: AtomicBool::new(false),
    }
  }

  pub fn len(&self) -> usize {
    self.inner.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Parks the producer until the queue has room. Returns false once the
  /// queue is closed.
  pub fn wait_for_space(&self) -> bool {
    let mut inner = self.inner.lock();
    while !self.closed.load(Ordering::SeqCst) && inner.len() >= self.capacity {
      self.space.wait(&mut inner);
    }
    !self.closed.load(Ordering::SeqCst)
  }

  pub fn push(&self, fetched: FetchedJob) {
    self.inner.lock().push_back(fetched);
    self.available.notify_one();
  }

  /// Takes the next job, waiting up to `timeout`. `Empty` lets the
  /// caller re-check its own retirement conditions between waits.
  pub fn pop_wait(&self, timeout: Duration) -> Popped {
    let mut inner = self.inner.lock();
    loop {
      if self.closed.load(Ordering::SeqCst) {
        return Popped::Closed;
      }
      if let Some(fetched) = inner.pop_front() {
        self.space.notify_all();
        return Popped::Job(fetched);
      }
      if self.available.wait_for(&mut inner, timeout).timed_out() {
        return Popped::Empty;
      }
    }
  }

  pub fn close(&self) {
    self.closed.store(true, Ordering::SeqCst);
    self.available.notify_all();
    self.space.notify_all();
  }

  pub fn drain(&self) -> Vec<FetchedJob> {
    self.inner.lock().drain(..).collect()
  }

  fn held(&self) -> Vec<(String, String)> {
    self
      .inner
      .lock()
      .iter()
      .map(|f| (f.job.projectid.clone(), f.job.scene.clone()))
      .collect()
  }
}

/// One encode worker: a thread plus the state the menu and the killer
/// need to see from outside.
pub struct WorkerHandle {
  pub id: usize,
  status: Mutex<String>,
  job: Mutex<Option<RemoteJob>>,
  pipe: Mutex<Option<Child>>,
  progress: Mutex<(u8, u64)>,
  stopped: AtomicBool,
  downloading: AtomicBool,
}

impl WorkerHandle {
  fn new(id: usize) -> WorkerHandle {
    WorkerHandle {
      id,
      status: Mutex::new(String::new()),
      job: Mutex::new(None),
      pipe: Mutex::new(None),
      progress: Mutex::new((0, 0)),
      stopped: AtomicBool::new(false),
      downloading: AtomicBool::new(false),
    }
  }

  pub fn status(&self) -> String {
    self.status.lock().clone()
  }

  fn set_status(&self, status: impl Into<String>) {
    if self.stopped.load(Ordering::SeqCst) {
      return;
    }
    *self.status.lock() = status.into();
  }

  /// Stops this worker: flags it, signals a running encode child and
  /// returns a held job to the coordinator.
  fn kill(&self, client: &Client) {
    self.stopped.store(true, Ordering::SeqCst);
    if let Some(child) = self.pipe.lock().as_mut() {
      let _ = child.kill();
    }
    let job = self.job.lock().clone();
    if let Some(job) = job {
      client.cancel_job(&job);
    }
  }
}

enum UploadMsg {
  Item(RemoteJob, PathBuf),
  Shutdown,
}

struct ExitState {
  done: bool,
  message: Option<String>,
}

pub struct Client {
  pub args: ClientArgs,
  versions: LocalVersions,
  /// Short-timeout client for metadata calls.
  http: reqwest::blocking::Client,
  /// Unbounded-timeout client for bulk transfer.
  transfer: reqwest::blocking::Client,
  queue: PrefetchQueue,
  workers: Mutex<Vec<Arc<WorkerHandle>>>,
  handles: Mutex<Vec<JoinHandle<()>>>,
  target_workers: AtomicUsize,
  next_worker_id: AtomicUsize,
  upload_tx: Sender<UploadMsg>,
  upload_rx: Mutex<Option<Receiver<UploadMsg>>>,
  pending_uploads: Mutex<Vec<(String, String)>>,
  pub completed: AtomicUsize,
  pub failed: AtomicUsize,
  stopping: AtomicBool,
  /// Serializes job fetches so the held list is always current when the
  /// next fetch goes out.
  download_gate: Mutex<()>,
  idle_mx: Mutex<()>,
  idle_cv: Condvar,
  exit: Mutex<ExitState>,
  exit_cv: Condvar,
}

impl Client {
  pub fn new(args: ClientArgs, versions: LocalVersions) -> anyhow::Result<Arc<Client>> {
    let http = reqwest::blocking::Client::builder()
      .timeout(Duration::from_secs(3))
      .build()
      .context("failed to build HTTP client")?;
    let transfer = reqwest::blocking::Client::builder()
      .timeout(None)
      .connect_timeout(Duration::from_secs(3))
      .build()
      .context("failed to build HTTP transfer client")?;

    let (upload_tx, upload_rx) = unbounded();

    Ok(Arc::new(Client {
      queue: PrefetchQueue::new(args.queue),
      args,
      versions,
      http,
      transfer,
      workers: Mutex::new(Vec::new()),
      handles: Mutex::new(Vec::new()),
      target_workers: AtomicUsize::new(0),
      next_worker_id: AtomicUsize::new(0),
      upload_tx,
      upload_rx: Mutex::new(Some(upload_rx)),
      pending_uploads: Mutex::new(Vec::new()),
      completed: AtomicUsize::new(0),
      failed: AtomicUsize::new(0),
      stopping: AtomicBool::new(false),
      download_gate: Mutex::new(()),
      idle_mx: Mutex::new(()),
      idle_cv: Condvar::new(),
      exit: Mutex::new(ExitState {
        done: false,
        message: None,
      }),
      exit_cv: Condvar::new(),
    }))
  }

  /// Spawns the upload consumer, the download producer (when prefetching
  /// is enabled) and the initial worker pool.
  pub fn run(self: &Arc<Self>) {
    let upload_rx = self.upload_rx.lock().take().expect("client already running");
    let client = Arc::clone(self);
    self
      .handles
      .lock()
      .push(thread::spawn(move || client.upload_loop(upload_rx)));

    if self.args.queue > 0 {
      let client = Arc::clone(self);
      self
        .handles
        .lock()
        .push(thread::spawn(move || client.download_loop()));
    }

    for _ in 0..self.args.workers {
      self.add_worker();
    }
  }

  pub fn add_worker(self: &Arc<Self>) {
    if self.stopping.load(Ordering::SeqCst) {
      return;
    }
    let id = self.next_worker_id.fetch_add(1, Ordering::SeqCst) + 1;
    let handle = Arc::new(WorkerHandle::new(id));
    self.workers.lock().push(Arc::clone(&handle));
    self.target_workers.fetch_add(1, Ordering::SeqCst);

    let client = Arc::clone(self);
    let thread = thread::spawn(move || client.worker_loop(handle));
    self.handles.lock().push(thread);
  }

  /// Lowers the target worker count; an idle worker retires on its next
  /// wait.
  pub fn remove_worker(&self) {
    let _ = self
      .target_workers
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
        Some(n.saturating_sub(1))
      });
    self.idle_cv.notify_all();
  }

  /// Force-terminates the worker least far along, measured by
  /// `(has_pipe, progress, has_job, downloading)` ascending.
  pub fn kill_worker(&self) {
    let victim = {
      let workers = self.workers.lock();
      workers
        .iter()
        .filter(|w| !w.stopped.load(Ordering::SeqCst))
        .min_by_key(|w| {
          (
            w.pipe.lock().is_some() as u8,
            *w.progress.lock(),
            w.job.lock().is_some() as u8,
            w.downloading.load(Ordering::SeqCst) as u8,
          )
        })
        .cloned()
    };
    if let Some(victim) = victim {
      let _ = self
        .target_workers
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
          Some(n.saturating_sub(1))
        });
      *victim.status.lock() = "killing".to_owned();
      victim.kill(self);
      self.idle_cv.notify_all();
    }
  }

  /// Broadcast shutdown: flags every loop, kills children, returns held
  /// jobs and wakes all waiters.
  pub fn stop(&self, message: Option<String>) {
    if self.stopping.swap(true, Ordering::SeqCst) {
      return;
    }

    let workers: Vec<Arc<WorkerHandle>> = self.workers.lock().clone();
    for worker in workers {
      worker.kill(self);
    }

    self.queue.close();
    for fetched in self.queue.drain() {
      self.cancel_job(&fetched.job);
      // dropping the job removes its staged segment
    }

    self.idle_cv.notify_all();
    let _ = self.upload_tx.send(UploadMsg::Shutdown);

    let mut exit = self.exit.lock();
    exit.done = true;
    if exit.message.is_none() {
      exit.message = message;
    }
    self.exit_cv.notify_all();
  }

  /// Blocks until `stop` fires, joins the fleet and hands back the exit
  /// message (set on fatal shutdowns like an encoder version mismatch).
  pub fn wait_exit(&self) -> Option<String> {
    let mut exit = self.exit.lock();
    while !exit.done {
      self.exit_cv.wait(&mut exit);
    }
    let message = exit.message.clone();
    drop(exit);

    let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
    for handle in handles {
      let _ = handle.join();
    }
    message
  }

  pub fn summary(&self) -> String {
    format!(
      "target: {} workers: {} hit: {} miss: {} uploading: {}",
      self.args.target,
      self.target_workers.load(Ordering::SeqCst),
      self.completed.load(Ordering::SeqCst),
      self.failed.load(Ordering::SeqCst),
      self.pending_uploads.lock().len(),
    )
  }

  pub fn worker_statuses(&self) -> Vec<(usize, String)> {
    self
      .workers
      .lock()
      .iter()
      .map(|w| (w.id, w.status()))
      .collect()
  }

  /// Retires this worker when it was stopped, the client is shutting
  /// down, or the pool shrank below the live worker count. Removal
  /// happens under the pool lock so only the excess workers leave.
  fn try_retire(&self, handle: &Arc<WorkerHandle>) -> bool {
    let mut workers = self.workers.lock();
    let excess = workers.len() > self.target_workers.load(Ordering::SeqCst);
    if handle.stopped.load(Ordering::SeqCst) || self.stopping.load(Ordering::SeqCst) || excess {
      if let Some(pos) = workers.iter().position(|w| Arc::ptr_eq(w, handle)) {
        workers.remove(pos);
      }
      return true;
    }
    false
  }

  fn detach(&self, handle: &Arc<WorkerHandle>) {
    let mut workers = self.workers.lock();
    if let Some(pos) = workers.iter().position(|w| Arc::ptr_eq(w, handle)) {
      workers.remove(pos);
    }
  }

  fn worker_loop(self: Arc<Self>, handle: Arc<WorkerHandle>) {
    loop {
      handle.set_status("waiting");
      if self.try_retire(&handle) {
        return;
      }

      let fetched = if self.args.queue > 0 {
        match self.queue.pop_wait(Duration::from_secs(1)) {
          Popped::Job(fetched) => fetched,
          Popped::Empty => continue,
          Popped::Closed => break,
        }
      } else {
        match self.direct_fetch(&handle) {
          Some(fetched) => fetched,
          None => break,
        }
      };

      let job = fetched.job.clone();
      *handle.job.lock() = Some(job.clone());
      handle.set_status(format!("received {} {}", job.projectid, job.scene));
      info!("worker {} received {} {}", handle.id, job.projectid, job.scene);

      match self.encode_one(&handle, &fetched) {
        Ok(output) => {
          self
            .pending_uploads
            .lock()
            .push((job.projectid.clone(), job.scene.clone()));
          let _ = self.upload_tx.send(UploadMsg::Item(job, output));
        }
        Err(e) => {
          if !handle.stopped.load(Ordering::SeqCst) {
            warn!(
              "worker {} failed {} {}: {e:#}",
              handle.id, job.projectid, job.scene
            );
            self.cancel_job(&job);
          }
        }
      }

      *handle.job.lock() = None;
      *handle.progress.lock() = (0, 0);
      // fetched drops here, removing the staged segment
    }
    self.detach(&handle);
  }

  /// Prefetch-less acquisition: fetch and download inline, polling every
  /// second for up to 15 s between empty responses.
  fn direct_fetch(&self, handle: &Arc<WorkerHandle>) -> Option<FetchedJob> {
    loop {
      if self.try_retire(handle) {
        return None;
      }

      handle.downloading.store(true, Ordering::SeqCst);
      handle.set_status("downloading");
      let result = self.fetch_and_download();
      handle.downloading.store(false, Ordering::SeqCst);

      match result {
        Ok(Some(fetched)) => return Some(fetched),
        Ok(None) => {}
        Err(e) => debug!("job fetch failed: {e:#}"),
      }

      for remaining in (1..=15u32).rev() {
        if self.try_retire(handle) {
          return None;
        }
        handle.set_status(format!("waiting...{remaining:2}"));
        self.idle_sleep(Duration::from_secs(1));
      }
    }
  }

  /// The single producer that keeps the prefetch queue topped up.
  fn download_loop(self: Arc<Self>) {
    while self.queue.wait_for_space() {
      if self.stopping.load(Ordering::SeqCst) {
        break;
      }
      match self.fetch_and_download() {
        Ok(Some(fetched)) => self.queue.push(fetched),
        Ok(None) => self.idle_poll(),
        Err(e) => {
          debug!("job fetch failed: {e:#}");
          self.idle_poll();
        }
      }
    }
  }

  fn idle_poll(&self) {
    for _ in 0..15 {
      if self.stopping.load(Ordering::SeqCst) {
        return;
      }
      self.idle_sleep(Duration::from_secs(1));
    }
  }

  fn idle_sleep(&self, duration: Duration) {
    let mut guard = self.idle_mx.lock();
    self.idle_cv.wait_for(&mut guard, duration);
  }

  /// Asks the coordinator for a job, excluding every scene this client
  /// already holds, and stages the segment body on disk. `Ok(None)`
  /// means empty dispatch (or a version-mismatch shutdown).
  fn fetch_and_download(&self) -> anyhow::Result<Option<FetchedJob>> {
    let _gate = self.download_gate.lock();

    let url = format!(
      "{}/api/get_job/{}",
      self.args.target.trim_end_matches('/'),
      self.held_scenes()
    );
    let mut resp = self.transfer.get(&url).send()?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
      return Ok(None);
    }
    if !resp.status().is_success() {
      bail!("get_job returned {}", resp.status());
    }

    let job = RemoteJob::from_headers(resp.headers())?;

    if job.version != self.versions.of(job.encoder) {
      self.cancel_job(&job);
      self.stop(Some(format!(
        "bad {} version. have: {} required: {}",
        job.encoder,
        self.versions.of(job.encoder),
        job.version
      )));
      return Ok(None);
    }

    let mut file = tempfile::Builder::new()
      .prefix("av1grid-")
      .suffix(&format!("-{}", job.filename))
      .tempfile_in(".")
      .context("failed to stage segment")?;
    resp
      .copy_to(&mut file)
      .context("segment download failed")?;
    file.flush()?;

    Ok(Some(FetchedJob {
      job,
      file: file.into_temp_path(),
    }))
  }

  /// Every scene this client holds anywhere: active workers, the
  /// prefetch queue and queued or in-flight uploads.
  fn held_scenes(&self) -> String {
    let mut held: Vec<(String, String)> = Vec::new();
    for worker in self.workers.lock().iter() {
      if let Some(job) = worker.job.lock().as_ref() {
        held.push((job.projectid.clone(), job.scene.clone()));
      }
    }
    held.extend(self.queue.held());
    held.extend(self.pending_uploads.lock().iter().cloned());

    let entries: Vec<serde_json::Value> = held
      .iter()
      .map(|(projectid, scene)| serde_json::json!({ "projectid": projectid, "scene": scene }))
      .collect();
    serde_json::Value::Array(entries).to_string()
  }

  pub fn cancel_job(&self, job: &RemoteJob) {
    let url = format!("{}/cancel_job", self.args.target.trim_end_matches('/'));
    let _ = self
      .http
      .post(&url)
      .form(&[
        ("client", job.id.as_str()),
        ("projectid", job.projectid.as_str()),
        ("scene", job.scene.as_str()),
      ])
      .send();
  }

  fn fetch_grain_table(&self, job: &RemoteJob) -> anyhow::Result<TempPath> {
    let url = format!(
      "{}/api/get_grain/{}/{}",
      self.args.target.trim_end_matches('/'),
      job.projectid,
      job.scene
    );
    let mut resp = self.transfer.get(&url).send()?;
    if !resp.status().is_success() {
      bail!("grain table not available for {} {}", job.projectid, job.scene);
    }
    let mut file = tempfile::Builder::new()
      .prefix("grain-")
      .suffix(".table")
      .tempfile_in(".")
      .context("failed to stage grain table")?;
    resp.copy_to(&mut file)?;
    file.flush()?;
    Ok(file.into_temp_path())
  }

  fn encode_one(&self, handle: &WorkerHandle, fetched: &FetchedJob) -> anyhow::Result<PathBuf> {
    let job = &fetched.job;
    let grain_table = if job.grain {
      Some(self.fetch_grain_table(job)?)
    } else {
      None
    };

    let encoder_name = job.encoder.to_string();
    let total = job.frames;
    encoder::encode_scene(
      &EncodeParams {
        tools: &self.args.tools,
        threads: self.args.threads,
        vmaf_model: self.args.vmaf_model_path.as_deref(),
        encoder: job.encoder,
        input: &fetched.file,
        start: job.start,
        frames: job.frames,
        encoder_params: &job.encoder_params,
        ffmpeg_params: &job.ffmpeg_params,
        grain_table: grain_table.as_deref(),
      },
      &handle.pipe,
      &handle.stopped,
      |pass, frame| {
        *handle.progress.lock() = (pass, frame);
        handle.set_status(format!("{encoder_name} pass: {pass} {frame}/{total}"));
      },
    )
  }

  /// The single upload consumer. `bad upload` responses retry up to 3
  /// times, transport failures up to 10, with a second of backoff; any
  /// other rejection discards the upload.
  fn upload_loop(self: Arc<Self>, upload_rx: Receiver<UploadMsg>) {
    for msg in upload_rx {
      let (job, output) = match msg {
        UploadMsg::Item(job, output) => (job, output),
        UploadMsg::Shutdown => break,
      };

      let mut bad_uploads = 3u32;
      let mut transport = 10u32;
      loop {
        if self.stopping.load(Ordering::SeqCst) {
          break;
        }
        match self.upload(&job, &output) {
          Ok(body) => match body.trim().parse::<UploadOutcome>() {
            Ok(UploadOutcome::Saved) => {
              self.completed.fetch_add(1, Ordering::SeqCst);
              info!("saved {} {}", job.projectid, job.scene);
              break;
            }
            Ok(UploadOutcome::BadUpload) if bad_uploads > 0 => {
              bad_uploads -= 1;
              warn!("bad upload, retrying {} {}", job.projectid, job.scene);
              thread::sleep(Duration::from_secs(1));
            }
            _ => {
              self.failed.fetch_add(1, Ordering::SeqCst);
              warn!(
                "upload rejected: {} {} {}",
                body.trim(),
                job.projectid,
                job.scene
              );
              break;
            }
          },
          Err(e) => {
            if transport == 0 {
              self.failed.fetch_add(1, Ordering::SeqCst);
              error!("upload failed {} {}: {e:#}", job.projectid, job.scene);
              break;
            }
            transport -= 1;
            debug!("unable to connect, trying again");
            thread::sleep(Duration::from_secs(1));
          }
        }
      }

      {
        let mut pending = self.pending_uploads.lock();
        if let Some(pos) = pending
          .iter()
          .position(|(p, s)| *p == job.projectid && *s == job.scene)
        {
          pending.remove(pos);
        }
      }
      let _ = std::fs::remove_file(&output);
    }
  }

  fn upload(&self, job: &RemoteJob, output: &Path) -> anyhow::Result<String> {
    let form = reqwest::blocking::multipart::Form::new()
      .text("client", job.id.clone())
      .text("scene", job.scene.clone())
      .text("projectid", job.projectid.clone())
      .text("encoder", job.encoder.to_string())
      .text("version", self.versions.of(job.encoder).to_owned())
      .text("encoder_params", job.encoder_params.clone())
      .text("ffmpeg_params", job.ffmpeg_params.clone())
      .text("grain", if job.grain { "1" } else { "0" })
      .part(
        "file",
        reqwest::blocking::multipart::Part::file(output)?
          .file_name(format!("{}.ivf", job.scene))
          .mime_str("application/octet-stream")?,
      );

    let url = format!("{}/finish_job", self.args.target.trim_end_matches('/'));
    let resp = self.transfer.post(&url).multipart(form).send()?;
    Ok(resp.text()?)
  }
}
