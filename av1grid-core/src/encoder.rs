//! The closed encoder set and everything that talks to the encoder
//! binaries: version probing, two-pass command composition, the piped
//! encode runner and the reference-decoder verification.

#[cfg(test)]
mod tests;

use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Context};
use parking_lot::Mutex;
use std::io::BufRead;
use thiserror::Error;

use crate::parse;
use crate::regex;

#[allow(non_camel_case_types)]
#[derive(
  PartialEq,
  Eq,
  Hash,
  Copy,
  Clone,
  Debug,
  serde::Serialize,
  serde::Deserialize,
  strum::EnumString,
  strum::IntoStaticStr,
)]
pub enum Encoder {
  #[strum(serialize = "aom")]
  #[serde(rename = "aom")]
  aom,
  #[strum(serialize = "vpx")]
  #[serde(rename = "vpx")]
  vpx,
}

impl std::fmt::Display for Encoder {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(<&'static str>::from(self))
  }
}

/// Paths to the external tools a worker shells out to.
#[derive(Debug, Clone)]
pub struct ToolPaths {
  pub aomenc: String,
  pub vpxenc: String,
  pub ffmpeg: String,
}

impl Default for ToolPaths {
  fn default() -> Self {
    ToolPaths {
      aomenc: "aomenc".to_owned(),
      vpxenc: "vpxenc".to_owned(),
      ffmpeg: "ffmpeg".to_owned(),
    }
  }
}

impl Encoder {
  pub fn tool_path<'a>(&self, tools: &'a ToolPaths) -> &'a str {
    match self {
      Encoder::aom => &tools.aomenc,
      Encoder::vpx => &tools.vpxenc,
    }
  }
}

/// Coordinator-side tool versions, also served to workers for the
/// dispatch-time version check.
#[derive(Debug, Clone)]
pub struct Versions {
  pub aom: String,
  pub vpx: String,
  pub dav1d: String,
}

impl Versions {
  pub fn of(&self, encoder: Encoder) -> &str {
    match encoder {
      Encoder::aom => &self.aom,
      Encoder::vpx => &self.vpx,
    }
  }
}

fn help_output(path: &str) -> anyhow::Result<String> {
  which::which(path).map_err(|_| anyhow::anyhow!("{path} not found"))?;
  let out = Command::new(path)
    .arg("--help")
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .output()
    .with_context(|| format!("failed to run {path}"))?;
  Ok(format!(
    "{}{}",
    String::from_utf8_lossy(&out.stdout),
    String::from_utf8_lossy(&out.stderr)
  ))
}

pub fn aomenc_version(path: &str) -> anyhow::Result<String> {
  parse::parse_encoder_version(Encoder::aom, &help_output(path)?)
    .with_context(|| format!("unable to parse aomenc version from {path}"))
}

pub fn vpxenc_version(path: &str) -> anyhow::Result<String> {
  parse::parse_encoder_version(Encoder::vpx, &help_output(path)?)
    .with_context(|| format!("unable to parse vpxenc version from {path}"))
}

pub fn dav1d_version() -> anyhow::Result<String> {
  which::which("dav1d").map_err(|_| anyhow::anyhow!("dav1d not found"))?;
  let out = Command::new("dav1d")
    .arg("-v")
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .output()
    .context("failed to run dav1d")?;
  Ok(format!(
    "{}{}",
    String::from_utf8_lossy(&out.stdout).trim(),
    String::from_utf8_lossy(&out.stderr).trim()
  ))
}

pub fn require_ffmpeg(path: &str) -> anyhow::Result<()> {
  which::which(path).map_err(|_| anyhow::anyhow!("{path} not found"))?;
  Ok(())
}

/// Probes every tool the coordinator needs. A missing tool is fatal at
/// startup.
pub fn probe_coordinator_tools() -> anyhow::Result<Versions> {
  require_ffmpeg("ffmpeg")?;
  Ok(Versions {
    aom: aomenc_version("aomenc")?,
    vpx: vpxenc_version("vpxenc")?,
    dav1d: dav1d_version()?,
  })
}

/// Decodes an uploaded aom scene end to end with the reference decoder.
/// Returns the decoded frame count, or `None` when the file does not
/// decode cleanly.
pub fn dav1d_decode_check(file: &Path) -> anyhow::Result<Option<usize>> {
  let out = Command::new("dav1d")
    .arg("-i")
    .arg(file)
    .args(["-o", null_device(), "--framethreads", "1", "--tilethreads", "16"])
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .output()
    .context("failed to run dav1d")?;

  if !out.status.success() {
    return Ok(None);
  }

  let text = format!(
    "{}{}",
    String::from_utf8_lossy(&out.stdout),
    String::from_utf8_lossy(&out.stderr)
  );
  Ok(parse::parse_dav1d_decoded(&text))
}

fn null_device() -> &'static str {
  if cfg!(windows) {
    "NUL"
  } else {
    "/dev/null"
  }
}

/// Builds the decoded-source command: ffmpeg decoding the segment into a
/// yuv4mpegpipe, with the scene window selected by frame offset and
/// count. An operator `-vf` is appended after the selection filter.
pub fn compose_source_cmd(
  ffmpeg: &str,
  input: &Path,
  start: usize,
  frames: usize,
  ffmpeg_params: &str,
) -> Vec<String> {
  let (user_vf, remaining) = parse::extract_video_filter(ffmpeg_params);
  let mut vf = format!(r"select=gte(n\,{start})");
  if let Some(user_vf) = user_vf {
    vf.push(',');
    vf.push_str(&user_vf);
  }

  let mut cmd: Vec<String> = crate::into_vec![
    ffmpeg,
    "-y",
    "-hide_banner",
    "-loglevel",
    "error",
    "-i",
    input.display().to_string(),
    "-strict",
    "-1",
    "-pix_fmt",
    "yuv420p",
    "-vf",
    vf,
    "-vframes",
    frames.to_string(),
  ];
  cmd.extend(remaining.split_whitespace().map(str::to_owned));
  cmd.extend(["-f".to_owned(), "yuv4mpegpipe".to_owned(), "-".to_owned()]);
  cmd
}

/// Builds the two encoder invocations. `--denoise-noise-level` only has
/// meaning on the second pass and is stripped from the first; the grain
/// table is likewise a second-pass argument.
pub fn compose_encoder_passes(
  encoder: Encoder,
  tools: &ToolPaths,
  threads: usize,
  encoder_params: &str,
  fpf: &str,
  output: &Path,
  vmaf_model: Option<&str>,
  grain_table: Option<&Path>,
) -> [Vec<String>; 2] {
  let mut params = encoder_params.trim().to_owned();
  if encoder == Encoder::aom && params.contains("vmaf") {
    if let Some(model) = vmaf_model {
      params.push_str(&format!(" --vmaf-model-path={model}"));
    }
  }

  let base: Vec<String> = crate::into_vec![
    encoder.tool_path(tools),
    "-",
    "--ivf",
    format!("--fpf={fpf}"),
    format!("--threads={threads}"),
    "--passes=2",
  ];

  let first_pass_params = regex!(r"--denoise-noise-level=[0-9]+").replace_all(&params, "");

  let mut pass1 = base.clone();
  pass1.extend(first_pass_params.split_whitespace().map(str::to_owned));
  pass1.extend(["--pass=1".to_owned(), "-o".to_owned(), null_device().to_owned()]);

  let mut pass2 = base;
  pass2.extend(params.split_whitespace().map(str::to_owned));
  if let Some(table) = grain_table {
    pass2.push(format!("--film-grain-table={}", table.display()));
  }
  pass2.extend([
    "--pass=2".to_owned(),
    "-o".to_owned(),
    output.display().to_string(),
  ]);

  [pass1, pass2]
}

#[derive(Error, Debug)]
#[error("encoder crashed: {exit_status}\n{stderr}")]
pub struct EncoderCrash {
  pub exit_status: ExitStatus,
  pub stderr: String,
}

/// Everything needed to encode one scene.
pub struct EncodeParams<'a> {
  pub tools: &'a ToolPaths,
  pub threads: usize,
  pub vmaf_model: Option<&'a str>,
  pub encoder: Encoder,
  pub input: &'a Path,
  pub start: usize,
  pub frames: usize,
  pub encoder_params: &'a str,
  pub ffmpeg_params: &'a str,
  pub grain_table: Option<&'a Path>,
}

/// Runs the two-pass pipeline for one scene: ffmpeg decodes the segment
/// into a pipe feeding the encoder, progress is parsed from the encoder's
/// stderr, and the `.ivf` output lands next to the input.
///
/// The running encoder child is published through `pipe_slot` so that a
/// kill from another thread can signal it; `stopped` aborts between and
/// during passes.
pub fn encode_scene(
  params: &EncodeParams<'_>,
  pipe_slot: &Mutex<Option<Child>>,
  stopped: &AtomicBool,
  mut on_progress: impl FnMut(u8, u64),
) -> anyhow::Result<PathBuf> {
  let output = PathBuf::from(format!("{}.ivf", params.input.display()));
  let fpf = format!("{}.log", params.input.display());

  let source_cmd = compose_source_cmd(
    &params.tools.ffmpeg,
    params.input,
    params.start,
    params.frames,
    params.ffmpeg_params,
  );
  let passes = compose_encoder_passes(
    params.encoder,
    params.tools,
    params.threads,
    params.encoder_params,
    &fpf,
    &output,
    params.vmaf_model,
    params.grain_table,
  );

  let result = run_passes(&source_cmd, &passes, pipe_slot, stopped, &mut on_progress);

  let _ = std::fs::remove_file(&fpf);
  if result.is_err() {
    let _ = std::fs::remove_file(&output);
  }
  result.map(|()| output)
}

fn run_passes(
  source_cmd: &[String],
  passes: &[Vec<String>; 2],
  pipe_slot: &Mutex<Option<Child>>,
  stopped: &AtomicBool,
  on_progress: &mut dyn FnMut(u8, u64),
) -> anyhow::Result<()> {
  for (pass_n, enc_cmd) in (1u8..).zip(passes.iter()) {
    if stopped.load(Ordering::SeqCst) {
      bail!("worker stopped");
    }

    let mut source = match &source_cmd[..] {
      [program, args @ ..] => Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("failed to spawn ffmpeg")?,
      [] => unreachable!(),
    };

    let mut enc = match &enc_cmd[..] {
      [program, args @ ..] => Command::new(program)
        .args(args)
        .stdin(Stdio::from(source.stdout.take().unwrap()))
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to spawn encoder")?,
      [] => unreachable!(),
    };

    let stderr = enc.stderr.take().unwrap();
    *pipe_slot.lock() = Some(enc);

    let mut tail = String::new();
    let mut reader = std::io::BufReader::new(stderr);
    let mut buf = Vec::with_capacity(256);
    loop {
      buf.clear();
      let read = reader.read_until(b'\r', &mut buf)?;
      if read == 0 {
        break;
      }
      let line = String::from_utf8_lossy(&buf);
      if let Some(frame) = parse::parse_aom_vpx_frames(&line) {
        on_progress(pass_n, frame);
      }
      tail = line.trim().to_owned();
    }

    let status = match pipe_slot.lock().take() {
      Some(mut enc) => enc.wait()?,
      // a concurrent kill should not leave the child behind
      None => bail!("worker stopped"),
    };

    let _ = source.kill();
    let _ = source.wait();

    if stopped.load(Ordering::SeqCst) {
      bail!("worker stopped");
    }
    if !status.success() {
      return Err(
        EncoderCrash {
          exit_status: status,
          stderr: tail,
        }
        .into(),
      );
    }
  }

  Ok(())
}
