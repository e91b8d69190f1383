//! Post-completion actions, fired from the action queue once a project's
//! output has been concatenated.

use std::fs;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context};
use tracing::info;

use crate::ffmpeg;

/// Snapshot of the completed project handed to an action.
#[derive(Debug, Clone)]
pub struct ActionContext {
  pub projectid: String,
  pub path_in: PathBuf,
  pub path_out: PathBuf,
  pub total_frames: usize,
  pub working_dir: PathBuf,
}

pub fn names() -> Vec<&'static str> {
  vec!["merge"]
}

pub fn run(name: &str, ctx: &ActionContext) -> anyhow::Result<()> {
  match name {
    "merge" => merge(ctx),
    other => bail!("unknown action {other}"),
  }
}

/// Muxes the encoded video with the source's audio track into
/// `merged/<input-stem>.mkv`.
fn merge(ctx: &ActionContext) -> anyhow::Result<()> {
  let out_dir = ctx.working_dir.join("merged");
  fs::create_dir_all(&out_dir).with_context(|| format!("failed to create {}", out_dir.display()))?;

  let stem = ctx
    .path_in
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .unwrap_or_else(|| ctx.projectid.clone());
  let output = out_dir.join(format!("{stem}.mkv"));

  info!(target: "project", "{} merging", ctx.projectid);

  let mut cmd = Command::new("ffmpeg");
  cmd.args(["-y", "-i"]);
  cmd.arg(&ctx.path_out);
  cmd.arg("-i");
  cmd.arg(&ctx.path_in);
  cmd.args([
    "-map_metadata",
    "-1",
    "-map",
    "0:v:0",
    "-map",
    "1:a:0",
    "-c:v",
    "copy",
    "-c:a",
    "copy",
  ]);
  cmd.arg(&output);

  let projectid = ctx.projectid.clone();
  let total_frames = ctx.total_frames;
  ffmpeg::run(cmd, move |frame| {
    info!(target: "project", "{projectid} merging {frame}/{total_frames}");
  })
}
