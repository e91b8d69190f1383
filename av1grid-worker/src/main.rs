use std::io::BufRead;
use std::process::exit;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use tracing::info;

use av1grid_core::client::{Client, ClientArgs, LocalVersions};
use av1grid_core::encoder::{aomenc_version, require_ffmpeg, vpxenc_version, ToolPaths};
use av1grid_core::logging::init_logging;

/// Worker client for distributed AV1 / VP9 scene encoding.
#[derive(Parser, Debug)]
#[command(name = "av1grid-worker", version)]
struct Args {
  /// Coordinator base URL
  #[arg(default_value = "http://localhost:7899")]
  target: String,

  /// Number of parallel encode workers
  #[arg(long, default_value_t = 1)]
  workers: usize,

  /// Threads per encoder process
  #[arg(long, default_value_t = 8)]
  threads: usize,

  /// Prefetch queue capacity; 0 disables prefetching
  #[arg(long, default_value_t = 0)]
  queue: usize,

  /// Path to aomenc
  #[arg(long, default_value = "aomenc")]
  aomenc: String,

  /// Path to vpxenc
  #[arg(long, default_value = "vpxenc")]
  vpxenc: String,

  /// Path to ffmpeg
  #[arg(long, default_value = "ffmpeg")]
  ffmpeg: String,

  /// VMAF model handed to aomenc when a job tunes for vmaf
  #[arg(long)]
  vmaf_model_path: Option<String>,

  /// Disable the interactive menu
  #[arg(long)]
  noui: bool,
}

fn main() {
  let args = Args::parse();
  init_logging("worker.log");

  let tools = ToolPaths {
    aomenc: args.aomenc.clone(),
    vpxenc: args.vpxenc.clone(),
    ffmpeg: args.ffmpeg.clone(),
  };

  let versions = match probe_tools(&tools) {
    Ok(versions) => versions,
    Err(e) => {
      eprintln!("{e}");
      exit(1);
    }
  };

  let client = match Client::new(
    ClientArgs {
      target: args.target,
      workers: args.workers,
      threads: args.threads,
      queue: args.queue,
      tools,
      vmaf_model_path: args.vmaf_model_path,
      noui: args.noui,
    },
    versions,
  ) {
    Ok(client) => client,
    Err(e) => {
      eprintln!("{e:#}");
      exit(1);
    }
  };

  info!("{}", client.summary());
  client.run();

  if !args.noui {
    spawn_menu(Arc::clone(&client));
  }

  if let Some(message) = client.wait_exit() {
    eprintln!("{message}");
    exit(1);
  }
}

fn probe_tools(tools: &ToolPaths) -> anyhow::Result<LocalVersions> {
  require_ffmpeg(&tools.ffmpeg)?;
  Ok(LocalVersions {
    aom: aomenc_version(&tools.aomenc)?,
    vpx: vpxenc_version(&tools.vpxenc)?,
  })
}

/// Line-oriented control menu on stdin: add / remove / kill / status /
/// quit.
fn spawn_menu(client: Arc<Client>) {
  thread::spawn(move || {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
      let Ok(line) = line else { break };
      match line.trim() {
        "add" => client.add_worker(),
        "remove" => client.remove_worker(),
        "kill" => client.kill_worker(),
        "status" => {
          println!("{}", client.summary());
          for (id, status) in client.worker_statuses() {
            println!("{id:2} {status}");
          }
        }
        "quit" => {
          client.stop(None);
          break;
        }
        "" => {}
        other => println!("unknown command {other:?} (add, remove, kill, status, quit)"),
      }
    }
  });
}
