mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::info;

use av1grid_core::encoder::probe_coordinator_tools;
use av1grid_core::logging::init_logging;
use av1grid_core::registry::Registry;

/// Coordinator for distributed AV1 / VP9 scene encoding.
#[derive(Parser, Debug)]
#[command(name = "av1grid-coordinator", version)]
struct Args {
  /// Port to listen on
  #[arg(long, default_value_t = 7899)]
  port: u16,

  /// Working directory holding projects.json, scenes/ and jobs/
  #[arg(long)]
  cwd: Option<PathBuf>,

  /// Password required on the add, modify and delete endpoints
  #[arg(long)]
  password: Option<String>,
}

fn main() -> anyhow::Result<()> {
  let args = Args::parse();
  init_logging("coordinator.log");

  let versions = match probe_coordinator_tools() {
    Ok(versions) => versions,
    Err(e) => {
      eprintln!("{e}");
      exit(1);
    }
  };

  let working_dir = match args.cwd {
    Some(cwd) => cwd,
    None => std::env::current_dir()?,
  };
  info!("working directory: {}", working_dir.display());

  if args.password.is_some() {
    info!("starting with protected add, modify, and delete");
  }

  let (registry, actions_rx) = Registry::new(working_dir, versions);
  registry.start_action_loop(actions_rx);
  registry.load_projects();

  let app = routes::router(routes::AppState {
    registry,
    password: args.password,
  });

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?;

  info!("listening on port {}", args.port);
  runtime.block_on(
    axum::Server::bind(&SocketAddr::from(([0, 0, 0, 0], args.port)))
      .serve(app.into_make_service_with_connect_info::<SocketAddr>()),
  )?;

  Ok(())
}
