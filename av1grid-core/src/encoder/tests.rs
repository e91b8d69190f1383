use std::path::Path;

use super::*;

fn tools() -> ToolPaths {
  ToolPaths::default()
}

#[test]
fn encoder_kinds_round_trip() {
  assert_eq!("aom".parse::<Encoder>().unwrap(), Encoder::aom);
  assert_eq!("vpx".parse::<Encoder>().unwrap(), Encoder::vpx);
  assert!("x264".parse::<Encoder>().is_err());
  assert_eq!(Encoder::aom.to_string(), "aom");
  assert_eq!(Encoder::vpx.to_string(), "vpx");
}

#[test]
fn source_cmd_selects_the_scene_window() {
  let cmd = compose_source_cmd("ffmpeg", Path::new("00003.mkv"), 48, 120, "");

  assert_eq!(cmd[0], "ffmpeg");
  let vf = cmd.iter().position(|a| a == "-vf").unwrap();
  assert_eq!(cmd[vf + 1], r"select=gte(n\,48)");
  let vframes = cmd.iter().position(|a| a == "-vframes").unwrap();
  assert_eq!(cmd[vframes + 1], "120");
  assert_eq!(cmd.last().unwrap(), "-");
}

#[test]
fn source_cmd_appends_the_operator_filter() {
  let cmd = compose_source_cmd(
    "ffmpeg",
    Path::new("00003.mkv"),
    0,
    30,
    "-vf scale=-2:720 -an",
  );

  let vf = cmd.iter().position(|a| a == "-vf").unwrap();
  assert_eq!(cmd[vf + 1], r"select=gte(n\,0),scale=-2:720");
  assert!(cmd.contains(&"-an".to_owned()));
  assert_eq!(cmd.iter().filter(|a| *a == "-vf").count(), 1);
}

#[test]
fn first_pass_strips_denoise_and_outputs_nothing() {
  let [pass1, pass2] = compose_encoder_passes(
    Encoder::aom,
    &tools(),
    4,
    "--cpu-used=6 --denoise-noise-level=25 --end-usage=q",
    "scene.log",
    Path::new("scene.ivf"),
    None,
    None,
  );

  assert!(pass1.contains(&"--pass=1".to_owned()));
  assert!(!pass1.iter().any(|a| a.starts_with("--denoise-noise-level")));
  assert!(pass1.contains(&"--cpu-used=6".to_owned()));

  assert!(pass2.contains(&"--pass=2".to_owned()));
  assert!(pass2.contains(&"--denoise-noise-level=25".to_owned()));
  assert_eq!(pass2.last().unwrap(), "scene.ivf");

  for pass in [&pass1, &pass2] {
    assert!(pass.contains(&"--threads=4".to_owned()));
    assert!(pass.contains(&"--passes=2".to_owned()));
    assert!(pass.contains(&"--fpf=scene.log".to_owned()));
  }
}

#[test]
fn vmaf_model_path_is_added_for_aom_vmaf_params() {
  let [_, pass2] = compose_encoder_passes(
    Encoder::aom,
    &tools(),
    8,
    "--end-usage=vbr --tune=vmaf",
    "scene.log",
    Path::new("scene.ivf"),
    Some("model.json"),
    None,
  );
  assert!(pass2.contains(&"--vmaf-model-path=model.json".to_owned()));

  // no vmaf in the params means no model path either
  let [_, pass2] = compose_encoder_passes(
    Encoder::aom,
    &tools(),
    8,
    "--end-usage=vbr",
    "scene.log",
    Path::new("scene.ivf"),
    Some("model.json"),
    None,
  );
  assert!(!pass2.iter().any(|a| a.starts_with("--vmaf-model-path")));
}

#[test]
fn grain_table_only_applies_to_the_second_pass() {
  let [pass1, pass2] = compose_encoder_passes(
    Encoder::aom,
    &tools(),
    8,
    "--end-usage=q",
    "scene.log",
    Path::new("scene.ivf"),
    None,
    Some(Path::new("00004.table")),
  );

  assert!(!pass1.iter().any(|a| a.starts_with("--film-grain-table")));
  assert!(pass2.contains(&"--film-grain-table=00004.table".to_owned()));
}

#[test]
fn vpx_passes_use_the_vpx_binary() {
  let [pass1, _] = compose_encoder_passes(
    Encoder::vpx,
    &ToolPaths {
      vpxenc: "/opt/vpxenc".to_owned(),
      ..ToolPaths::default()
    },
    8,
    "--end-usage=q",
    "scene.log",
    Path::new("scene.ivf"),
    None,
    None,
  );
  assert_eq!(pass1[0], "/opt/vpxenc");
}
