use super::*;

#[test]
fn aom_vpx_frames() {
  assert_eq!(
    parse_aom_vpx_frames(
      "Pass 1/1 frame    3/2       2131B    5997 us 500.25 fps [ETA  unknown]"
    ),
    Some(2)
  );
  assert_eq!(
    parse_aom_vpx_frames(
      "Pass 1/1 frame  142/141   156465B  208875 us 679.83 fps [ETA  unknown]"
    ),
    Some(141)
  );
  assert_eq!(
    parse_aom_vpx_frames(
      "Pass 1/1 frame 102262/102261 136473850B  131502 ms 777.65 fps [ETA  unknown]    1272F"
    ),
    Some(102_261)
  );
  assert_eq!(parse_aom_vpx_frames("Pass 1/2"), None);
  assert_eq!(parse_aom_vpx_frames(""), None);
}

#[test]
fn encoder_versions() {
  let aomenc_help = "Included encoders:\n\n\
                     \x20   av1    - AOMedia Project AV1 Encoder v3.6.0 (default)\n\n\
                     \x20       Use --codec to switch to a non-default encoder.\n";
  assert_eq!(
    parse_encoder_version(Encoder::aom, aomenc_help).as_deref(),
    Some("AOMedia Project AV1 Encoder v3.6.0")
  );

  let vpxenc_help = "Included encoders:\n\n\
                     \x20   vp8    - WebM Project VP8 Encoder v1.12.0\n\
                     \x20   vp9    - WebM Project VP9 Encoder v1.12.0 (default)\n";
  assert_eq!(
    parse_encoder_version(Encoder::vpx, vpxenc_help).as_deref(),
    Some("WebM Project VP9 Encoder v1.12.0")
  );

  assert_eq!(parse_encoder_version(Encoder::aom, "no encoders here"), None);
}

#[test]
fn dav1d_decoded() {
  assert_eq!(parse_dav1d_decoded("Decoded 240/240 frames"), Some(240));
  assert_eq!(
    parse_dav1d_decoded("garbage\nDecoded 17/239 frames\n"),
    Some(239)
  );
  assert_eq!(parse_dav1d_decoded("Decoded frames"), None);
}

#[test]
fn ffmpeg_frame_counter() {
  assert_eq!(
    parse_ffmpeg_frame("frame=  100 fps= 25 q=-1.0 size=    1024kB"),
    Some(100)
  );
  // the last counter on the line wins
  assert_eq!(parse_ffmpeg_frame("frame= 1 ... frame= 42 "), Some(42));
  assert_eq!(parse_ffmpeg_frame("fps= 25"), None);
}

#[test]
fn video_filter_extraction() {
  let (vf, rest) = extract_video_filter("-vf scale=-2:720 -an");
  assert_eq!(vf.as_deref(), Some("scale=-2:720"));
  assert_eq!(rest, "-an");

  let (vf, rest) = extract_video_filter(r#"-color_range 0 -vf "crop=100:100,hflip""#);
  assert_eq!(vf.as_deref(), Some("crop=100:100,hflip"));
  assert_eq!(rest, "-color_range 0");

  let (vf, rest) = extract_video_filter("-an");
  assert_eq!(vf, None);
  assert_eq!(rest, "-an");

  let (vf, rest) = extract_video_filter("");
  assert_eq!(vf, None);
  assert_eq!(rest, "");
}
