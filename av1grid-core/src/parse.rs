//! Functions for parsing the output of the external tools: encoder
//! progress lines, encoder version banners, decoder frame totals and
//! ffmpeg progress.

#[cfg(test)]
mod tests;

use crate::encoder::Encoder;
use crate::regex;

/// Parses the number of encoded frames from an aomenc/vpxenc status line.
///
/// The progress line carries two counters (buffered/encoded); the second
/// one is the number of frames actually written out, which is the one we
/// want:
///
/// ```text
/// Pass 1/2 frame  142/141   156465B  208875 us 679.83 fps [ETA  unknown]
///                     ^^^
/// ```
pub fn parse_aom_vpx_frames(line: &str) -> Option<u64> {
  let cap = regex!(r"frame\s+[0-9]+/([0-9]+)").captures(line)?;
  cap[1].parse().ok()
}

/// Extracts the encoder version from `--help` output, e.g.
/// `av1    - AOMedia Project AV1 Encoder v3.6.0 (default)`.
pub fn parse_encoder_version(encoder: Encoder, help: &str) -> Option<String> {
  let re = match encoder {
    Encoder::aom => regex!(r"av1\s+-\s+(.+)"),
    Encoder::vpx => regex!(r"vp9\s+-\s+(.+)"),
  };
  let cap = re.captures(help)?;
  Some(cap[1].replace("(default)", "").trim().to_owned())
}

/// Parses the total decoded frame count from dav1d output
/// (`Decoded 240/240 frames`).
pub fn parse_dav1d_decoded(output: &str) -> Option<usize> {
  let cap = regex!(r"Decoded [0-9]+/([0-9]+) frames").captures(output)?;
  cap[1].parse().ok()
}

/// Parses the most recent `frame=` counter from ffmpeg progress output.
pub fn parse_ffmpeg_frame(line: &str) -> Option<usize> {
  let cap = regex!(r"frame=\s*([0-9]+)").captures_iter(line).last()?;
  cap[1].parse().ok()
}

/// Splits an operator-supplied ffmpeg argument string into its `-vf`
/// filter (if any) and the remaining arguments. The filter has to be
/// folded into the scene-selection filter chain rather than passed
/// through verbatim.
pub fn extract_video_filter(ffmpeg_params: &str) -> (Option<String>, String) {
  let re = regex!(r#"(?:-vf\s+"([^"]+)"|-vf\s+(\S+))"#);
  match re.captures(ffmpeg_params) {
    Some(cap) => {
      let vf = cap
        .get(1)
        .or_else(|| cap.get(2))
        .map(|m| m.as_str().to_owned());
      let rest = re.replace(ffmpeg_params, "").trim().to_owned();
      (vf, rest)
    }
    None => (None, ffmpeg_params.trim().to_owned()),
  }
}
