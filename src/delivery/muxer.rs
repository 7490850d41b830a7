//! Muxer processes
//!
//! A [`Muxer`] combines a video-only and an audio-only stream (mux mode) or
//! re-encodes a segmented source (transcode mode) into one fragmented MP4 on
//! stdout. [`FfmpegMuxer`] does this with ffmpeg.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tokio::process::Command;

use super::resolver::StreamRef;
use super::source::MuxProcess;
use crate::types::{RelayError, Result};

/// User agent sent upstream when the resolver supplied none
pub const DEFAULT_USER_AGENT: &str = concat!(
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) ",
    "AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0 Safari/537.36"
);

/// What the muxer does with its inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxMode {
    /// Copy video, re-encode audio, remux into one container
    Mux,
    /// Re-encode a segmented source
    Transcode,
}

impl std::fmt::Display for MuxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MuxMode::Mux => f.write_str("mux"),
            MuxMode::Transcode => f.write_str("transcode"),
        }
    }
}

/// Spawns processes that write one continuous stream to stdout
pub trait Muxer: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    fn spawn(&self, inputs: &[StreamRef], mode: MuxMode) -> Result<MuxProcess>;
}

/// ffmpeg based muxer producing fragmented MP4
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    binary: PathBuf,
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl FfmpegMuxer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Full argument list for `inputs` in `mode`
    pub fn build_args(inputs: &[StreamRef], mode: MuxMode) -> Result<Vec<String>> {
        match (mode, inputs.len()) {
            (MuxMode::Mux, 2) | (MuxMode::Transcode, 1) => {}
            (mode, n) => {
                return Err(RelayError::Mux(format!(
                    "{} mode does not take {} input(s)",
                    mode, n
                )))
            }
        }

        let mut args: Vec<String> = ["-hide_banner", "-loglevel", "error", "-nostdin"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        for input in inputs {
            args.extend(input_args(input));
        }

        #[rustfmt::skip]
        let tail: &[&str] = match mode {
            MuxMode::Mux => &[
                "-map", "0:v:0", "-map", "1:a:0",
                "-c:v", "copy",
                "-c:a", "aac", "-b:a", "160k",
            ],
            MuxMode::Transcode => &[
                "-map", "0:v:0", "-map", "0:a:0?",
                "-c:v", "libx264", "-preset", "veryfast",
                "-c:a", "aac", "-b:a", "160k",
            ],
        };
        args.extend(tail.iter().map(|s| s.to_string()));
        args.extend(
            ["-movflags", "frag_keyframe+empty_moov", "-f", "mp4", "-"]
                .iter()
                .map(|s| s.to_string()),
        );
        Ok(args)
    }
}

/// Per-input options: reconnect on network hiccups and send the headers the
/// upstream expects
fn input_args(input: &StreamRef) -> Vec<String> {
    let mut args = Vec::new();
    if input.locator.starts_with("http://") || input.locator.starts_with("https://") {
        for (flag, value) in [
            ("-reconnect", "1"),
            ("-reconnect_streamed", "1"),
            ("-reconnect_at_eof", "1"),
            ("-reconnect_delay_max", "10"),
        ] {
            args.push(flag.to_string());
            args.push(value.to_string());
        }

        let (user_agent, extra) = split_user_agent(&input.headers);
        args.push("-user_agent".to_string());
        args.push(user_agent);
        if !extra.is_empty() {
            args.push("-headers".to_string());
            args.push(extra);
        }
    }
    args.push("-i".to_string());
    args.push(input.locator.clone());
    args
}

/// User agent plus the remaining headers in ffmpeg's `-headers` form
fn split_user_agent(headers: &BTreeMap<String, String>) -> (String, String) {
    let mut user_agent = DEFAULT_USER_AGENT.to_string();
    let mut extra = String::new();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("user-agent") {
            user_agent = value.clone();
        } else {
            extra.push_str(&format!("{}: {}\r\n", name, value));
        }
    }
    (user_agent, extra)
}

impl Muxer for FfmpegMuxer {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn spawn(&self, inputs: &[StreamRef], mode: MuxMode) -> Result<MuxProcess> {
        let args = Self::build_args(inputs, mode)?;
        let mut cmd = Command::new(&self.binary);
        cmd.args(&args);
        MuxProcess::spawn(cmd, self.name())
    }
}
