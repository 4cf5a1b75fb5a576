//! Transcoder invocation builder
//!
//! The transcoder is an opaque external process. This module owns the
//! argument contract: fixed input-robustness flags plus per-output-format
//! flags, mirroring how the relay tiers are provisioned in the field.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Viewer-facing output format of a relay session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Segmented-HTTP playlist output
    Hls,
    /// Push-stream output toward a media server
    Rtmp,
    /// Low-latency WebRTC-style output
    Webrtc,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Hls => "hls",
            OutputFormat::Rtmp => "rtmp",
            OutputFormat::Webrtc => "webrtc",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hls" => Ok(OutputFormat::Hls),
            "rtmp" => Ok(OutputFormat::Rtmp),
            "webrtc" => Ok(OutputFormat::Webrtc),
            other => Err(Error::Validation(format!(
                "unknown output format: {}",
                other
            ))),
        }
    }
}

/// Relay supervision tuning
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Transcoder executable (resolved via PATH)
    pub transcoder_bin: String,
    /// Directory for segmented-HTTP output
    pub output_dir: PathBuf,
    /// Base URL push-stream output is sent to
    pub push_target_base: String,
    /// Base URL WebRTC-style RTP output is sent to
    pub webrtc_target_base: String,
    /// Relaunches after an error before the session fails terminally
    pub max_retries: u32,
    /// Fixed delay between relaunches (intentionally not exponential; the
    /// routing layer owns backoff)
    pub retry_delay: Duration,
    /// Deadline for leaving Starting before the process is killed
    pub startup_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            transcoder_bin: "ffmpeg".to_string(),
            output_dir: PathBuf::from("/var/lib/camrelay/streams"),
            push_target_base: "rtmp://127.0.0.1:1935/live".to_string(),
            webrtc_target_base: "rtp://127.0.0.1:5004".to_string(),
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            startup_timeout: Duration::from_secs(30),
        }
    }
}

/// Where a session's output lands for a given camera and format
pub fn output_target(config: &RelayConfig, camera_id: &str, format: OutputFormat) -> String {
    match format {
        OutputFormat::Hls => config
            .output_dir
            .join(camera_id)
            .join("index.m3u8")
            .to_string_lossy()
            .into_owned(),
        OutputFormat::Rtmp => format!("{}/{}", config.push_target_base, camera_id),
        OutputFormat::Webrtc => format!("{}?camera={}", config.webrtc_target_base, camera_id),
    }
}

/// Full argument vector for one transcoder launch
pub fn build_transcoder_args(
    input_uri: &str,
    format: OutputFormat,
    target: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        // input robustness: force TCP transport, normalize timestamps
        "-rtsp_transport".into(),
        "tcp".into(),
        "-fflags".into(),
        "+genpts".into(),
        "-i".into(),
        input_uri.into(),
    ];

    match format {
        OutputFormat::Hls => {
            args.extend(
                [
                    "-c:v", "copy", "-c:a", "aac", "-f", "hls", "-hls_time", "2",
                    "-hls_list_size", "6", "-hls_flags", "delete_segments",
                ]
                .map(String::from),
            );
        }
        OutputFormat::Rtmp => {
            args.extend(
                [
                    "-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency",
                    "-c:a", "aac", "-f", "flv",
                ]
                .map(String::from),
            );
        }
        OutputFormat::Webrtc => {
            args.extend(
                [
                    "-c:v", "libvpx", "-deadline", "realtime", "-cpu-used", "4",
                    "-an", "-f", "rtp",
                ]
                .map(String::from),
            );
        }
    }

    args.push(target.into());
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_format_parse() {
        assert_eq!("hls".parse::<OutputFormat>().unwrap(), OutputFormat::Hls);
        assert_eq!("RTMP".parse::<OutputFormat>().unwrap(), OutputFormat::Rtmp);
        assert!("mpegts".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_input_robustness_flags_precede_input() {
        let args = build_transcoder_args("rtsp://cam/stream1", OutputFormat::Hls, "/tmp/out.m3u8");
        let i_pos = args.iter().position(|a| a == "-i").unwrap();
        let transport_pos = args.iter().position(|a| a == "-rtsp_transport").unwrap();
        let genpts_pos = args.iter().position(|a| a == "+genpts").unwrap();
        assert!(transport_pos < i_pos);
        assert!(genpts_pos < i_pos);
        assert_eq!(args[i_pos + 1], "rtsp://cam/stream1");
    }

    #[test]
    fn test_hls_args_carry_segment_settings() {
        let args = build_transcoder_args("rtsp://cam/s", OutputFormat::Hls, "/tmp/out.m3u8");
        assert!(args.contains(&"-hls_time".to_string()));
        assert!(args.contains(&"-hls_list_size".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/out.m3u8");
    }

    #[test]
    fn test_rtmp_args_tuned_for_low_latency() {
        let args = build_transcoder_args("rtsp://cam/s", OutputFormat::Rtmp, "rtmp://srv/live/cam");
        assert!(args.contains(&"zerolatency".to_string()));
        assert!(args.contains(&"flv".to_string()));
    }

    #[test]
    fn test_webrtc_args_use_realtime_deadline() {
        let args = build_transcoder_args("rtsp://cam/s", OutputFormat::Webrtc, "rtp://srv:5004");
        assert!(args.contains(&"realtime".to_string()));
    }

    #[test]
    fn test_output_target_per_format() {
        let config = RelayConfig::default();
        assert!(output_target(&config, "cam-1", OutputFormat::Hls).ends_with("cam-1/index.m3u8"));
        assert_eq!(
            output_target(&config, "cam-1", OutputFormat::Rtmp),
            "rtmp://127.0.0.1:1935/live/cam-1"
        );
    }
}
