//! RelaySupervisor - transcoder process lifecycle
//!
//! One supervised session per (camera, output format). The transcoder's
//! event contract is realized over its stderr stream: periodic progress
//! samples move the session to Streaming and feed the health stats; error
//! lines are captured for diagnostics; process exit is the terminal event.
//!
//! Retry on error uses a fixed delay, deliberately distinct from the routing
//! layer's exponential backoff: a transcoder hiccup says nothing about route
//! health.

mod command;

pub use command::{build_transcoder_args, output_target, OutputFormat, RelayConfig};

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, RwLock};
use tokio::time::sleep;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Streaming,
    Retrying,
    Ended,
    Failed,
}

impl SessionStatus {
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SessionStatus::Starting | SessionStatus::Streaming | SessionStatus::Retrying
        )
    }
}

/// Live health sample from transcoder progress output
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SessionStats {
    pub fps: f64,
    pub bitrate_kbps: f64,
    pub frames: u64,
}

/// Queryable session snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RelaySession {
    pub id: String,
    pub camera_id: String,
    pub input_uri: String,
    pub output_format: OutputFormat,
    pub status: SessionStatus,
    pub stats: SessionStats,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

struct SessionEntry {
    session: Arc<RwLock<RelaySession>>,
    stop: watch::Sender<bool>,
}

enum AttemptOutcome {
    /// Process exited cleanly (natural end of stream)
    Completed,
    /// Stop was requested while the process ran
    Stopped,
    /// Never left Starting within the startup window
    TimedOut,
    /// Spawn failure or non-zero exit
    Errored(String),
}

pub struct RelaySupervisor {
    config: RelayConfig,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    /// Live session per (camera, format); cleared when a session terminates
    index: RwLock<HashMap<(String, OutputFormat), String>>,
}

impl RelaySupervisor {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
        })
    }

    /// Start a supervised session. Rejects with `DuplicateSession` while a
    /// live session exists for the same (camera, format).
    pub async fn start(
        self: &Arc<Self>,
        camera_id: &str,
        input_uri: &str,
        output_format: OutputFormat,
    ) -> Result<String> {
        let key = (camera_id.to_string(), output_format);

        // the liveness check and the slot reservation happen under one index
        // write lock, so two concurrent starts for the same pair cannot both
        // pass the check
        let mut index = self.index.write().await;
        if let Some(existing) = index.get(&key) {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(existing) {
                if entry.session.read().await.status.is_live() {
                    return Err(Error::DuplicateSession {
                        camera_id: camera_id.to_string(),
                        output_format: output_format.to_string(),
                    });
                }
            }
        }

        let session_id = Uuid::new_v4().to_string();
        let session = Arc::new(RwLock::new(RelaySession {
            id: session_id.clone(),
            camera_id: camera_id.to_string(),
            input_uri: input_uri.to_string(),
            output_format,
            status: SessionStatus::Starting,
            stats: SessionStats::default(),
            retry_count: 0,
            started_at: Utc::now(),
            failure_reason: None,
        }));
        let (stop_tx, stop_rx) = watch::channel(false);

        self.sessions.write().await.insert(
            session_id.clone(),
            SessionEntry {
                session: session.clone(),
                stop: stop_tx,
            },
        );
        index.insert(key, session_id.clone());
        drop(index);

        tracing::info!(
            session_id = %session_id,
            camera_id = %camera_id,
            output_format = %output_format,
            input_uri = %input_uri,
            "Relay session starting"
        );

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.supervise(session, stop_rx).await;
        });

        Ok(session_id)
    }

    /// Stop a session and drop its bookkeeping. No-op for unknown or
    /// already-ended sessions.
    pub async fn stop(&self, session_id: &str) -> Result<()> {
        let entry = self.sessions.write().await.remove(session_id);
        let Some(entry) = entry else {
            return Ok(());
        };

        // signal the supervise loop; it kills the child and exits
        let _ = entry.stop.send(true);

        let session = entry.session.read().await;
        let key = (session.camera_id.clone(), session.output_format);
        let mut index = self.index.write().await;
        if index.get(&key).map(String::as_str) == Some(session_id) {
            index.remove(&key);
        }

        tracing::info!(
            session_id = %session_id,
            camera_id = %session.camera_id,
            "Relay session stopped"
        );
        Ok(())
    }

    /// Snapshot by session id
    pub async fn get_status(&self, session_id: &str) -> Option<RelaySession> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(session_id)?;
        let snapshot = entry.session.read().await.clone();
        Some(snapshot)
    }

    /// Snapshots of every session for a camera
    pub async fn get_for_camera(&self, camera_id: &str) -> Vec<RelaySession> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::new();
        for entry in sessions.values() {
            let session = entry.session.read().await;
            if session.camera_id == camera_id {
                out.push(session.clone());
            }
        }
        out
    }

    pub async fn live_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        let mut count = 0;
        for entry in sessions.values() {
            if entry.session.read().await.status.is_live() {
                count += 1;
            }
        }
        count
    }

    /// Restart every live session for a camera against a new input URI
    /// (route swap). Stop-if-running then start, so it is safe to call for a
    /// camera with no sessions.
    pub async fn restart_for_camera(
        self: &Arc<Self>,
        camera_id: &str,
        input_uri: &str,
    ) -> Vec<String> {
        let live: Vec<(String, OutputFormat)> = {
            let index = self.index.read().await;
            index
                .keys()
                .filter(|(cam, _)| cam == camera_id)
                .cloned()
                .collect()
        };

        let mut new_ids = Vec::new();
        for (_, format) in live {
            let old_id = {
                let index = self.index.read().await;
                index.get(&(camera_id.to_string(), format)).cloned()
            };
            if let Some(old_id) = old_id {
                let _ = self.stop(&old_id).await;
            }
            match self.start(camera_id, input_uri, format).await {
                Ok(id) => new_ids.push(id),
                Err(e) => {
                    tracing::error!(
                        camera_id = %camera_id,
                        output_format = %format,
                        error = %e,
                        "Session restart failed"
                    );
                }
            }
        }
        new_ids
    }

    /// Stop every session for a camera (unregister path)
    pub async fn stop_for_camera(&self, camera_id: &str) {
        let ids: Vec<String> = {
            let sessions = self.sessions.read().await;
            let mut ids = Vec::new();
            for (id, entry) in sessions.iter() {
                if entry.session.read().await.camera_id == camera_id {
                    ids.push(id.clone());
                }
            }
            ids
        };
        for result in futures::future::join_all(ids.iter().map(|id| self.stop(id))).await {
            if let Err(e) = result {
                tracing::warn!(camera_id = %camera_id, error = %e, "Session stop failed");
            }
        }
    }

    // ---- supervision loop ------------------------------------------------

    async fn supervise(
        self: Arc<Self>,
        session: Arc<RwLock<RelaySession>>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            let outcome = self.run_attempt(&session, &mut stop).await;

            match outcome {
                AttemptOutcome::Completed => {
                    let mut s = session.write().await;
                    s.status = SessionStatus::Ended;
                    tracing::info!(session_id = %s.id, "Relay session ended naturally");
                    break;
                }
                AttemptOutcome::Stopped => {
                    let mut s = session.write().await;
                    s.status = SessionStatus::Ended;
                    break;
                }
                AttemptOutcome::TimedOut => {
                    let mut s = session.write().await;
                    s.status = SessionStatus::Failed;
                    s.failure_reason = Some(format!(
                        "no streaming progress within {:?}",
                        self.config.startup_timeout
                    ));
                    tracing::error!(
                        session_id = %s.id,
                        error = %Error::RelayTimeout(s.id.clone()),
                        "Relay session killed - startup timeout"
                    );
                    break;
                }
                AttemptOutcome::Errored(reason) => {
                    let (session_id, retry_count) = {
                        let s = session.read().await;
                        (s.id.clone(), s.retry_count)
                    };

                    if retry_count < self.config.max_retries {
                        {
                            let mut s = session.write().await;
                            s.status = SessionStatus::Retrying;
                            s.retry_count += 1;
                            s.failure_reason = Some(reason.clone());
                        }
                        tracing::warn!(
                            session_id = %session_id,
                            attempt = retry_count + 1,
                            max_retries = self.config.max_retries,
                            reason = %reason,
                            "Relay session relaunch scheduled"
                        );

                        tokio::select! {
                            _ = sleep(self.config.retry_delay) => {}
                            _ = stop.changed() => {
                                session.write().await.status = SessionStatus::Ended;
                                break;
                            }
                        }

                        session.write().await.status = SessionStatus::Starting;
                        continue;
                    }

                    let mut s = session.write().await;
                    s.status = SessionStatus::Failed;
                    s.failure_reason = Some(reason.clone());
                    tracing::error!(
                        session_id = %session_id,
                        retry_count = s.retry_count,
                        reason = %reason,
                        "Relay session failed - retries exhausted"
                    );
                    break;
                }
            }
        }

        // clear the live index so a new session for this pair can start
        let (key, id) = {
            let s = session.read().await;
            ((s.camera_id.clone(), s.output_format), s.id.clone())
        };
        let mut index = self.index.write().await;
        if index.get(&key).map(String::as_str) == Some(&id) {
            index.remove(&key);
        }
    }

    async fn run_attempt(
        &self,
        session: &Arc<RwLock<RelaySession>>,
        stop: &mut watch::Receiver<bool>,
    ) -> AttemptOutcome {
        let (camera_id, input_uri, format) = {
            let s = session.read().await;
            (s.camera_id.clone(), s.input_uri.clone(), s.output_format)
        };

        let target = output_target(&self.config, &camera_id, format);
        let args = build_transcoder_args(&input_uri, format, &target);

        let mut child = match Command::new(&self.config.transcoder_bin)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let err = Error::ProcessSpawn(format!("{}: {}", self.config.transcoder_bin, e));
                tracing::error!(camera_id = %camera_id, error = %err, "Transcoder spawn failed");
                return AttemptOutcome::Errored(err.to_string());
            }
        };

        tracing::debug!(
            camera_id = %camera_id,
            bin = %self.config.transcoder_bin,
            pid = ?child.id(),
            "Transcoder launched"
        );

        let streaming = Arc::new(std::sync::atomic::AtomicBool::new(false));

        if let Some(stderr) = child.stderr.take() {
            let session = session.clone();
            let streaming = streaming.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(stats) = parse_progress_line(&line) {
                        streaming.store(true, std::sync::atomic::Ordering::Relaxed);
                        let mut s = session.write().await;
                        if s.status == SessionStatus::Starting {
                            tracing::info!(session_id = %s.id, "Relay session streaming");
                        }
                        s.status = SessionStatus::Streaming;
                        s.stats = stats;
                    } else if is_error_line(&line) {
                        let mut s = session.write().await;
                        s.failure_reason = Some(line.clone());
                        tracing::warn!(session_id = %s.id, line = %line, "Transcoder error output");
                    } else {
                        tracing::trace!(line = %line, "Transcoder output");
                    }
                }
            });
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(line = %line, "Transcoder stdout");
                }
            });
        }

        let startup = sleep(self.config.startup_timeout);
        tokio::pin!(startup);

        loop {
            tokio::select! {
                exit = child.wait() => {
                    return match exit {
                        Ok(status) if status.success() => AttemptOutcome::Completed,
                        Ok(status) => {
                            let reason = session
                                .read()
                                .await
                                .failure_reason
                                .clone()
                                .unwrap_or_else(|| format!("transcoder exited with {}", status));
                            AttemptOutcome::Errored(reason)
                        }
                        Err(e) => AttemptOutcome::Errored(format!("wait failed: {}", e)),
                    };
                }
                _ = &mut startup, if !streaming.load(std::sync::atomic::Ordering::Relaxed) => {
                    let _ = child.kill().await;
                    return AttemptOutcome::TimedOut;
                }
                _ = stop.changed() => {
                    let _ = child.kill().await;
                    return AttemptOutcome::Stopped;
                }
            }
        }
    }
}

/// Parse a transcoder progress sample
/// (`frame=  123 fps= 25 bitrate= 640.2kbits/s ...`)
pub fn parse_progress_line(line: &str) -> Option<SessionStats> {
    let frames = extract_number(line, "frame=")?;
    let fps = extract_number(line, "fps=")?;
    let bitrate = extract_number(line, "bitrate=").unwrap_or(0.0);

    Some(SessionStats {
        fps,
        bitrate_kbps: bitrate,
        frames: frames as u64,
    })
}

fn extract_number(line: &str, key: &str) -> Option<f64> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    rest[..end].parse().ok()
}

/// Substring classification of stderr output into error vs info
pub fn is_error_line(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    [
        "error",
        "failed",
        "unable",
        "connection refused",
        "timed out",
        "no route to host",
        "invalid data",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Transcoder stand-in that ignores its arguments, emits nothing and
    /// stays alive well past any test deadline
    fn stalling_transcoder() -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = std::env::temp_dir().join(format!(
            "camrelay-stall-{}.sh",
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn test_config(bin: &str) -> RelayConfig {
        RelayConfig {
            transcoder_bin: bin.to_string(),
            output_dir: std::env::temp_dir().join("camrelay-test"),
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            startup_timeout: Duration::from_secs(5),
            ..RelayConfig::default()
        }
    }

    async fn wait_for_terminal(
        supervisor: &Arc<RelaySupervisor>,
        session_id: &str,
    ) -> RelaySession {
        for _ in 0..200 {
            if let Some(s) = supervisor.get_status(session_id).await {
                if !s.status.is_live() {
                    return s;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {} never reached a terminal state", session_id);
    }

    #[test]
    fn test_parse_progress_line() {
        let stats =
            parse_progress_line("frame=  482 fps= 25 q=-1.0 size=2048kB time=00:00:19 bitrate= 840.3kbits/s speed=1x")
                .unwrap();
        assert_eq!(stats.frames, 482);
        assert_eq!(stats.fps, 25.0);
        assert_eq!(stats.bitrate_kbps, 840.3);
    }

    #[test]
    fn test_parse_rejects_non_progress_lines() {
        assert!(parse_progress_line("Input #0, rtsp, from 'rtsp://cam'").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[test]
    fn test_error_line_classification() {
        assert!(is_error_line("rtsp://cam: Connection refused"));
        assert!(is_error_line("Unable to open input"));
        assert!(is_error_line("Error while decoding stream"));
        assert!(!is_error_line("Stream mapping:"));
        assert!(!is_error_line("Press [q] to stop"));
    }

    #[tokio::test]
    async fn test_clean_exit_ends_session() {
        let supervisor = RelaySupervisor::new(test_config("true"));
        let id = supervisor
            .start("cam-1", "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
            .await
            .unwrap();

        let session = wait_for_terminal(&supervisor, &id).await;
        assert_eq!(session.status, SessionStatus::Ended);

        // stop on an already-ended session is a no-op, not an error
        supervisor.stop(&id).await.unwrap();
        assert!(supervisor.get_status(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_session_rejected() {
        // "false" exits non-zero immediately, so the session sits in
        // Retrying between attempts and stays live
        let mut config = test_config("false");
        config.retry_delay = Duration::from_secs(30);
        let supervisor = RelaySupervisor::new(config);

        let first = supervisor
            .start("cam-1", "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
            .await
            .unwrap();

        let err = supervisor
            .start("cam-1", "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateSession { .. }));

        // first session untouched by the rejected call
        assert!(supervisor
            .get_status(&first)
            .await
            .unwrap()
            .status
            .is_live());

        // a different output format for the same camera is fine
        supervisor
            .start("cam-1", "rtsp://192.0.2.1:554/s", OutputFormat::Rtmp)
            .await
            .unwrap();

        supervisor.stop_for_camera("cam-1").await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_admit_exactly_one() {
        // "false" keeps sessions live in Retrying between attempts
        let mut config = test_config("false");
        config.retry_delay = Duration::from_secs(30);
        let supervisor = RelaySupervisor::new(config);

        for round in 0..50 {
            let camera_id = format!("cam-{}", round);

            let a = {
                let supervisor = supervisor.clone();
                let camera_id = camera_id.clone();
                tokio::spawn(async move {
                    supervisor
                        .start(&camera_id, "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
                        .await
                })
            };
            let b = {
                let supervisor = supervisor.clone();
                let camera_id = camera_id.clone();
                tokio::spawn(async move {
                    supervisor
                        .start(&camera_id, "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
                        .await
                })
            };

            let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
            assert_eq!(
                ra.is_ok() as u8 + rb.is_ok() as u8,
                1,
                "round {}: exactly one of two racing starts must win",
                round
            );

            let live = supervisor
                .get_for_camera(&camera_id)
                .await
                .into_iter()
                .filter(|s| s.status.is_live())
                .count();
            assert_eq!(live, 1, "round {}: one live session per (camera, format)", round);

            supervisor.stop_for_camera(&camera_id).await;
        }
    }

    #[tokio::test]
    async fn test_startup_timeout_kills_stalled_process() {
        let mut config = test_config(&stalling_transcoder());
        config.startup_timeout = Duration::from_millis(200);
        let supervisor = RelaySupervisor::new(config);

        let id = supervisor
            .start("cam-1", "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
            .await
            .unwrap();

        // the process stays in Starting with no progress output; the startup
        // deadline must kill it and fail the session terminally
        let session = wait_for_terminal(&supervisor, &id).await;
        assert_eq!(session.status, SessionStatus::Failed);
        assert!(session
            .failure_reason
            .as_deref()
            .unwrap()
            .contains("no streaming progress"));
        // timeout is terminal, never retried
        assert_eq!(session.retry_count, 0);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_is_terminal() {
        let supervisor = RelaySupervisor::new(test_config("false"));
        let id = supervisor
            .start("cam-1", "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
            .await
            .unwrap();

        let session = wait_for_terminal(&supervisor, &id).await;
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.retry_count, 3);

        // no further relaunch after the terminal failure
        tokio::time::sleep(Duration::from_millis(100)).await;
        let session = supervisor.get_status(&id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.retry_count, 3);
    }

    #[tokio::test]
    async fn test_spawn_failure_enters_retry_policy() {
        let supervisor =
            RelaySupervisor::new(test_config("/nonexistent/camrelay-transcoder"));
        let id = supervisor
            .start("cam-1", "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
            .await
            .unwrap();

        let session = wait_for_terminal(&supervisor, &id).await;
        assert_eq!(session.status, SessionStatus::Failed);
        assert_eq!(session.retry_count, 3);
        assert!(session.failure_reason.is_some());
    }

    #[tokio::test]
    async fn test_new_session_allowed_after_terminal() {
        let supervisor = RelaySupervisor::new(test_config("true"));
        let first = supervisor
            .start("cam-1", "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
            .await
            .unwrap();
        wait_for_terminal(&supervisor, &first).await;

        // index cleared on terminal, so the pair is free again
        let second = supervisor
            .start("cam-1", "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
            .await
            .unwrap();
        assert_ne!(first, second);
        supervisor.stop(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_unknown_session_is_noop() {
        let supervisor = RelaySupervisor::new(test_config("true"));
        supervisor.stop("no-such-session").await.unwrap();
    }

    #[tokio::test]
    async fn test_get_for_camera() {
        let mut config = test_config("false");
        config.retry_delay = Duration::from_secs(30);
        let supervisor = RelaySupervisor::new(config);

        supervisor
            .start("cam-1", "rtsp://192.0.2.1:554/s", OutputFormat::Hls)
            .await
            .unwrap();
        supervisor
            .start("cam-2", "rtsp://192.0.2.2:554/s", OutputFormat::Hls)
            .await
            .unwrap();

        let sessions = supervisor.get_for_camera("cam-1").await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].camera_id, "cam-1");

        supervisor.stop_for_camera("cam-1").await;
        supervisor.stop_for_camera("cam-2").await;
    }
}
