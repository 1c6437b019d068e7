//! External transcoding worker processes.
//!
//! The relay never talks to ffmpeg directly: it spawns workers through
//! the [`WorkerSpawner`] trait so the worker technology is swappable
//! and tests can run against a fake with no real process.

use async_trait::async_trait;
use guildcast_core::config::LiveConfig;
use guildcast_core::models::RoomId;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// A running worker for one room.
///
/// `wait` must be cancel safe: the supervisor polls it inside a select
/// loop and recreates the future every iteration.
#[async_trait]
pub trait SpawnedWorker: Send {
    /// Take the worker's input sink. Yields once; closing the sink
    /// signals "no more data" to the worker.
    fn take_input(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>>;

    /// Wait for the worker to exit; returns the exit code if there is
    /// one.
    async fn wait(&mut self) -> Option<i32>;

    /// Force-terminate the worker and reap it.
    async fn kill(&mut self);
}

/// Spawns one worker per room.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, room_id: &RoomId, out_dir: &Path) -> io::Result<Box<dyn SpawnedWorker>>;
}

/// ffmpeg-backed worker: raw media from stdin, H.264/AAC with a
/// bounded bitrate ceiling, fixed-duration segments in a rolling
/// window, playlist continuously rewritten to list only the retained
/// segments. Small segment duration times a small window bounds both
/// latency and disk usage.
pub struct FfmpegSpawner {
    config: LiveConfig,
}

impl FfmpegSpawner {
    #[must_use]
    pub const fn new(config: LiveConfig) -> Self {
        Self { config }
    }
}

impl WorkerSpawner for FfmpegSpawner {
    fn spawn(&self, room_id: &RoomId, out_dir: &Path) -> io::Result<Box<dyn SpawnedWorker>> {
        let cfg = &self.config;
        let segment_template = out_dir.join("segment%05d.ts");
        let playlist = out_dir.join("index.m3u8");

        let mut child = Command::new(&cfg.ffmpeg_path)
            .arg("-hide_banner")
            .args(["-loglevel", "warning"])
            .args(["-i", "pipe:0"])
            .args(["-c:v", "libx264"])
            .args(["-preset", "veryfast"])
            .args(["-tune", "zerolatency"])
            .args(["-maxrate", &format!("{}k", cfg.max_video_kbps)])
            .args(["-bufsize", &format!("{}k", cfg.max_video_kbps * 2)])
            .args(["-c:a", "aac"])
            .args(["-b:a", &format!("{}k", cfg.audio_kbps)])
            .args(["-f", "hls"])
            .args(["-hls_time", &cfg.segment_seconds.to_string()])
            .args(["-hls_list_size", &cfg.playlist_size.to_string()])
            .args(["-hls_flags", "delete_segments+independent_segments"])
            .arg("-hls_segment_filename")
            .arg(&segment_template)
            .arg(&playlist)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().map(
            |stdin| Box::new(stdin) as Box<dyn AsyncWrite + Send + Unpin>
        );

        // Worker diagnostics are logged and nothing more: a noisy
        // worker is only dead once its process exits.
        if let Some(stderr) = child.stderr.take() {
            let room_id = room_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(room_id = %room_id, "transcoder: {line}");
                }
            });
        }

        debug!(room_id = %room_id, playlist = %playlist.display(), "Spawned ffmpeg worker");

        Ok(Box::new(FfmpegWorker { child, stdin }))
    }
}

struct FfmpegWorker {
    child: Child,
    stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
}

#[async_trait]
impl SpawnedWorker for FfmpegWorker {
    fn take_input(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
        self.stdin.take()
    }

    async fn wait(&mut self) -> Option<i32> {
        match self.child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                warn!("Failed to wait on transcoding worker: {e}");
                None
            }
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to kill transcoding worker: {e}");
        }
    }
}
