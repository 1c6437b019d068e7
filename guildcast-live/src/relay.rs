//! Per-room relay: accepts media chunks from the host's signaling
//! connection and pipes them into that room's transcoding worker.
//!
//! Each live room gets one supervisor task that owns the worker
//! process outright. Everything else (feed, stop, shutdown) goes
//! through the cloneable [`SessionHandle`] in the registry, so there
//! is exactly one place a worker can die from and exactly one place
//! that announces the death.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use guildcast_core::config::LiveConfig;
use guildcast_core::models::RoomId;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{LiveError, Result};
use crate::events::{ChunkFrame, ServerEvent};
use crate::hub::StreamHub;
use crate::registry::{ConnectionId, SessionHandle, SessionRegistry};
use crate::worker::{SpawnedWorker, WorkerSpawner};

/// Extra time `stop` waits beyond the worker grace period before
/// giving up on the done signal.
const STOP_WAIT_SLACK: Duration = Duration::from_secs(2);

pub struct StreamRelay {
    registry: Arc<SessionRegistry>,
    hub: Arc<StreamHub>,
    spawner: Arc<dyn WorkerSpawner>,
    config: LiveConfig,
}

impl StreamRelay {
    pub fn new(
        registry: Arc<SessionRegistry>,
        hub: Arc<StreamHub>,
        spawner: Arc<dyn WorkerSpawner>,
        config: LiveConfig,
    ) -> Self {
        Self {
            registry,
            hub,
            spawner,
            config,
        }
    }

    /// Start a live session for `room_id`, fed by `connection_id`.
    ///
    /// Spawns the worker, registers the session, and hands the worker
    /// to a supervisor task. On any failure after the worker spawned,
    /// the worker is killed before the error returns, so a failed
    /// start never leaks a process or a registry entry.
    pub async fn start(&self, room_id: RoomId, connection_id: ConnectionId) -> Result<()> {
        if self.registry.lookup(&room_id).is_some() {
            return Err(LiveError::AlreadyActive(room_id));
        }

        let out_dir = Path::new(&self.config.root_dir).join(room_id.as_str());
        tokio::fs::create_dir_all(&out_dir).await?;

        let mut worker = self.spawner.spawn(&room_id, &out_dir)?;
        let input = worker.take_input();
        if input.is_none() {
            worker.kill().await;
            return Err(LiveError::WorkerSpawn(std::io::Error::other(
                "worker has no input pipe",
            )));
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(self.config.chunk_buffer);
        let (done_tx, done) = watch::channel(false);
        let handle = SessionHandle {
            connection_id,
            chunk_tx,
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            done,
        };

        let stop = handle.stop.clone();
        let kill = handle.kill.clone();
        if let Err(e) = self.registry.register(room_id.clone(), handle) {
            // Lost the race against a concurrent start for the same room.
            worker.kill().await;
            return Err(e);
        }

        info!(room_id = %room_id, "Live session started");

        let supervisor = Supervisor {
            registry: Arc::clone(&self.registry),
            hub: Arc::clone(&self.hub),
            room_id,
            worker,
            input,
            chunk_rx,
            stop,
            kill,
            done_tx,
            grace: Duration::from_secs(self.config.stop_grace_seconds),
        };
        tokio::spawn(supervisor.run());

        Ok(())
    }

    /// Route one media chunk to its room's worker. Only the connection
    /// that started the session may feed it; a room has exactly one
    /// producer, and chunk ordering rests on that. Everything else is
    /// best effort: chunks from other connections, for unknown rooms
    /// (stale frames after teardown), or against a full channel (worker
    /// slower than the uplink) are silently dropped.
    pub fn feed(&self, connection_id: &str, frame: ChunkFrame) {
        let Some(handle) = self.registry.lookup(&frame.room_id) else {
            return;
        };
        if handle.connection_id != connection_id {
            warn!(
                room_id = %frame.room_id,
                connection_id = %connection_id,
                "Dropping chunk from a connection that does not own the session"
            );
            return;
        }
        if handle.chunk_tx.try_send(frame.payload).is_err() {
            debug!(room_id = %frame.room_id, "Dropping chunk, worker backlogged or stopping");
        }
    }

    /// `stop`, gated on the caller identity: only the connection that
    /// started the session may end it. Stop requests from any other
    /// connection are ignored and the session stays live.
    pub async fn stop_from(&self, room_id: &RoomId, connection_id: &str) {
        let Some(handle) = self.registry.lookup(room_id) else {
            return;
        };
        if handle.connection_id != connection_id {
            warn!(
                room_id = %room_id,
                connection_id = %connection_id,
                "Ignoring stop from a connection that does not own the session"
            );
            return;
        }
        handle.stop.cancel();
        self.wait_done(handle.done.clone()).await;
    }

    /// Gracefully end a room's live session and wait for its
    /// supervisor to finish cleaning up. Idempotent: stopping a room
    /// that is not live is a no-op, and concurrent stops all resolve
    /// against the same supervisor. This is the trusted path; callers
    /// relaying a client request go through [`Self::stop_from`].
    pub async fn stop(&self, room_id: &RoomId) {
        let Some(handle) = self.registry.lookup(room_id) else {
            return;
        };
        handle.stop.cancel();
        self.wait_done(handle.done.clone()).await;
    }

    /// Force-terminate every live session (process shutdown sweep).
    pub async fn shutdown(&self) {
        let rooms = self.registry.rooms();
        if rooms.is_empty() {
            return;
        }
        info!(sessions = rooms.len(), "Killing all live sessions");
        let mut pending = Vec::new();
        for room_id in &rooms {
            if let Some(handle) = self.registry.lookup(room_id) {
                handle.kill.cancel();
                pending.push(handle.done.clone());
            }
        }
        for done in pending {
            self.wait_done(done).await;
        }
    }

    /// True if the room has a live session right now.
    #[must_use]
    pub fn is_live(&self, room_id: &RoomId) -> bool {
        self.registry.lookup(room_id).is_some()
    }

    async fn wait_done(&self, mut done: watch::Receiver<bool>) {
        let deadline = Duration::from_secs(self.config.stop_grace_seconds) + STOP_WAIT_SLACK;
        let wait = async {
            while !*done.borrow_and_update() {
                if done.changed().await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(deadline, wait).await.is_err() {
            warn!("Timed out waiting for live session teardown");
        }
    }
}

/// Owns one worker process from spawn to reaped, and is the only
/// code allowed to touch it. Exits when the worker does, whatever
/// caused that, and does the announce-and-unregister exactly once.
struct Supervisor {
    registry: Arc<SessionRegistry>,
    hub: Arc<StreamHub>,
    room_id: RoomId,
    worker: Box<dyn SpawnedWorker>,
    input: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    chunk_rx: mpsc::Receiver<bytes::Bytes>,
    stop: CancellationToken,
    kill: CancellationToken,
    done_tx: watch::Sender<bool>,
    grace: Duration,
}

impl Supervisor {
    async fn run(mut self) {
        let exit_code = self.pump().await;

        self.registry.unregister(&self.room_id);
        let _ = self.done_tx.send(true);
        let notified = self
            .hub
            .broadcast(&self.room_id, &ServerEvent::StreamEnded {
                room_id: self.room_id.clone(),
            });
        info!(
            room_id = %self.room_id,
            exit_code = ?exit_code,
            notified,
            "Live session ended"
        );
    }

    /// Relay chunks until something ends the session, then reap the
    /// worker. Returns its exit code if it produced one.
    async fn pump(&mut self) -> Option<i32> {
        loop {
            tokio::select! {
                code = self.worker.wait() => return code,
                () = self.stop.cancelled() => return self.drain(false).await,
                () = self.kill.cancelled() => return self.drain(true).await,
                chunk = self.chunk_rx.recv(), if self.input.is_some() => {
                    let Some(chunk) = chunk else { continue };
                    if let Some(input) = self.input.as_mut() {
                        if let Err(e) = input.write_all(&chunk).await {
                            // Worker closed its input; it is exiting,
                            // so just stop writing and wait for it.
                            debug!(room_id = %self.room_id, "Worker input closed: {e}");
                            self.input = None;
                        }
                    }
                }
            }
        }
    }

    /// Close the worker's input (its end-of-stream signal) and give it
    /// `grace` to flush the final segments and exit on its own before
    /// force-terminating it. `force` skips straight to the kill.
    async fn drain(&mut self, force: bool) -> Option<i32> {
        if let Some(mut input) = self.input.take() {
            let _ = input.shutdown().await;
        }
        self.chunk_rx.close();

        if !force {
            tokio::select! {
                code = self.worker.wait() => return code,
                () = self.kill.cancelled() => {}
                () = tokio::time::sleep(self.grace) => {
                    warn!(room_id = %self.room_id, "Worker ignored end of stream, killing it");
                }
            }
        }

        self.worker.kill().await;
        self.worker.wait().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use guildcast_core::models::UserId;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;

    /// Handles into one fake worker, kept by the spawner for assertions.
    struct WorkerTap {
        exit: watch::Sender<Option<i32>>,
        killed: Arc<AtomicBool>,
        written: Arc<Mutex<Vec<u8>>>,
    }

    struct FakeWorker {
        exit: watch::Receiver<Option<i32>>,
        killed: Arc<AtomicBool>,
        exit_tx: watch::Sender<Option<i32>>,
        input: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    }

    #[async_trait]
    impl SpawnedWorker for FakeWorker {
        fn take_input(&mut self) -> Option<Box<dyn AsyncWrite + Send + Unpin>> {
            self.input.take()
        }

        async fn wait(&mut self) -> Option<i32> {
            loop {
                if let Some(code) = *self.exit.borrow_and_update() {
                    return Some(code);
                }
                if self.exit.changed().await.is_err() {
                    return None;
                }
            }
        }

        async fn kill(&mut self) {
            self.killed.store(true, Ordering::SeqCst);
            let _ = self.exit_tx.send(Some(-9));
        }
    }

    struct FakeSpawner {
        taps: Mutex<Vec<WorkerTap>>,
        spawn_count: AtomicUsize,
        fail: bool,
        /// Exit with code 0 as soon as the input pipe hits EOF, like a
        /// well-behaved transcoder.
        exit_on_eof: bool,
    }

    impl FakeSpawner {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                taps: Mutex::new(Vec::new()),
                spawn_count: AtomicUsize::new(0),
                fail: false,
                exit_on_eof: true,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                taps: Mutex::new(Vec::new()),
                spawn_count: AtomicUsize::new(0),
                fail: true,
                exit_on_eof: true,
            })
        }

        fn stubborn() -> Arc<Self> {
            Arc::new(Self {
                taps: Mutex::new(Vec::new()),
                spawn_count: AtomicUsize::new(0),
                fail: false,
                exit_on_eof: false,
            })
        }

        fn tap(&self, index: usize) -> (Arc<AtomicBool>, Arc<Mutex<Vec<u8>>>) {
            let taps = self.taps.lock().unwrap();
            (
                Arc::clone(&taps[index].killed),
                Arc::clone(&taps[index].written),
            )
        }
    }

    impl WorkerSpawner for FakeSpawner {
        fn spawn(&self, _room_id: &RoomId, _out_dir: &Path) -> io::Result<Box<dyn SpawnedWorker>> {
            self.spawn_count.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"));
            }

            let (exit_tx, exit_rx) = watch::channel(None);
            let killed = Arc::new(AtomicBool::new(false));
            let written = Arc::new(Mutex::new(Vec::new()));
            let (input, mut output) = tokio::io::duplex(64 * 1024);

            // Consume the input side the way a real worker would, and
            // optionally treat EOF as a clean exit.
            {
                let written = Arc::clone(&written);
                let exit_tx = exit_tx.clone();
                let exit_on_eof = self.exit_on_eof;
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match output.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => written.lock().unwrap().extend_from_slice(&buf[..n]),
                        }
                    }
                    if exit_on_eof {
                        let _ = exit_tx.send(Some(0));
                    }
                });
            }

            self.taps.lock().unwrap().push(WorkerTap {
                exit: exit_tx.clone(),
                killed: Arc::clone(&killed),
                written: Arc::clone(&written),
            });

            Ok(Box::new(FakeWorker {
                exit: exit_rx,
                killed,
                exit_tx,
                input: Some(Box::new(input)),
            }))
        }
    }

    struct Fixture {
        relay: StreamRelay,
        registry: Arc<SessionRegistry>,
        hub: Arc<StreamHub>,
        spawner: Arc<FakeSpawner>,
        _root: tempfile::TempDir,
    }

    fn fixture(spawner: Arc<FakeSpawner>) -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let config = LiveConfig {
            root_dir: root.path().to_string_lossy().into_owned(),
            stop_grace_seconds: 1,
            ..LiveConfig::default()
        };
        let registry = Arc::new(SessionRegistry::new());
        let hub = Arc::new(StreamHub::new());
        let relay = StreamRelay::new(
            Arc::clone(&registry),
            Arc::clone(&hub),
            Arc::<FakeSpawner>::clone(&spawner) as Arc<dyn WorkerSpawner>,
            config,
        );
        Fixture {
            relay,
            registry,
            hub,
            spawner,
            _root: root,
        }
    }

    fn room(id: &str) -> RoomId {
        RoomId::from_string(id.to_string())
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_start_feed_stop() {
        let f = fixture(FakeSpawner::new());

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();
        assert!(f.relay.is_live(&room("r1")));

        f.relay.feed("c1", ChunkFrame::new(room("r1"), bytes::Bytes::from_static(b"abc")));
        f.relay.feed("c1", ChunkFrame::new(room("r1"), bytes::Bytes::from_static(b"def")));

        let (_, written) = f.spawner.tap(0);
        wait_for(|| written.lock().unwrap().len() == 6).await;
        assert_eq!(written.lock().unwrap().as_slice(), b"abcdef");

        f.relay.stop(&room("r1")).await;
        assert!(!f.relay.is_live(&room("r1")));
        assert!(f.registry.is_empty());

        // A clean EOF exit never needed the kill path.
        let (killed, _) = f.spawner.tap(0);
        assert!(!killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_announces_once() {
        let f = fixture(FakeSpawner::new());

        let mut rx = f
            .hub
            .connect("viewer".to_string(), UserId::from_string("u1".to_string()));
        f.hub.join(room("r1"), "viewer");

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();
        f.relay.stop(&room("r1")).await;
        f.relay.stop(&room("r1")).await;
        f.relay.stop(&room("never-lived")).await;

        let mut ended = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, ServerEvent::StreamEnded { .. }) {
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
    }

    #[tokio::test]
    async fn test_feed_after_stop_is_noop() {
        let f = fixture(FakeSpawner::new());

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();
        f.relay.stop(&room("r1")).await;
        f.relay.feed("c1", ChunkFrame::new(room("r1"), bytes::Bytes::from_static(b"late")));

        let (_, written) = f.spawner.tap(0);
        assert!(written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_feed_from_other_connection_is_dropped() {
        let f = fixture(FakeSpawner::new());

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();

        // A different authenticated connection must not be able to
        // inject bytes into the room's worker.
        f.relay.feed("c2", ChunkFrame::new(room("r1"), bytes::Bytes::from_static(b"evil")));
        f.relay.feed("c1", ChunkFrame::new(room("r1"), bytes::Bytes::from_static(b"ok")));

        let (_, written) = f.spawner.tap(0);
        wait_for(|| !written.lock().unwrap().is_empty()).await;
        assert_eq!(written.lock().unwrap().as_slice(), b"ok");
    }

    #[tokio::test]
    async fn test_stop_from_other_connection_is_ignored() {
        let f = fixture(FakeSpawner::new());

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();

        f.relay.stop_from(&room("r1"), "c2").await;
        assert!(f.relay.is_live(&room("r1")));

        f.relay.stop_from(&room("r1"), "c1").await;
        assert!(!f.relay.is_live(&room("r1")));
        f.relay.stop_from(&room("r1"), "c1").await;
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let f = fixture(FakeSpawner::new());

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();
        let err = f.relay.start(room("r1"), "c2".to_string()).await.unwrap_err();
        assert!(matches!(err, LiveError::AlreadyActive(r) if r.as_str() == "r1"));

        // Rejected before anything spawned.
        assert_eq!(f.spawner.spawn_count.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.registry.lookup(&room("r1")).unwrap().connection_id,
            "c1"
        );
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_session() {
        let f = fixture(FakeSpawner::failing());

        let err = f.relay.start(room("r1"), "c1".to_string()).await.unwrap_err();
        assert!(matches!(err, LiveError::WorkerSpawn(_)));
        assert!(f.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stubborn_worker_is_killed_after_grace() {
        let f = fixture(FakeSpawner::stubborn());

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();
        f.relay.stop(&room("r1")).await;

        let (killed, _) = f.spawner.tap(0);
        assert!(killed.load(Ordering::SeqCst));
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_worker_exit_tears_down_session() {
        let f = fixture(FakeSpawner::new());

        let mut rx = f
            .hub
            .connect("viewer".to_string(), UserId::from_string("u1".to_string()));
        f.hub.join(room("r1"), "viewer");

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();

        // Simulate the worker crashing on its own.
        f.spawner.taps.lock().unwrap()[0]
            .exit
            .send(Some(1))
            .unwrap();

        wait_for(|| f.registry.is_empty()).await;

        let event = rx.try_recv().unwrap();
        assert!(matches!(event, ServerEvent::StreamEnded { room_id } if room_id.as_str() == "r1"));
    }

    #[tokio::test]
    async fn test_disconnect_sweeps_all_rooms_of_connection() {
        let f = fixture(FakeSpawner::new());

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();
        f.relay.start(room("r2"), "c1".to_string()).await.unwrap();
        f.relay.start(room("r3"), "c2".to_string()).await.unwrap();

        for room_id in f.registry.find_by_connection("c1") {
            f.relay.stop(&room_id).await;
        }

        assert!(!f.relay.is_live(&room("r1")));
        assert!(!f.relay.is_live(&room("r2")));
        assert!(f.relay.is_live(&room("r3")));
    }

    #[tokio::test]
    async fn test_shutdown_kills_everything() {
        let f = fixture(FakeSpawner::new());

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();
        f.relay.start(room("r2"), "c2".to_string()).await.unwrap();

        f.relay.shutdown().await;

        assert!(f.registry.is_empty());
        let (killed_a, _) = f.spawner.tap(0);
        let (killed_b, _) = f.spawner.tap(1);
        assert!(killed_a.load(Ordering::SeqCst));
        assert!(killed_b.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_start_creates_output_directory() {
        let f = fixture(FakeSpawner::new());

        f.relay.start(room("r1"), "c1".to_string()).await.unwrap();
        assert!(f._root.path().join("r1").is_dir());

        f.relay.stop(&room("r1")).await;
    }
}
