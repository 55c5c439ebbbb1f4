//! The stream session manager.
//!
//! Owns at most one running encoder process and at most one armed
//! scheduled start. Callers issue start/stop/schedule commands and poll
//! status; the encoder itself is fire-and-forget from their perspective.
//! All session fields live behind a single mutex, shared by the caller,
//! the output drain task and the schedule timer task.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::warn;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::time::sleep;

use crate::clock::Clock;
use crate::commands::{build_stream_args, StreamConfig};
use crate::encoder::{EncoderHandle, Launcher};
use crate::log_sink::{LogSink, LOG_CAPACITY};
use crate::monitor::{ProgressFilter, PROGRESS_LOG_INTERVAL};

#[derive(Default)]
struct SessionState {
    active: bool,
    started_at: Option<DateTime<Utc>>,
    scheduled_at: Option<DateTime<Utc>>,
    source: Option<String>,
    stream_key: Option<String>,
    config: StreamConfig,
    encoder_pid: Option<u32>,
    schedule_cancel: Option<oneshot::Sender<()>>,
}

pub struct StreamManager {
    state: Mutex<SessionState>,
    logs: LogSink,
    clock: Arc<dyn Clock>,
    launcher: Arc<dyn Launcher>,
}

impl StreamManager {
    pub fn new(clock: Arc<dyn Clock>, launcher: Arc<dyn Launcher>) -> Self {
        StreamManager {
            state: Mutex::new(SessionState::default()),
            logs: LogSink::new(LOG_CAPACITY, clock.clone()),
            clock,
            launcher,
        }
    }

    pub fn logs(&self) -> &LogSink {
        &self.logs
    }

    pub async fn is_active(&self) -> bool {
        self.state.lock().await.active
    }

    pub async fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.scheduled_at
    }

    /// Launches the encoder for `source` towards the ingest endpoint
    /// identified by `stream_key`. Returns true once the launch has been
    /// handed to the drain task; stream health is reported via the log.
    pub async fn start_streaming(
        self: &Arc<Self>,
        source: &str,
        stream_key: &str,
        config: StreamConfig,
    ) -> bool {
        let args = {
            let mut state = self.state.lock().await;
            if state.active {
                drop(state);
                self.logs
                    .push("Already streaming. Stop the current stream first.");
                return false;
            }
            if source.is_empty() || stream_key.is_empty() {
                drop(state);
                self.logs
                    .push("Error: source and stream key must be provided.");
                return false;
            }
            state.source = Some(source.to_string());
            state.stream_key = Some(stream_key.to_string());
            state.active = true;
            state.started_at = Some(self.clock.now());
            let args = build_stream_args(source, stream_key, &config);
            state.config = config;
            args
        };

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.run_encoder(args).await;
        });

        self.logs
            .push(format!("Started streaming: {}", basename(source)));
        true
    }

    /// Stops the running stream. The active flag is cleared before the
    /// encoder is signalled so the drain task treats the exit as requested.
    /// Returns false only when terminating the process itself fails.
    pub async fn stop_streaming(&self) -> bool {
        let pid = {
            let mut state = self.state.lock().await;
            if !state.active {
                drop(state);
                self.logs.push("No active stream to stop.");
                return false;
            }
            state.active = false;
            state.started_at = None;
            state.encoder_pid.take()
        };

        let result = match pid {
            Some(pid) => crate::encoder::terminate(pid).or_else(|err| {
                warn!("SIGTERM to encoder pid {} failed: {}", pid, err);
                crate::encoder::kill_by_name(self.launcher.program())
            }),
            // encoder not spawned (yet) or already reaped
            None => Ok(()),
        };

        match result {
            Ok(()) => {
                self.logs.push("Streaming stopped successfully.");
                true
            }
            Err(err) => {
                self.logs.push(format!("Error stopping stream: {}", err));
                false
            }
        }
    }

    /// Arms a timer that starts the stored stream request at `target`.
    /// Re-arming replaces any pending schedule; `cancel_schedule` wakes the
    /// timer immediately.
    pub async fn schedule_stream(
        self: &Arc<Self>,
        source: &str,
        stream_key: &str,
        config: StreamConfig,
        target: DateTime<Utc>,
    ) -> bool {
        let (delay, cancel_rx) = {
            let mut state = self.state.lock().await;
            if state.active {
                drop(state);
                self.logs.push("Cannot schedule: already streaming.");
                return false;
            }
            let delay = target - self.clock.now();
            if delay <= chrono::Duration::zero() {
                drop(state);
                self.logs.push("Scheduled time is in the past.");
                return false;
            }
            if let Some(cancel) = state.schedule_cancel.take() {
                let _ = cancel.send(());
            }
            state.scheduled_at = Some(target);
            state.source = Some(source.to_string());
            state.stream_key = Some(stream_key.to_string());
            state.config = config;
            let (cancel_tx, cancel_rx) = oneshot::channel();
            state.schedule_cancel = Some(cancel_tx);
            (delay, cancel_rx)
        };

        self.logs.push(format!(
            "Stream scheduled for {}",
            target.format("%Y-%m-%d %H:%M:%S")
        ));
        let wait = delay.to_std().unwrap_or_default();
        self.logs.push(format!(
            "Waiting {:.1} seconds for scheduled stream",
            wait.as_secs_f64()
        ));

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(wait) => {
                    manager.fire_scheduled().await;
                }
                _ = cancel_rx => {}
            }
        });
        true
    }

    /// Disarms a pending schedule, waking its timer.
    pub async fn cancel_schedule(&self) -> bool {
        {
            let mut state = self.state.lock().await;
            if state.scheduled_at.take().is_none() {
                drop(state);
                self.logs.push("No scheduled stream to cancel.");
                return false;
            }
            if let Some(cancel) = state.schedule_cancel.take() {
                let _ = cancel.send(());
            }
        }
        self.logs.push("Scheduled stream was canceled.");
        true
    }

    /// The schedule timer's callback: consumes the armed schedule and starts
    /// the stored request. A schedule cleared in the meantime no-ops.
    pub(crate) async fn fire_scheduled(self: &Arc<Self>) -> bool {
        let (source, stream_key, config) = {
            let mut state = self.state.lock().await;
            if state.scheduled_at.take().is_none() {
                drop(state);
                self.logs.push("Scheduled stream was canceled.");
                return false;
            }
            state.schedule_cancel = None;
            (
                state.source.clone(),
                state.stream_key.clone(),
                state.config.clone(),
            )
        };

        match (source, stream_key) {
            (Some(source), Some(stream_key)) if !source.is_empty() && !stream_key.is_empty() => {
                self.start_streaming(&source, &stream_key, config).await
            }
            _ => {
                self.logs
                    .push("Cannot start scheduled stream: missing source or stream key.");
                false
            }
        }
    }

    /// Whole seconds since streaming began, 0 while idle.
    pub async fn stream_duration_secs(&self) -> u64 {
        let state = self.state.lock().await;
        match (state.active, state.started_at) {
            (true, Some(started)) => (self.clock.now() - started).num_seconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Drain task: spawns the encoder, filters its output into the log, and
    /// reconciles session state once the process goes away.
    async fn run_encoder(self: Arc<Self>, args: Vec<String>) {
        if !self.state.lock().await.active {
            // stopped before the launch got underway
            return;
        }

        let handle = match self.launcher.launch(&args) {
            Ok(handle) => handle,
            Err(err) => {
                self.logs.push(format!("Streaming error: {}", err));
                self.finish_drain().await;
                return;
            }
        };
        {
            let mut state = self.state.lock().await;
            if !state.active {
                // a stop landed while the launch was in flight; the spawned
                // encoder must not be left running with no pid on record
                drop(state);
                self.discard_spawn(handle).await;
                return;
            }
            state.encoder_pid = handle.pid();
        }

        if let Err(err) = self.drain_output(handle).await {
            self.logs.push(format!("Streaming error: {}", err));
        }
        self.finish_drain().await;
    }

    async fn drain_output(&self, handle: EncoderHandle) -> io::Result<()> {
        let EncoderHandle { output, child } = handle;
        let mut filter = ProgressFilter::new(PROGRESS_LOG_INTERVAL);
        let mut lines = BufReader::new(output).lines();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if !line.is_empty() && filter.admit(line, Instant::now()) {
                self.logs.push(line);
            }
        }

        if let Some(mut child) = child {
            child.wait().await?;
        }
        Ok(())
    }

    /// Terminates and reaps an encoder whose stop request won the race
    /// against its own launch.
    async fn discard_spawn(&self, handle: EncoderHandle) {
        if let Some(pid) = handle.pid() {
            if let Err(err) = crate::encoder::terminate(pid) {
                warn!("SIGTERM to encoder pid {} failed: {}", pid, err);
            }
        }
        if let Some(mut child) = handle.child {
            let _ = child.wait().await;
        }
    }

    /// An exit while still marked active was not requested by the caller.
    async fn finish_drain(&self) {
        let mut state = self.state.lock().await;
        state.encoder_pid = None;
        if state.active {
            state.active = false;
            state.started_at = None;
            drop(state);
            self.logs.push("Stream ended unexpectedly.");
        }
    }
}

fn basename(source: &str) -> &str {
    Path::new(source)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Condvar, Mutex as StdMutex};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};

    /// Scripted encoder: hands out held-open pipes instead of processes.
    struct FakeLauncher {
        writers: StdMutex<Vec<DuplexStream>>,
        fail: bool,
    }

    impl FakeLauncher {
        fn new() -> Self {
            FakeLauncher {
                writers: StdMutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            FakeLauncher {
                writers: StdMutex::new(Vec::new()),
                fail: true,
            }
        }

        fn has_writer(&self) -> bool {
            !self.writers.lock().unwrap().is_empty()
        }

        fn take_writer(&self) -> DuplexStream {
            self.writers.lock().unwrap().remove(0)
        }
    }

    impl Launcher for FakeLauncher {
        fn launch(&self, _args: &[String]) -> io::Result<EncoderHandle> {
            if self.fail {
                return Err(io::Error::new(io::ErrorKind::NotFound, "encoder missing"));
            }
            let (writer, reader) = duplex(1024);
            self.writers.lock().unwrap().push(writer);
            Ok(EncoderHandle {
                output: Box::new(reader),
                child: None,
            })
        }
    }

    /// Launcher that parks inside `launch` until the test opens the gate,
    /// exposing the window between the spawn request and the pid record.
    struct GateLauncher {
        entered: AtomicBool,
        open: StdMutex<bool>,
        gate: Condvar,
        writers: StdMutex<Vec<DuplexStream>>,
    }

    impl GateLauncher {
        fn new() -> Self {
            GateLauncher {
                entered: AtomicBool::new(false),
                open: StdMutex::new(false),
                gate: Condvar::new(),
                writers: StdMutex::new(Vec::new()),
            }
        }

        fn entered(&self) -> bool {
            self.entered.load(Ordering::SeqCst)
        }

        fn release(&self) {
            let mut open = self.open.lock().unwrap();
            *open = true;
            self.gate.notify_all();
        }

        fn has_writer(&self) -> bool {
            !self.writers.lock().unwrap().is_empty()
        }

        fn take_writer(&self) -> DuplexStream {
            self.writers.lock().unwrap().remove(0)
        }
    }

    impl Launcher for GateLauncher {
        fn launch(&self, _args: &[String]) -> io::Result<EncoderHandle> {
            self.entered.store(true, Ordering::SeqCst);
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.gate.wait(open).unwrap();
            }
            drop(open);
            let (writer, reader) = duplex(1024);
            self.writers.lock().unwrap().push(writer);
            Ok(EncoderHandle {
                output: Box::new(reader),
                child: None,
            })
        }
    }

    fn setup() -> (Arc<StreamManager>, Arc<FakeClock>, Arc<FakeLauncher>) {
        let clock = Arc::new(FakeClock::at(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let launcher = Arc::new(FakeLauncher::new());
        let manager = Arc::new(StreamManager::new(clock.clone(), launcher.clone()));
        (manager, clock, launcher)
    }

    async fn wait_for<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn start_records_session_and_logs_source() {
        let (manager, _, _) = setup();
        assert!(
            manager
                .start_streaming("a.mp4", "KEY1", StreamConfig::default())
                .await
        );
        assert!(manager.is_active().await);
        assert!(manager.logs().contains("Started streaming: a.mp4"));
    }

    #[tokio::test]
    async fn second_start_is_rejected() {
        let (manager, clock, _) = setup();
        assert!(
            manager
                .start_streaming("a.mp4", "KEY1", StreamConfig::default())
                .await
        );
        clock.advance_secs(5);
        assert!(
            !manager
                .start_streaming("b.mp4", "KEY2", StreamConfig::default())
                .await
        );
        assert!(manager.logs().contains("Already streaming"));
        // first session untouched: duration still counts from the first start
        assert_eq!(manager.stream_duration_secs().await, 5);
    }

    #[tokio::test]
    async fn start_requires_source_and_key() {
        let (manager, _, _) = setup();
        assert!(
            !manager
                .start_streaming("", "KEY1", StreamConfig::default())
                .await
        );
        assert!(
            !manager
                .start_streaming("a.mp4", "", StreamConfig::default())
                .await
        );
        assert!(!manager.is_active().await);
        assert!(manager.logs().contains("must be provided"));
    }

    #[tokio::test]
    async fn stop_when_idle_is_rejected() {
        let (manager, _, _) = setup();
        assert!(!manager.stop_streaming().await);
        let logs = manager.logs().snapshot();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].contains("No active stream to stop."));
    }

    #[tokio::test]
    async fn stop_clears_session() {
        let (manager, _, _) = setup();
        assert!(
            manager
                .start_streaming("a.mp4", "KEY1", StreamConfig::default())
                .await
        );
        assert!(manager.stop_streaming().await);
        assert!(!manager.is_active().await);
        assert_eq!(manager.stream_duration_secs().await, 0);
        assert!(manager.logs().contains("Streaming stopped successfully."));
    }

    #[tokio::test]
    async fn duration_follows_the_clock() {
        let (manager, clock, _) = setup();
        assert_eq!(manager.stream_duration_secs().await, 0);
        manager
            .start_streaming("a.mp4", "KEY1", StreamConfig::default())
            .await;
        assert_eq!(manager.stream_duration_secs().await, 0);
        clock.advance_secs(3);
        assert_eq!(manager.stream_duration_secs().await, 3);
        clock.advance_secs(40);
        assert_eq!(manager.stream_duration_secs().await, 43);
    }

    #[tokio::test]
    async fn schedule_in_the_past_is_rejected() {
        let (manager, clock, _) = setup();
        let target = clock.now() - chrono::Duration::seconds(1);
        assert!(
            !manager
                .schedule_stream("a.mp4", "KEY1", StreamConfig::default(), target)
                .await
        );
        assert!(manager.scheduled_at().await.is_none());
        assert!(manager.logs().contains("Scheduled time is in the past."));
    }

    #[tokio::test]
    async fn schedule_while_active_is_rejected() {
        let (manager, clock, _) = setup();
        manager
            .start_streaming("a.mp4", "KEY1", StreamConfig::default())
            .await;
        let target = clock.now() + chrono::Duration::hours(1);
        assert!(
            !manager
                .schedule_stream("a.mp4", "KEY1", StreamConfig::default(), target)
                .await
        );
        assert!(manager.logs().contains("Cannot schedule: already streaming."));
    }

    #[tokio::test]
    async fn armed_schedule_starts_on_fire() {
        let (manager, clock, _) = setup();
        let target = clock.now() + chrono::Duration::hours(1);
        assert!(
            manager
                .schedule_stream("a.mp4", "KEY1", StreamConfig::default(), target)
                .await
        );
        assert_eq!(manager.scheduled_at().await, Some(target));
        assert!(!manager.is_active().await);
        assert_eq!(manager.stream_duration_secs().await, 0);

        assert!(manager.fire_scheduled().await);
        assert!(manager.is_active().await);
        assert!(manager.scheduled_at().await.is_none());
        assert!(manager.logs().contains("Started streaming: a.mp4"));
    }

    #[tokio::test]
    async fn cancelled_schedule_does_not_fire() {
        let (manager, clock, _) = setup();
        let target = clock.now() + chrono::Duration::hours(1);
        assert!(
            manager
                .schedule_stream("a.mp4", "KEY1", StreamConfig::default(), target)
                .await
        );
        assert!(manager.cancel_schedule().await);
        assert!(manager.scheduled_at().await.is_none());

        assert!(!manager.fire_scheduled().await);
        assert!(!manager.is_active().await);
        assert!(manager.logs().contains("Scheduled stream was canceled."));
    }

    #[tokio::test]
    async fn cancel_without_schedule_is_rejected() {
        let (manager, _, _) = setup();
        assert!(!manager.cancel_schedule().await);
        assert!(manager.logs().contains("No scheduled stream to cancel."));
    }

    #[tokio::test]
    async fn drain_logs_errors_and_flags_unexpected_exit() {
        let (manager, _, launcher) = setup();
        manager
            .start_streaming("a.mp4", "KEY1", StreamConfig::default())
            .await;
        {
            let launcher = launcher.clone();
            wait_for(move || launcher.has_writer()).await;
        }

        let mut writer = launcher.take_writer();
        writer
            .write_all(b"Error: connection refused\n")
            .await
            .unwrap();
        writer.flush().await.unwrap();
        {
            let manager = manager.clone();
            wait_for(move || manager.logs().contains("Error: connection refused")).await;
        }
        assert!(manager.is_active().await);

        // encoder dies without a stop being issued
        drop(writer);
        {
            let manager = manager.clone();
            wait_for(move || manager.logs().contains("Stream ended unexpectedly.")).await;
        }
        assert!(!manager.is_active().await);
        assert_eq!(manager.stream_duration_secs().await, 0);
    }

    #[tokio::test]
    async fn requested_stop_is_not_an_unexpected_exit() {
        let (manager, _, launcher) = setup();
        manager
            .start_streaming("a.mp4", "KEY1", StreamConfig::default())
            .await;
        {
            let launcher = launcher.clone();
            wait_for(move || launcher.has_writer()).await;
        }

        assert!(manager.stop_streaming().await);
        let writer = launcher.take_writer();
        drop(writer);

        // drain task winds down without flagging the exit
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!manager.logs().contains("Stream ended unexpectedly."));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_during_launch_discards_the_late_spawn() {
        let clock = Arc::new(FakeClock::at(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let launcher = Arc::new(GateLauncher::new());
        let manager = Arc::new(StreamManager::new(clock, launcher.clone()));

        assert!(
            manager
                .start_streaming("a.mp4", "KEY1", StreamConfig::default())
                .await
        );
        {
            let launcher = launcher.clone();
            wait_for(move || launcher.entered()).await;
        }

        // stop wins the race while launch is still in flight
        assert!(manager.stop_streaming().await);
        assert!(!manager.is_active().await);

        launcher.release();
        {
            let launcher = launcher.clone();
            wait_for(move || launcher.has_writer()).await;
        }

        // the late spawn is discarded, not drained: its output side closes
        let mut writer = launcher.take_writer();
        let mut closed = false;
        for _ in 0..100 {
            match tokio::time::timeout(
                Duration::from_millis(20),
                writer.write_all(b"frame=1 speed=1.0x\n"),
            )
            .await
            {
                Ok(Err(_)) => {
                    closed = true;
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        assert!(closed, "encoder output still being held after stop");
        assert!(!manager.is_active().await);
        assert!(!manager.logs().contains("Stream ended unexpectedly."));
    }

    #[tokio::test]
    async fn failed_launch_clears_active() {
        let clock = Arc::new(FakeClock::at(
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
        ));
        let launcher = Arc::new(FakeLauncher::failing());
        let manager = Arc::new(StreamManager::new(clock, launcher));

        assert!(
            manager
                .start_streaming("a.mp4", "KEY1", StreamConfig::default())
                .await
        );
        {
            let manager = manager.clone();
            wait_for(move || manager.logs().contains("Streaming error: encoder missing")).await;
        }
        assert!(!manager.is_active().await);
    }
}
