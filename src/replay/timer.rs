//! Tokio driver for a local replay.
//!
//! [`ReplayTimer`] spawns a task that calls [`ReplayEngine::tick`] once per
//! tick period and listens for [`ReplayControl`] messages in between.

use super::{ReplayEngine, ReplayError, ReplayState, TickOutcome};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};

/// Engine shared between the timer task and the caller
pub type SharedEngine = Arc<Mutex<ReplayEngine>>;

pub(crate) fn lock(engine: &Mutex<ReplayEngine>) -> MutexGuard<'_, ReplayEngine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Messages accepted by a running timer
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReplayControl {
    Pause,
    Resume,
    SetSpeed(f64),
    Stop,
}

/// Spawns timer tasks
pub struct ReplayTimer;

impl ReplayTimer {
    /// Starts a local replay on `engine` and drives it.
    pub fn start(
        engine: SharedEngine,
        start_time: DateTime<Utc>,
        speed: f64,
        show_historical: bool,
    ) -> Result<ReplayTimerHandle, ReplayError> {
        lock(&engine).start(start_time, speed, show_historical)?;
        Ok(Self::spawn(engine))
    }

    /// Drives an engine whose session was already started.
    pub fn spawn(engine: SharedEngine) -> ReplayTimerHandle {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(engine, control_rx));
        ReplayTimerHandle {
            control: control_tx,
            task,
        }
    }
}

/// Handle to a running timer task
#[derive(Debug)]
pub struct ReplayTimerHandle {
    control: mpsc::UnboundedSender<ReplayControl>,
    task: JoinHandle<()>,
}

impl ReplayTimerHandle {
    pub fn pause(&self) -> Result<(), ReplayError> {
        self.send(ReplayControl::Pause)
    }

    pub fn resume(&self) -> Result<(), ReplayError> {
        self.send(ReplayControl::Resume)
    }

    pub fn set_speed(&self, speed: f64) -> Result<(), ReplayError> {
        super::validate_speed(speed)?;
        self.send(ReplayControl::SetSpeed(speed))
    }

    /// Cancels the pending tick and stops the replay (restoring the
    /// original series).
    pub fn stop(&self) -> Result<(), ReplayError> {
        self.send(ReplayControl::Stop)
    }

    fn send(&self, control: ReplayControl) -> Result<(), ReplayError> {
        self.control
            .send(control)
            .map_err(|_| ReplayError::NotRunning)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the task to end, aborting it after `limit`.
    ///
    /// Returns false if the task had to be aborted.
    pub async fn join(mut self, limit: Duration) -> bool {
        match timeout(limit, &mut self.task).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("Replay timer did not finish within {:?}, aborting", limit);
                self.task.abort();
                false
            }
        }
    }
}

pub(super) async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run(engine: SharedEngine, mut control: mpsc::UnboundedReceiver<ReplayControl>) {
    let (interval, grace) = {
        let engine = lock(&engine);
        (engine.tick_interval(), engine.config().restore_grace)
    };
    let Some(mut interval) = interval else {
        tracing::debug!("Replay timer spawned without a session");
        return;
    };
    let mut deadline = Some(Instant::now() + interval);

    loop {
        tokio::select! {
            message = control.recv() => {
                let mut engine = lock(&engine);
                let result = match message {
                    Some(ReplayControl::Pause) => {
                        deadline = None;
                        engine.pause()
                    }
                    Some(ReplayControl::Resume) => {
                        let result = engine.resume();
                        deadline = Some(Instant::now() + interval);
                        result
                    }
                    Some(ReplayControl::SetSpeed(speed)) => {
                        let result = engine.set_speed(speed);
                        if let Some(next) = engine.tick_interval() {
                            interval = next;
                        }
                        if engine.state() == ReplayState::Running {
                            deadline = Some(Instant::now() + interval);
                        }
                        result
                    }
                    Some(ReplayControl::Stop) | None => {
                        engine.stop();
                        tracing::info!(symbol = engine.symbol(), "Replay timer stopped");
                        return;
                    }
                };
                if let Err(err) = result {
                    tracing::warn!("Replay control rejected: {}", err);
                }
            }

            _ = wait_until(deadline) => {
                let outcome = lock(&engine).tick();
                match outcome {
                    Ok(TickOutcome::Applied(_)) | Ok(TickOutcome::Idle) => {
                        deadline = Some(Instant::now() + interval);
                    }
                    Ok(TickOutcome::Completed) => break,
                    Err(err) => {
                        // MalformedBar already aborted and restored
                        tracing::warn!("Replay tick failed: {}", err);
                        if lock(&engine).state() == ReplayState::Stopped {
                            return;
                        }
                        deadline = Some(Instant::now() + interval);
                    }
                }
            }
        }
    }

    // Let the final bar settle before restoring the original series
    let restore_at = Instant::now() + grace;
    loop {
        tokio::select! {
            _ = sleep_until(restore_at) => {
                lock(&engine).restore_if_pending();
                return;
            }
            message = control.recv() => match message {
                Some(ReplayControl::Stop) | None => {
                    lock(&engine).stop();
                    return;
                }
                Some(other) => {
                    tracing::debug!("Ignoring {:?} after completion", other);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bar::Timeframe;
    use crate::replay::test_support::bars_with_closes;
    use crate::replay::{ReplayConfig, ReplayStatus};
    use chrono::TimeZone;
    use tokio::time::sleep;

    fn shared_engine(closes: &[f64]) -> SharedEngine {
        let mut engine = ReplayEngine::new(ReplayConfig::default());
        engine
            .load("GOLD", Timeframe::OneHour, bars_with_closes(closes))
            .unwrap();
        Arc::new(Mutex::new(engine))
    }

    fn start_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()
    }

    fn applied(engine: &SharedEngine) -> usize {
        lock(engine).store().len()
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_base_interval() {
        let engine = shared_engine(&[1.0, 2.0, 3.0, 4.0]);
        let _handle = ReplayTimer::start(engine.clone(), start_time(), 1.0, false).unwrap();

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(applied(&engine), 2);

        sleep(Duration::from_millis(1000)).await;
        assert_eq!(applied(&engine), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_cursor_and_resume_continues() {
        let engine = shared_engine(&[1.0, 2.0, 3.0, 4.0]);
        let handle = ReplayTimer::start(engine.clone(), start_time(), 1.0, false).unwrap();

        sleep(Duration::from_millis(1500)).await;
        handle.pause().unwrap();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(applied(&engine), 1);
        assert_eq!(lock(&engine).state(), ReplayState::Paused);

        handle.resume().unwrap();
        sleep(Duration::from_millis(1500)).await;

        let closes: Vec<f64> = lock(&engine).store().bars().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![1.0, 2.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speed_change_rearms_period() {
        let engine = shared_engine(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let handle = ReplayTimer::start(engine.clone(), start_time(), 1.0, false).unwrap();

        sleep(Duration::from_millis(1100)).await;
        handle.set_speed(4.0).unwrap();
        sleep(Duration::from_millis(600)).await;

        assert_eq!(applied(&engine), 3);
        assert_eq!(lock(&engine).session().unwrap().speed_multiplier, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_restores_after_grace() {
        let engine = shared_engine(&[1.0, 2.0, 3.0]);
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = statuses.clone();
        lock(&engine).subscribe_status(move |s| sink.lock().unwrap().push(s.clone()));

        let start = start_time() + chrono::Duration::hours(1);
        let handle = ReplayTimer::start(engine.clone(), start, 1.0, false).unwrap();

        // two bars, then the completing tick at 3s
        sleep(Duration::from_millis(3100)).await;
        assert_eq!(lock(&engine).state(), ReplayState::Stopped);
        assert_eq!(applied(&engine), 2);

        sleep(Duration::from_millis(500)).await;
        assert!(handle.join(Duration::from_secs(1)).await);
        assert_eq!(applied(&engine), 3);
        assert!(statuses
            .lock()
            .unwrap()
            .contains(&ReplayStatus::Completed { bars_replayed: 2 }));
        assert!(statuses
            .lock()
            .unwrap()
            .contains(&ReplayStatus::Restored { bars: 3 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_pending_tick() {
        let engine = shared_engine(&[1.0, 2.0, 3.0]);
        let handle = ReplayTimer::start(engine.clone(), start_time(), 1.0, false).unwrap();

        sleep(Duration::from_millis(1500)).await;
        handle.stop().unwrap();
        assert!(handle.join(Duration::from_secs(1)).await);

        let engine = lock(&engine);
        assert_eq!(engine.state(), ReplayState::Stopped);
        assert_eq!(engine.store().bars(), engine.original_bars());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_data_does_not_spawn() {
        let engine = shared_engine(&[1.0]);
        let late = start_time() + chrono::Duration::days(1);
        let result = ReplayTimer::start(engine.clone(), late, 1.0, true);
        assert!(matches!(result, Err(ReplayError::NoReplayData)));
    }
}
