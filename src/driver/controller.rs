//! Session-driving control loop.
//!
//! One `tokio::select!` task multiplexes the UI command channel, the
//! fixed-interval status poll timer, the idle-delay iteration timer and the
//! in-flight call futures. Network calls are held as futures in the select
//! rather than spawned, so timers keep firing while a call is outstanding and
//! tearing down the loop drops whatever is still in flight.

use super::state::DriverState;
use crate::api::{ApiError, SessionApi};
use crate::model::{DriverConfig, RetryPolicy, SessionEvent, SessionSnapshot};
use anyhow::Result;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::Sleep;

/// Commands emitted by UI layers to control the driver.
#[derive(Debug, Clone)]
pub(crate) enum UiCommand {
    /// Start a session for the given task text.
    Start(String),
    /// Send a system prompt update for the active session.
    UpdatePrompt(String),
    Quit,
}

type CallFuture<T> = Pin<Box<dyn Future<Output = Result<T, ApiError>> + Send>>;

fn arm(d: Duration) -> Pin<Box<Sleep>> {
    Box::pin(tokio::time::sleep(d))
}

/// Await an armed timer, or park forever when the slot is empty.
async fn timer_fired(slot: &mut Option<Pin<Box<Sleep>>>) {
    match slot.as_mut() {
        Some(sleep) => sleep.as_mut().await,
        None => futures::future::pending().await,
    }
}

/// Await an in-flight call, or park forever when the slot is empty.
async fn call_resolved<T>(slot: &mut Option<CallFuture<T>>) -> Result<T, ApiError> {
    match slot.as_mut() {
        Some(fut) => fut.as_mut().await,
        None => futures::future::pending().await,
    }
}

async fn with_retry<T, F, Fut>(policy: RetryPolicy, mut call: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0u32;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.attempts => {
                attempt += 1;
                log::debug!("retrying after error (attempt {attempt}): {e}");
                tokio::time::sleep(policy.backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn make_start<A>(
    api: &A,
    retry: RetryPolicy,
    task: String,
    budget: Option<u32>,
) -> CallFuture<String>
where
    A: SessionApi + Clone + 'static,
{
    let api = api.clone();
    Box::pin(async move {
        with_retry(retry, || {
            let api = api.clone();
            let task = task.clone();
            async move { api.start_session(&task, budget).await }
        })
        .await
    })
}

fn make_trigger<A>(api: &A, retry: RetryPolicy, session_id: String) -> CallFuture<()>
where
    A: SessionApi + Clone + 'static,
{
    let api = api.clone();
    Box::pin(async move {
        with_retry(retry, || {
            let api = api.clone();
            let session_id = session_id.clone();
            async move { api.trigger_iteration(&session_id).await }
        })
        .await
    })
}

fn make_poll<A>(api: &A, retry: RetryPolicy, session_id: String) -> CallFuture<SessionSnapshot>
where
    A: SessionApi + Clone + 'static,
{
    let api = api.clone();
    Box::pin(async move {
        with_retry(retry, || {
            let api = api.clone();
            let session_id = session_id.clone();
            async move { api.fetch_status(&session_id).await }
        })
        .await
    })
}

fn make_prompt_update<A>(
    api: &A,
    retry: RetryPolicy,
    session_id: String,
    new_prompt: String,
) -> CallFuture<()>
where
    A: SessionApi + Clone + 'static,
{
    let api = api.clone();
    Box::pin(async move {
        with_retry(retry, || {
            let api = api.clone();
            let session_id = session_id.clone();
            let new_prompt = new_prompt.clone();
            async move { api.update_system_prompt(&session_id, &new_prompt).await }
        })
        .await
    })
}

/// Drive a session until told to quit.
///
/// Sub-loop discipline:
/// - The poll timer is rearmed only after the previous fetch resolves, so
///   polls never overlap.
/// - The idle timer is rearmed when the busy flag clears or the snapshot
///   changes; firing while busy is a skip, not an error.
/// - At most one trigger-iteration call is in flight at any time, enforced by
///   the busy flag in `DriverState`. This is a client-local guarantee only.
pub(crate) async fn run_driver<A>(
    api: A,
    cfg: DriverConfig,
    event_tx: UnboundedSender<SessionEvent>,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
) -> Result<()>
where
    A: SessionApi + Clone + Send + Sync + 'static,
{
    let mut state = DriverState::new();

    let mut poll_timer: Option<Pin<Box<Sleep>>> = None;
    let mut idle_timer: Option<Pin<Box<Sleep>>> = None;

    let mut start_call: Option<CallFuture<String>> = None;
    let mut poll_call: Option<CallFuture<SessionSnapshot>> = None;
    let mut iter_call: Option<CallFuture<()>> = None;
    let mut prompt_call: Option<CallFuture<()>> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UiCommand::Start(task)) => {
                        if state.is_armed() || start_call.is_some() {
                            log::debug!("ignoring start request: a session is already active");
                        } else {
                            start_call = Some(make_start(&api, cfg.retry, task, cfg.iteration_budget));
                        }
                    }
                    Some(UiCommand::UpdatePrompt(text)) => {
                        match state.session_id() {
                            Some(id) if prompt_call.is_none() => {
                                prompt_call = Some(make_prompt_update(&api, cfg.retry, id.to_string(), text));
                            }
                            Some(_) => {
                                let _ = event_tx.send(SessionEvent::Info(
                                    "prompt update already in flight".into(),
                                ));
                            }
                            None => {
                                let _ = event_tx.send(SessionEvent::Info(
                                    "no active session to update".into(),
                                ));
                            }
                        }
                    }
                    Some(UiCommand::Quit) | None => {
                        if let Some(snap) = state.snapshot() {
                            log::info!(
                                "shutting down with {} iterations observed",
                                snap.iterations.len()
                            );
                        }
                        state.shutdown();
                        break;
                    }
                }
            }
            res = call_resolved(&mut start_call) => {
                start_call = None;
                match res {
                    Ok(session_id) => {
                        if state.on_session_started(session_id.clone()) {
                            log::info!("session {session_id} started");
                            let _ = event_tx.send(SessionEvent::SessionStarted { session_id });
                            poll_timer = Some(arm(cfg.poll_interval));
                            idle_timer = Some(arm(cfg.idle_delay));
                        }
                    }
                    Err(e) => {
                        // A failed start is reported, not re-attempted; the
                        // initiator decides whether to try again.
                        log::error!("failed to start session: {e}");
                        let _ = event_tx.send(SessionEvent::StartFailed { error: e.to_string() });
                    }
                }
            }
            _ = timer_fired(&mut poll_timer) => {
                poll_timer = None;
                if let Some(id) = state.session_id() {
                    poll_call = Some(make_poll(&api, cfg.retry, id.to_string()));
                }
            }
            res = call_resolved(&mut poll_call) => {
                poll_call = None;
                let mut disarmed = false;
                match res {
                    Ok(snapshot) => {
                        let terminal = cfg.stop_on_complete && snapshot.is_terminal();
                        if state.apply_snapshot(snapshot.clone()) {
                            idle_timer = Some(arm(cfg.idle_delay));
                        }
                        let _ = event_tx.send(SessionEvent::Snapshot(snapshot));
                        if terminal {
                            if let Some(session_id) = state.disarm() {
                                log::info!("session {session_id} reached a terminal status");
                                let _ = event_tx.send(SessionEvent::SessionComplete { session_id });
                            }
                            idle_timer = None;
                            disarmed = true;
                        }
                    }
                    Err(e) => {
                        // Transient-fault tolerant: keep the last snapshot and
                        // keep polling on the fixed period.
                        log::warn!("status poll failed, keeping previous snapshot: {e}");
                        let _ = event_tx.send(SessionEvent::PollFailed { error: e.to_string() });
                    }
                }
                if !disarmed && state.is_armed() {
                    poll_timer = Some(arm(cfg.poll_interval));
                }
            }
            _ = timer_fired(&mut idle_timer) => {
                idle_timer = None;
                // Busy or disarmed yields None: skip without rearming. The
                // rearm on flag-clear picks the cycle back up.
                if let Some(session_id) = state.begin_iteration() {
                    log::debug!("triggering iteration for session {session_id}");
                    iter_call = Some(make_trigger(&api, cfg.retry, session_id));
                } else if state.busy() {
                    log::debug!("idle timer fired while an iteration is in flight, skipping");
                }
            }
            res = call_resolved(&mut iter_call) => {
                iter_call = None;
                if let Err(e) = res {
                    log::warn!("iteration trigger failed, loop continues: {e}");
                    let _ = event_tx.send(SessionEvent::IterationFailed { error: e.to_string() });
                }
                if state.finish_iteration() {
                    idle_timer = Some(arm(cfg.idle_delay));
                }
            }
            res = call_resolved(&mut prompt_call) => {
                prompt_call = None;
                match res {
                    Ok(()) => {
                        let _ = event_tx.send(SessionEvent::Info("system prompt updated".into()));
                    }
                    Err(e) => {
                        log::warn!("system prompt update failed: {e}");
                        let _ = event_tx.send(SessionEvent::Info(format!(
                            "prompt update failed: {e}"
                        )));
                    }
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{IterationRecord, RetryPolicy};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    fn server_err() -> ApiError {
        ApiError::Server {
            status: 500,
            detail: "boom".into(),
        }
    }

    fn snapshot(status: &str, n: usize) -> SessionSnapshot {
        SessionSnapshot {
            session_id: "abc123".into(),
            status: status.into(),
            iterations: (0..n)
                .map(|i| IterationRecord {
                    timestamp: format!("2024-05-01T10:00:{i:02}"),
                    kind: "tool_use".into(),
                    content: format!("step {i}"),
                })
                .collect(),
        }
    }

    #[derive(Default)]
    struct MockInner {
        fail_start: bool,
        fail_triggers: bool,
        trigger_delay: Duration,
        // Scripted poll responses; the last one repeats once exhausted.
        statuses: Mutex<VecDeque<Result<SessionSnapshot, ()>>>,
        last_status: Mutex<Option<Result<SessionSnapshot, ()>>>,
        trigger_calls: AtomicUsize,
        triggers_in_flight: AtomicUsize,
        max_triggers_in_flight: AtomicUsize,
        poll_calls: AtomicUsize,
    }

    #[derive(Clone, Default)]
    struct MockApi {
        inner: Arc<MockInner>,
    }

    impl MockApi {
        fn with_statuses(statuses: Vec<Result<SessionSnapshot, ()>>) -> Self {
            Self {
                inner: Arc::new(MockInner {
                    statuses: Mutex::new(statuses.into()),
                    ..Default::default()
                }),
            }
        }
    }

    #[async_trait::async_trait]
    impl SessionApi for MockApi {
        async fn start_session(
            &self,
            _task: &str,
            _iteration_budget: Option<u32>,
        ) -> Result<String, ApiError> {
            if self.inner.fail_start {
                return Err(server_err());
            }
            Ok("abc123".into())
        }

        async fn trigger_iteration(&self, _session_id: &str) -> Result<(), ApiError> {
            self.inner.trigger_calls.fetch_add(1, Ordering::SeqCst);
            let now = self.inner.triggers_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner
                .max_triggers_in_flight
                .fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.inner.trigger_delay).await;
            self.inner.triggers_in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.inner.fail_triggers {
                Err(server_err())
            } else {
                Ok(())
            }
        }

        async fn fetch_status(&self, _session_id: &str) -> Result<SessionSnapshot, ApiError> {
            self.inner.poll_calls.fetch_add(1, Ordering::SeqCst);
            let next = self.inner.statuses.lock().unwrap().pop_front();
            let entry = match next {
                Some(e) => {
                    *self.inner.last_status.lock().unwrap() = Some(e.clone());
                    e
                }
                None => self
                    .inner
                    .last_status
                    .lock()
                    .unwrap()
                    .clone()
                    .unwrap_or(Ok(snapshot("in_progress", 0))),
            };
            entry.map_err(|_| server_err())
        }

        async fn update_system_prompt(
            &self,
            _session_id: &str,
            _new_prompt: &str,
        ) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn test_config() -> DriverConfig {
        DriverConfig {
            base_url: "http://localhost:8000".into(),
            user_agent: "test".into(),
            poll_interval: Duration::from_secs(5),
            idle_delay: Duration::from_secs(2),
            stop_on_complete: false,
            retry: RetryPolicy::default(),
            iteration_budget: None,
        }
    }

    fn spawn_driver(
        api: MockApi,
        cfg: DriverConfig,
    ) -> (
        mpsc::UnboundedSender<UiCommand>,
        mpsc::UnboundedReceiver<SessionEvent>,
        JoinHandle<Result<()>>,
    ) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_driver(api, cfg, event_tx, cmd_rx));
        (cmd_tx, event_rx, handle)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_trigger_in_flight() {
        // Triggers take far longer than the idle delay; overlap would show up
        // in max_triggers_in_flight.
        let api = MockApi {
            inner: Arc::new(MockInner {
                trigger_delay: Duration::from_secs(30),
                ..Default::default()
            }),
        };
        let (cmd_tx, mut event_rx, handle) = spawn_driver(api.clone(), test_config());

        cmd_tx.send(UiCommand::Start("summarize X".into())).unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        cmd_tx.send(UiCommand::Quit).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(api.inner.max_triggers_in_flight.load(Ordering::SeqCst), 1);
        assert!(api.inner.trigger_calls.load(Ordering::SeqCst) >= 2);
        let events = drain(&mut event_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::SessionStarted { session_id } if session_id == "abc123")));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_failure_keeps_snapshot_and_loop_alive() {
        let api = MockApi::with_statuses(vec![Ok(snapshot("in_progress", 1)), Err(())]);
        let (cmd_tx, mut event_rx, handle) = spawn_driver(api.clone(), test_config());

        cmd_tx.send(UiCommand::Start("summarize X".into())).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        cmd_tx.send(UiCommand::Quit).unwrap();
        handle.await.unwrap().unwrap();

        let events = drain(&mut event_rx);
        let snapshots: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::Snapshot(_)))
            .collect();
        let failures = events
            .iter()
            .filter(|e| matches!(e, SessionEvent::PollFailed { .. }))
            .count();
        // Exactly one successful poll ever reached the UI; the previous
        // snapshot was never cleared by a failure.
        assert_eq!(snapshots.len(), 1);
        assert!(failures >= 2);
        // The poll loop kept its fixed period through failures.
        assert!(api.inner.poll_calls.load(Ordering::SeqCst) >= 4);
        // And the iteration loop kept driving regardless.
        assert!(api.inner.trigger_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_failure_rearms_idle_timer() {
        let api = MockApi {
            inner: Arc::new(MockInner {
                fail_triggers: true,
                ..Default::default()
            }),
        };
        let (cmd_tx, mut event_rx, handle) = spawn_driver(api.clone(), test_config());

        cmd_tx.send(UiCommand::Start("summarize X".into())).unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;
        cmd_tx.send(UiCommand::Quit).unwrap();
        handle.await.unwrap().unwrap();

        // Failures never stall the loop: it keeps attempting on each cycle.
        assert!(api.inner.trigger_calls.load(Ordering::SeqCst) >= 3);
        let failures = drain(&mut event_rx)
            .iter()
            .filter(|e| matches!(e, SessionEvent::IterationFailed { .. }))
            .count();
        assert!(failures >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_cancels_everything() {
        let api = MockApi {
            inner: Arc::new(MockInner {
                trigger_delay: Duration::from_secs(100),
                ..Default::default()
            }),
        };
        let (cmd_tx, mut event_rx, handle) = spawn_driver(api.clone(), test_config());

        cmd_tx.send(UiCommand::Start("summarize X".into())).unwrap();
        // Let the idle timer fire once so a trigger is in flight.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(api.inner.triggers_in_flight.load(Ordering::SeqCst), 1);
        let _ = drain(&mut event_rx);

        cmd_tx.send(UiCommand::Quit).unwrap();
        handle.await.unwrap().unwrap();

        // Well past when the delayed call would have resolved.
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert_eq!(api.inner.trigger_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.inner.poll_calls.load(Ordering::SeqCst), 0);
        // No events after teardown; the channel is closed.
        assert!(drain(&mut event_rx).is_empty());
        assert!(event_rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_status_disarms_when_configured() {
        let api = MockApi::with_statuses(vec![
            Ok(snapshot("in_progress", 0)),
            Ok(snapshot("complete", 2)),
        ]);
        let mut cfg = test_config();
        cfg.stop_on_complete = true;
        let (cmd_tx, mut event_rx, handle) = spawn_driver(api.clone(), cfg);

        cmd_tx.send(UiCommand::Start("summarize X".into())).unwrap();
        // Two poll periods: in_progress at 5s, complete at 10s.
        tokio::time::sleep(Duration::from_secs(12)).await;
        let polls_at_complete = api.inner.poll_calls.load(Ordering::SeqCst);
        let triggers_at_complete = api.inner.trigger_calls.load(Ordering::SeqCst);
        assert_eq!(polls_at_complete, 2);

        // Disarmed: no further polls or triggers, ever.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(api.inner.poll_calls.load(Ordering::SeqCst), polls_at_complete);
        assert_eq!(
            api.inner.trigger_calls.load(Ordering::SeqCst),
            triggers_at_complete
        );

        let events = drain(&mut event_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::SessionComplete { session_id } if session_id == "abc123")));

        cmd_tx.send(UiCommand::Quit).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_stays_idle() {
        let api = MockApi {
            inner: Arc::new(MockInner {
                fail_start: true,
                ..Default::default()
            }),
        };
        let (cmd_tx, mut event_rx, handle) = spawn_driver(api.clone(), test_config());

        cmd_tx.send(UiCommand::Start("summarize X".into())).unwrap();
        tokio::time::sleep(Duration::from_secs(15)).await;

        // No sub-loop ever armed.
        assert_eq!(api.inner.poll_calls.load(Ordering::SeqCst), 0);
        assert_eq!(api.inner.trigger_calls.load(Ordering::SeqCst), 0);
        let events = drain(&mut event_rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, SessionEvent::StartFailed { .. })));

        cmd_tx.send(UiCommand::Quit).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_first_iteration_appears_in_second_poll() {
        let api = MockApi::with_statuses(vec![
            Ok(SessionSnapshot {
                session_id: "abc123".into(),
                status: "running".into(),
                iterations: Vec::new(),
            }),
            Ok(SessionSnapshot {
                session_id: "abc123".into(),
                status: "running".into(),
                iterations: vec![IterationRecord {
                    timestamp: "2024-05-01T10:00:07.000001".into(),
                    kind: "tool_use".into(),
                    content: "...".into(),
                }],
            }),
        ]);
        let (cmd_tx, mut event_rx, handle) = spawn_driver(api.clone(), test_config());

        cmd_tx.send(UiCommand::Start("summarize X".into())).unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        cmd_tx.send(UiCommand::Quit).unwrap();
        handle.await.unwrap().unwrap();

        let events = drain(&mut event_rx);
        let snapshots: Vec<&SessionSnapshot> = events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::Snapshot(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].status, "running");
        assert!(snapshots[0].iterations.is_empty());
        assert_eq!(snapshots[1].iterations.len(), 1);
        assert_eq!(snapshots[1].iterations[0].kind, "tool_use");
        assert_eq!(snapshots[1].iterations[0].content, "...");
        // The iteration that produced it was triggered in between.
        assert!(api.inner.trigger_calls.load(Ordering::SeqCst) >= 1);
    }
}
