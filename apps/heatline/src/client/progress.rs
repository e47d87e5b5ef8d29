//! Progress and cancellation plumbing for long-running engine queries.
//!
//! The engine reports progress through `$/progress` notifications keyed by
//! a token the client attached to the request. A `ProgressRouter` fans
//! those out to per-call listeners; a `ProgressBridge` turns them into
//! indicator events for the host UI, keeps the forwarded percentage
//! monotonic whatever the engine sends, and wires the indicator's cancel
//! affordance back to a `$/cancelRequest`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use engine_proto::{CancelParams, ProgressParams, ProgressToken, WorkDoneProgress, methods};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tracing::debug;
use uuid::Uuid;

use super::dispatcher::{Dispatcher, RpcFailure, decode};

/// Routes server progress events to the listener registered for a token.
#[derive(Default)]
pub struct ProgressRouter {
    listeners: Mutex<HashMap<ProgressToken, mpsc::UnboundedSender<WorkDoneProgress>>>,
}

impl ProgressRouter {
    /// Registers a listener; dropping the returned guard detaches it.
    pub fn register(
        self: &Arc<Self>,
        token: ProgressToken,
    ) -> (ProgressListenerGuard, mpsc::UnboundedReceiver<WorkDoneProgress>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .expect("progress listener lock poisoned")
            .insert(token.clone(), tx);
        let guard = ProgressListenerGuard {
            router: Arc::clone(self),
            token,
        };
        (guard, rx)
    }

    pub fn dispatch(&self, params: ProgressParams) {
        let listeners = self
            .listeners
            .lock()
            .expect("progress listener lock poisoned");
        match listeners.get(&params.token) {
            Some(listener) => {
                let _ = listener.send(params.value);
            }
            None => {
                debug!(
                    target: "heatline::client",
                    token = %params.token,
                    "progress for unknown token"
                );
            }
        }
    }

    fn unregister(&self, token: &ProgressToken) {
        self.listeners
            .lock()
            .expect("progress listener lock poisoned")
            .remove(token);
    }
}

pub struct ProgressListenerGuard {
    router: Arc<ProgressRouter>,
    token: ProgressToken,
}

impl Drop for ProgressListenerGuard {
    fn drop(&mut self) {
        self.router.unregister(&self.token);
    }
}

/// Completion state of one progress session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Pending,
    Done,
    Cancelled,
}

/// Book-keeping for one tracked call: the token it registered, the
/// cumulative percentage already forwarded, and how it ended.
#[derive(Debug)]
pub struct ProgressSession {
    token: ProgressToken,
    last_reported: u32,
    completion: Completion,
}

impl ProgressSession {
    pub fn new(token: ProgressToken) -> Self {
        Self {
            token,
            last_reported: 0,
            completion: Completion::Pending,
        }
    }

    pub fn token(&self) -> &ProgressToken {
        &self.token
    }

    pub fn last_reported(&self) -> u32 {
        self.last_reported
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    /// Folds a raw engine percentage into the monotonic cumulative value
    /// and returns the increment to forward. Out-of-range and regressing
    /// reports contribute nothing.
    pub fn advance(&mut self, percentage: f64) -> u32 {
        let clamped = percentage.clamp(0.0, 100.0) as u32;
        let delta = clamped.saturating_sub(self.last_reported);
        self.last_reported += delta;
        delta
    }

    /// Records how the session ended. Only the first call has any effect;
    /// later calls (from redundant cleanup paths) are no-ops.
    pub fn finish(&mut self, outcome: Completion) -> bool {
        if self.completion != Completion::Pending || outcome == Completion::Pending {
            return false;
        }
        self.completion = outcome;
        true
    }
}

/// What the host's progress indicator is told. `Report` deltas are
/// already monotonic; their sum stays within 100.
#[derive(Debug, Clone, PartialEq)]
pub enum IndicatorEvent {
    Begin {
        title: String,
        cancellable: bool,
        message: Option<String>,
    },
    Report {
        message: Option<String>,
        delta: u32,
    },
    End {
        message: Option<String>,
    },
}

struct CancelShared {
    flag: AtomicBool,
    notify: Notify,
}

/// Advisory cancellation: releases the local wait and tells the engine,
/// but does not retract work it already started.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<CancelShared>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(CancelShared {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn cancel(&self) {
        if !self.shared.flag.swap(true, Ordering::SeqCst) {
            self.shared.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.shared.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    fn same_as(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// How a tracked call ended: with a value, or released by cancellation.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled<T> {
    Done(T),
    Cancelled,
}

impl<T> Settled<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Settled<U> {
        match self {
            Settled::Done(value) => Settled::Done(f(value)),
            Settled::Cancelled => Settled::Cancelled,
        }
    }
}

/// Wraps progress-capable dispatcher calls for one indicator surface.
/// Single-flight: when a new call's `begin` arrives while an earlier
/// call's indicator is still open, the earlier call is cancelled first.
pub struct ProgressBridge {
    sink: mpsc::UnboundedSender<IndicatorEvent>,
    active: Mutex<Option<CancelHandle>>,
}

impl ProgressBridge {
    pub fn new(sink: mpsc::UnboundedSender<IndicatorEvent>) -> Self {
        Self {
            sink,
            active: Mutex::new(None),
        }
    }

    /// Cancels whichever call currently owns the indicator, if any.
    /// This is the indicator's cancel affordance.
    pub fn cancel_active(&self) {
        let active = self
            .active
            .lock()
            .expect("active session lock poisoned")
            .clone();
        if let Some(handle) = active {
            handle.cancel();
        }
    }

    /// Issues `method` with a fresh progress token and forwards progress
    /// to the indicator sink until the call settles or is cancelled.
    pub async fn call<T: DeserializeOwned>(
        &self,
        dispatcher: &Dispatcher,
        method: &str,
        mut params: Value,
    ) -> Result<Settled<T>, RpcFailure> {
        let token: ProgressToken = Uuid::new_v4().to_string();
        let router = dispatcher.progress();
        let (listener, mut events) = router.register(token.clone());

        if let Value::Object(map) = &mut params {
            map.insert("workDoneToken".to_string(), Value::String(token.clone()));
        }

        let id = dispatcher.next_request_id();
        let cancel = CancelHandle::new();
        let mut session = ProgressSession::new(token);
        let mut begun = false;
        let mut events_open = true;

        let request = dispatcher.request_with_id(id, method, Some(params));
        tokio::pin!(request);

        let settled: Result<Settled<Value>, RpcFailure> = loop {
            tokio::select! {
                outcome = &mut request => {
                    // Frames are ordered, so progress the engine emitted
                    // before its response is already queued; flush it to
                    // the indicator before settling.
                    while let Ok(event) = events.try_recv() {
                        self.forward_event(&cancel, &mut session, &mut begun, event);
                    }
                    break outcome.map(Settled::Done);
                }
                _ = cancel.cancelled() => {
                    let params = serde_json::to_value(CancelParams { id }).unwrap_or(Value::Null);
                    let _ = dispatcher.notify(methods::CANCEL_REQUEST, Some(params));
                    break Ok(Settled::Cancelled);
                }
                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => {
                            self.forward_event(&cancel, &mut session, &mut begun, event);
                        }
                        None => events_open = false,
                    }
                }
            }
        };

        // Cleanup runs exactly once whichever path broke the loop: close
        // the indicator, release the cancel wiring, detach the listener.
        session.finish(match &settled {
            Ok(Settled::Cancelled) => Completion::Cancelled,
            _ => Completion::Done,
        });
        if begun {
            let _ = self.sink.send(IndicatorEvent::End { message: None });
        }
        self.release_active(&cancel);
        drop(listener);

        match settled? {
            Settled::Done(value) => Ok(Settled::Done(decode(value)?)),
            Settled::Cancelled => Ok(Settled::Cancelled),
        }
    }

    fn forward_event(
        &self,
        cancel: &CancelHandle,
        session: &mut ProgressSession,
        begun: &mut bool,
        event: WorkDoneProgress,
    ) {
        match event {
            WorkDoneProgress::Begin {
                title,
                cancellable,
                message,
                percentage,
            } => {
                self.adopt_active(cancel);
                *begun = true;
                let _ = self.sink.send(IndicatorEvent::Begin {
                    title,
                    cancellable: cancellable.unwrap_or(false),
                    message,
                });
                if let Some(percentage) = percentage {
                    let delta = session.advance(percentage);
                    if delta > 0 {
                        let _ = self.sink.send(IndicatorEvent::Report {
                            message: None,
                            delta,
                        });
                    }
                }
            }
            WorkDoneProgress::Report {
                message,
                percentage,
            } => {
                let delta = percentage
                    .map(|value| session.advance(value))
                    .unwrap_or(0);
                let _ = self.sink.send(IndicatorEvent::Report { message, delta });
            }
            WorkDoneProgress::End { message } => {
                if *begun {
                    let _ = self.sink.send(IndicatorEvent::End { message });
                    *begun = false;
                }
                // The response itself still settles the call.
            }
        }
    }

    /// Makes `handle` the indicator's current owner, cancelling the
    /// previous owner if the indicator was still open for it.
    fn adopt_active(&self, handle: &CancelHandle) {
        let previous = {
            let mut active = self.active.lock().expect("active session lock poisoned");
            let already_ours = active
                .as_ref()
                .map(|current| current.same_as(handle))
                .unwrap_or(false);
            if already_ours {
                return;
            }
            active.replace(handle.clone())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn release_active(&self, handle: &CancelHandle) {
        let mut active = self.active.lock().expect("active session lock poisoned");
        let ours = active
            .as_ref()
            .map(|current| current.same_as(handle))
            .unwrap_or(false);
        if ours {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarded_percentage_is_monotonic_and_bounded() {
        let mut session = ProgressSession::new("token".to_string());
        let reports = [30.0, 10.0, -5.0, 55.0, 40.0, 250.0, 80.0];
        let mut cumulative = 0u32;
        let mut previous = 0u32;
        for report in reports {
            cumulative += session.advance(report);
            assert!(session.last_reported() >= previous);
            previous = session.last_reported();
            assert!(session.last_reported() <= 100);
        }
        assert_eq!(cumulative, session.last_reported());
        assert_eq!(session.last_reported(), 100);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut session = ProgressSession::new("token".to_string());
        assert!(session.finish(Completion::Cancelled));
        assert!(!session.finish(Completion::Done));
        assert!(!session.finish(Completion::Cancelled));
        assert_eq!(session.completion(), Completion::Cancelled);
    }

    #[test]
    fn pending_is_not_a_valid_outcome() {
        let mut session = ProgressSession::new("token".to_string());
        assert!(!session.finish(Completion::Pending));
        assert_eq!(session.completion(), Completion::Pending);
    }

    #[tokio::test]
    async fn router_delivers_by_token_and_guard_detaches() {
        let router = Arc::new(ProgressRouter::default());
        let (guard, mut events) = router.register("abc".to_string());

        router.dispatch(ProgressParams {
            token: "abc".to_string(),
            value: WorkDoneProgress::End { message: None },
        });
        router.dispatch(ProgressParams {
            token: "other".to_string(),
            value: WorkDoneProgress::End { message: None },
        });
        assert_eq!(
            events.recv().await,
            Some(WorkDoneProgress::End { message: None })
        );

        drop(guard);
        router.dispatch(ProgressParams {
            token: "abc".to_string(),
            value: WorkDoneProgress::End { message: None },
        });
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn cancel_handle_wakes_waiters_once() {
        let handle = CancelHandle::new();
        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.cancelled().await })
        };
        handle.cancel();
        waiter.await.expect("waiter completes");
        assert!(handle.is_cancelled());
        // Cancelling again is harmless.
        handle.cancel();
        handle.cancelled().await;
    }
}
