//! One-shot asynchronous operations with explicit success/failure completion.
//!
//! Every asynchronous action in the connection core is a
//! [`PendingOperation`]: it finishes exactly once, with either `succeeded`
//! or `failed(details)` preceding `finished`, and operations can be chained
//! with [`run_after`](PendingOperation::run_after).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::watch;

/// A small string-keyed bag describing a failure.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ErrorDetails {
    values: BTreeMap<String, String>,
}

impl ErrorDetails {
    pub const TEXT_KEY: &'static str = "text";

    pub fn from_text(text: impl Into<String>) -> Self {
        let mut details = Self::default();
        details.insert(Self::TEXT_KEY, text);
        details
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn text(&self) -> Option<&str> {
        self.values.get(Self::TEXT_KEY).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.values {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{key}: {value}")?;
            first = false;
        }
        Ok(())
    }
}

type Runner = Box<dyn FnOnce(Arc<PendingOperation>) + Send>;
type Callback = Box<dyn FnOnce() + Send>;
type FailureCallback = Box<dyn FnOnce(&ErrorDetails) + Send>;

struct OperationState {
    finished:     bool,
    succeeded:    bool,
    details:      ErrorDetails,
    runner:       Option<Runner>,
    on_succeeded: Vec<Callback>,
    on_failed:    Vec<FailureCallback>,
    on_finished:  Vec<Callback>,
}

/// A single-shot future with explicit success/failure completion.
///
/// `finished` callbacks fire exactly once per lifetime; exactly one of the
/// `succeeded` / `failed` callback sets runs before them, and failures
/// always carry non-empty details.
pub struct PendingOperation {
    label:       &'static str,
    weak_self:   Weak<PendingOperation>,
    state:       Mutex<OperationState>,
    finished_tx: watch::Sender<bool>,
}

impl PendingOperation {
    pub fn new(label: &'static str) -> Arc<Self> {
        let (finished_tx, _) = watch::channel(false);
        Arc::new_cyclic(|weak_self| Self {
            label,
            weak_self: weak_self.clone(),
            state: Mutex::new(OperationState {
                finished:     false,
                succeeded:    true,
                details:      ErrorDetails::default(),
                runner:       None,
                on_succeeded: Vec::new(),
                on_failed:    Vec::new(),
                on_finished:  Vec::new(),
            }),
            finished_tx,
        })
    }

    /// An operation that begins its work when started.
    pub fn with_runner(
        label: &'static str,
        runner: impl FnOnce(Arc<PendingOperation>) + Send + 'static,
    ) -> Arc<Self> {
        let operation = Self::new(label);
        operation.set_runner(runner);
        operation
    }

    /// An operation that fails on the next event-loop turn. Used to report
    /// setup errors without mutating any state.
    pub fn failed(label: &'static str, text: impl Into<String>) -> Arc<Self> {
        let operation = Self::new(label);
        operation.set_delayed_finished_with_error(ErrorDetails::from_text(text));
        operation
    }

    pub fn set_runner(&self, runner: impl FnOnce(Arc<PendingOperation>) + Send + 'static) {
        self.state.lock().unwrap().runner = Some(Box::new(runner));
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    pub fn is_succeeded(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.finished && state.succeeded
    }

    pub fn error_details(&self) -> ErrorDetails {
        self.state.lock().unwrap().details.clone()
    }

    fn strong(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    /// Begin the operation's work. A second call finds no runner left and
    /// does nothing.
    pub fn start(&self) {
        let runner = self.state.lock().unwrap().runner.take();
        if let (Some(runner), Some(this)) = (runner, self.strong()) {
            runner(this);
        }
    }

    /// Schedule [`start`](Self::start) for the next event-loop turn.
    pub fn start_later(&self) {
        if let Some(this) = self.strong() {
            tokio::spawn(async move { this.start() });
        }
    }

    /// Mark done with the current success state and notify subscribers.
    /// Re-invocation is a logged no-op.
    pub fn set_finished(&self) {
        let (succeeded, details, on_succeeded, on_failed, on_finished) = {
            let mut state = self.state.lock().unwrap();
            if state.finished {
                log::warn!("[operation] {} is already finished", self.label);
                return;
            }
            state.finished = true;
            if !state.succeeded && state.details.is_empty() {
                state.details = ErrorDetails::from_text("unknown error");
            }
            (
                state.succeeded,
                state.details.clone(),
                std::mem::take(&mut state.on_succeeded),
                std::mem::take(&mut state.on_failed),
                std::mem::take(&mut state.on_finished),
            )
        };
        log::debug!("[operation] {} finished (succeeded: {succeeded})", self.label);
        if succeeded {
            for callback in on_succeeded {
                callback();
            }
        } else {
            for callback in on_failed {
                callback(&details);
            }
        }
        for callback in on_finished {
            callback();
        }
        let _ = self.finished_tx.send(true);
    }

    pub fn set_finished_with_error(&self, details: ErrorDetails) {
        log::debug!("[operation] {} finished with error: {details}", self.label);
        {
            let mut state = self.state.lock().unwrap();
            state.succeeded = false;
            state.details = if details.is_empty() {
                ErrorDetails::from_text("unknown error")
            } else {
                details
            };
        }
        self.set_finished();
    }

    /// Post the failure to the next event-loop turn.
    pub fn set_delayed_finished_with_error(&self, details: ErrorDetails) {
        if let Some(this) = self.strong() {
            tokio::spawn(async move { this.set_finished_with_error(details) });
        }
    }

    /// Once `prior` succeeds, start this operation; if `prior` failed, fail
    /// with the same details. Both branches run on a later event-loop turn,
    /// including when `prior` already finished at the moment of binding.
    pub fn run_after(&self, prior: &PendingOperation) {
        let this = self.weak_self.clone();
        prior.on_succeeded(move || {
            if let Some(this) = this.upgrade() {
                this.start_later();
            }
        });
        let this = self.weak_self.clone();
        prior.on_failed(move |details| {
            if let Some(this) = this.upgrade() {
                this.set_delayed_finished_with_error(details.clone());
            }
        });
    }

    /// Reset to unfinished. Used only by sub-operation machinery.
    pub fn clear_result(&self) {
        let mut state = self.state.lock().unwrap();
        state.finished = false;
        state.succeeded = true;
        state.details.clear();
        let _ = self.finished_tx.send(false);
    }

    /// Subscribe to the success branch. When the operation already finished,
    /// the callback is posted to the next event-loop turn instead of running
    /// synchronously.
    pub fn on_succeeded(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        if state.finished {
            if state.succeeded {
                tokio::spawn(async move { callback() });
            }
        } else {
            state.on_succeeded.push(Box::new(callback));
        }
    }

    /// Subscribe to the failure branch; deferral rules as
    /// [`on_succeeded`](Self::on_succeeded).
    pub fn on_failed(&self, callback: impl FnOnce(&ErrorDetails) + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        if state.finished {
            if !state.succeeded {
                let details = state.details.clone();
                tokio::spawn(async move { callback(&details) });
            }
        } else {
            state.on_failed.push(Box::new(callback));
        }
    }

    /// Subscribe to completion regardless of outcome; deferral rules as
    /// [`on_succeeded`](Self::on_succeeded).
    pub fn on_finished(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        if state.finished {
            tokio::spawn(async move { callback() });
        } else {
            state.on_finished.push(Box::new(callback));
        }
    }

    /// Wait for completion; returns whether the operation succeeded.
    pub async fn wait(&self) -> bool {
        let mut rx = self.finished_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return self.is_succeeded();
            }
            if rx.changed().await.is_err() {
                return self.is_succeeded();
            }
        }
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        write!(
            f,
            "PendingOperation({}, finished: {}, succeeded: {})",
            self.label, state.finished, state.succeeded
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn finished_fires_exactly_once() {
        let finished = Arc::new(AtomicU32::new(0));
        let op = PendingOperation::new("test");
        let counter = Arc::clone(&finished);
        op.on_finished(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        op.set_finished();
        op.set_finished();
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert!(op.is_succeeded());
    }

    #[tokio::test]
    async fn failure_precedes_finished_and_carries_details() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let op = PendingOperation::new("test");
        {
            let order = Arc::clone(&order);
            op.on_failed(move |details| {
                order
                    .lock()
                    .unwrap()
                    .push(format!("failed: {}", details.text().unwrap()));
            });
        }
        {
            let order = Arc::clone(&order);
            op.on_succeeded(move || order.lock().unwrap().push("succeeded".into()));
        }
        {
            let order = Arc::clone(&order);
            op.on_finished(move || order.lock().unwrap().push("finished".into()));
        }
        op.set_finished_with_error(ErrorDetails::from_text("boom"));
        assert_eq!(
            *order.lock().unwrap(),
            vec!["failed: boom".to_string(), "finished".to_string()]
        );
        assert!(!op.is_succeeded());
        assert!(op.is_finished());
    }

    #[tokio::test]
    async fn empty_failure_details_are_replaced() {
        let op = PendingOperation::new("test");
        op.set_finished_with_error(ErrorDetails::default());
        assert!(!op.error_details().is_empty());
    }

    #[tokio::test]
    async fn run_after_starts_on_success() {
        let prior = PendingOperation::new("prior");
        let started = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&started);
        let next = PendingOperation::with_runner("next", move |op| {
            counter.fetch_add(1, Ordering::SeqCst);
            op.set_finished();
        });
        next.run_after(&prior);
        prior.set_finished();
        assert!(next.wait().await);
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_after_propagates_failure() {
        let prior = PendingOperation::new("prior");
        let next = PendingOperation::with_runner("next", |op| op.set_finished());
        next.run_after(&prior);
        prior.set_finished_with_error(ErrorDetails::from_text("no route"));
        assert!(!next.wait().await);
        assert_eq!(next.error_details().text(), Some("no route"));
    }

    #[tokio::test]
    async fn run_after_an_already_finished_operation_is_deferred() {
        let prior = PendingOperation::new("prior");
        prior.set_finished();
        let next = PendingOperation::with_runner("next", |op| op.set_finished());
        next.run_after(&prior);
        // Nothing may happen synchronously.
        assert!(!next.is_finished());
        assert!(next.wait().await);
    }

    #[tokio::test]
    async fn delayed_failure_lands_on_a_later_turn() {
        let op = PendingOperation::failed("setup", "Account storage is missing");
        assert!(!op.is_finished());
        assert!(!op.wait().await);
        assert_eq!(op.error_details().text(), Some("Account storage is missing"));
    }

    #[tokio::test]
    async fn clear_result_resets_completion() {
        let op = PendingOperation::new("test");
        op.set_finished_with_error(ErrorDetails::from_text("transient"));
        assert!(op.is_finished());
        op.clear_result();
        assert!(!op.is_finished());
        assert!(op.error_details().is_empty());
        op.set_finished();
        assert!(op.is_succeeded());
    }

    #[tokio::test]
    async fn wait_times_out_only_if_never_finished() {
        let op = PendingOperation::new("test");
        let waited = tokio::time::timeout(Duration::from_millis(50), op.wait()).await;
        assert!(waited.is_err());
    }
}
