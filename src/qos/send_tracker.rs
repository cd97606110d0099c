use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tokio::time;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::protocol::envelope::Envelope;
use crate::qos::{QosConfig, QosEventListener, RetryAttemptObserver, RetrySender};

/// The two tracking maps. They live behind one lock and are only ever mutated together, so an
///  entry always has both its envelope and its last-send timestamp or neither.
#[derive(Default)]
struct TrackedMessages {
    envelopes: FxHashMap<String, Envelope>,
    last_sent: FxHashMap<String, Instant>,
}

/// Clears the sweep-in-progress flag when dropped.
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Keyed table of in-flight QoS messages, swept at a fixed rate: an entry is retried while its
///  retry budget lasts (respecting the grace window), and reported lost in a single batch per
///  sweep once the budget is exhausted. An ack removes the entry and confirms delivery. Either
///  way the fingerprint leaves the table exactly once - never both outcomes, never neither.
///
/// `put`/`remove`/`exist` are safe to call concurrently from arbitrary tasks; the sweep runs on
///  its own timer task. Callers never hold an external lock.
pub struct SendTracker {
    config: QosConfig,
    sender: Arc<dyn RetrySender>,
    listener: RwLock<Option<Arc<dyn QosEventListener>>>,
    attempt_observer: RwLock<Option<Arc<dyn RetryAttemptObserver>>>,
    tracked: Mutex<TrackedMessages>,
    sweeping: AtomicBool,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SendTracker {
    pub fn new(config: QosConfig, sender: Arc<dyn RetrySender>) -> anyhow::Result<SendTracker> {
        config.validate()?;

        Ok(SendTracker {
            config,
            sender,
            listener: RwLock::new(None),
            attempt_observer: RwLock::new(None),
            tracked: Mutex::new(TrackedMessages::default()),
            sweeping: AtomicBool::new(false),
            timer: Mutex::new(None),
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn QosEventListener>) {
        *self.listener.write().expect("listener lock poisoned") = Some(listener);
    }

    pub fn set_attempt_observer(&self, observer: Arc<dyn RetryAttemptObserver>) {
        *self.attempt_observer.write().expect("observer lock poisoned") = Some(observer);
    }

    /// Start tracking a message. Messages without a fingerprint or without the QoS flag are not
    ///  trackable and are ignored (with a log line) rather than rejected. A fingerprint that is
    ///  already tracked is overwritten - last write wins.
    pub fn put(&self, envelope: Envelope) {
        let fingerprint = match &envelope.fingerprint {
            Some(fingerprint) => fingerprint.clone(),
            None => {
                warn!("[{}] ignoring message without fingerprint", self.config.tag);
                return;
            }
        };
        if !envelope.qos {
            warn!("[{}] ignoring non-QoS message {}", self.config.tag, fingerprint);
            return;
        }

        let mut tracked = self.lock_tracked();
        if tracked.envelopes.contains_key(&fingerprint) {
            warn!("[{}] message {} is already tracked - overwriting. Duplicate fingerprint, or a duplicate put?", self.config.tag, fingerprint);
        }
        tracked.envelopes.insert(fingerprint.clone(), envelope);
        tracked.last_sent.insert(fingerprint, Instant::now());
    }

    /// Stop tracking a fingerprint, returning its envelope if it was tracked. Idempotent -
    ///  removing an absent fingerprint is a harmless no-op. Called by the ack path and by the
    ///  sweep on terminal loss.
    pub fn remove(&self, fingerprint: &str) -> Option<Envelope> {
        let mut tracked = self.lock_tracked();
        tracked.last_sent.remove(fingerprint);
        let removed = tracked.envelopes.remove(fingerprint);

        if self.config.debug {
            match &removed {
                Some(envelope) => debug!("[{}] removed {} from the tracking table, retry count was {}", self.config.tag, fingerprint, envelope.retry_count),
                None => debug!("[{}] removal of {} was a no-op: not tracked", self.config.tag, fingerprint),
            }
        }
        removed
    }

    pub fn exist(&self, fingerprint: &str) -> bool {
        self.lock_tracked().envelopes.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.lock_tracked().envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The delivery-confirmed path: a "message received" ack arrived for this fingerprint. If it
    ///  is still tracked, it is removed and the listener's delivery confirmation is invoked;
    ///  a late or duplicate ack is a no-op.
    pub fn on_ack(&self, fingerprint: &str) {
        if self.remove(fingerprint).is_none() {
            debug!("[{}] ack for {} arrived after the fingerprint was resolved - ignoring", self.config.tag, fingerprint);
            return;
        }

        if let Some(listener) = self.current_listener() {
            listener.message_received(fingerprint);
        }
    }

    /// One sweep over the tracking table. Guarded so at most one sweep executes at a time: an
    ///  invocation that arrives while one is running is skipped entirely, not queued.
    ///
    /// Classification happens under the table lock; resends, per-attempt callbacks and the
    ///  batched loss notification all run after it is released, so observer code never executes
    ///  while iteration state is held.
    pub async fn sweep_once(&self) {
        if self.sweeping.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            debug!("[{}] a sweep is already running - skipping this one", self.config.tag);
            return;
        }
        // reset on all exit paths, including an unwinding listener/observer callback - a single
        //  bad callback must not disable all future sweeps
        let _guard = SweepGuard(&self.sweeping);

        let (lost, to_resend) = self.classify_tracked();

        for envelope in &to_resend {
            let success = self.sender.resend(envelope).await;

            if self.config.debug {
                if success {
                    debug!("[{}] resent {:?}, retry count is now {} (of max {})",
                        self.config.tag, envelope.fingerprint, envelope.retry_count, self.config.max_retries);
                }
                else {
                    warn!("[{}] resend of {:?} failed, retry count is now {} (of max {})",
                        self.config.tag, envelope.fingerprint, envelope.retry_count, self.config.max_retries);
                }
            }

            let observer = self.attempt_observer.read().expect("observer lock poisoned").clone();
            if let Some(observer) = observer {
                observer.on_attempt(success, envelope);
            }
        }

        if !lost.is_empty() {
            if let Some(listener) = self.current_listener() {
                listener.messages_lost(lost);
            }
        }
    }

    /// Walk all tracked entries, deciding per entry: prune (not QoS after all), declare lost
    ///  (budget exhausted), skip (inside the grace window), or retry. Iteration order across
    ///  fingerprints is unspecified.
    ///
    /// The retry counter is incremented here, before the send happens and regardless of its
    ///  outcome - it counts attempts made, not confirmed deliveries. A failed resend is caught
    ///  by a later sweep or eventually by the loss path.
    fn classify_tracked(&self) -> (Vec<Envelope>, Vec<Envelope>) {
        let now = Instant::now();
        let mut lost = Vec::new();
        let mut to_resend = Vec::new();
        let mut to_remove = Vec::new();

        let mut tracked = self.lock_tracked();
        if self.config.debug && !tracked.envelopes.is_empty() {
            debug!("[{}] sweeping the delivery tracking table, {} entries", self.config.tag, tracked.envelopes.len());
        }

        let TrackedMessages { envelopes, last_sent } = &mut *tracked;
        for (fingerprint, envelope) in envelopes.iter_mut() {
            if !envelope.qos {
                to_remove.push(fingerprint.clone());
                continue;
            }

            if envelope.retry_count >= self.config.max_retries {
                if self.config.debug {
                    debug!("[{}] {} exhausted its retry budget of {} - declaring it lost", self.config.tag, fingerprint, self.config.max_retries);
                }
                lost.push(envelope.clone());
                to_remove.push(fingerprint.clone());
                continue;
            }

            let elapsed = match last_sent.get(fingerprint) {
                Some(&sent_at) => now.saturating_duration_since(sent_at),
                None => {
                    warn!("[{}] {} has no send timestamp - dropping the entry", self.config.tag, fingerprint);
                    to_remove.push(fingerprint.clone());
                    continue;
                }
            };

            if elapsed <= self.config.grace_window {
                if self.config.debug {
                    debug!("[{}] {} was sent just now ({:?} ago) - not retrying this cycle", self.config.tag, fingerprint, elapsed);
                }
                continue;
            }

            envelope.increase_retry_count();
            to_resend.push(envelope.clone());
        }

        for fingerprint in to_remove {
            envelopes.remove(&fingerprint);
            last_sent.remove(&fingerprint);
        }

        (lost, to_resend)
    }

    /// Install the fixed-rate sweep timer. Always cancels and replaces any previous schedule;
    ///  `immediately` fires the first sweep with zero initial delay, otherwise it waits one full
    ///  interval first.
    pub fn start(self: &Arc<Self>, immediately: bool) {
        let mut timer = self.timer.lock().expect("timer lock poisoned");
        if let Some(previous) = timer.take() {
            previous.abort();
        }

        let tracker = self.clone();
        *timer = Some(tokio::spawn(async move {
            let mut ticker = time::interval(tracker.config.sweep_interval);
            if !immediately {
                // an interval's first tick completes right away - consume it so the first
                //  sweep waits one full interval
                ticker.tick().await;
            }
            loop {
                ticker.tick().await;
                tracker.sweep_once().await;
            }
        }));

        debug!("[{}] delivery assurance sweep started", self.config.tag);
    }

    /// Cancel the sweep timer. Idempotent. Stopping does not resolve in-flight fingerprints as
    ///  delivered or lost - it just stops processing them.
    pub fn stop(&self) {
        if let Some(timer) = self.timer.lock().expect("timer lock poisoned").take() {
            timer.abort();
            debug!("[{}] delivery assurance sweep stopped", self.config.tag);
        }
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().expect("timer lock poisoned").is_some()
    }

    fn current_listener(&self) -> Option<Arc<dyn QosEventListener>> {
        self.listener.read().expect("listener lock poisoned").clone()
    }

    fn lock_tracked(&self) -> std::sync::MutexGuard<'_, TrackedMessages> {
        self.tracked.lock().expect("tracking table lock poisoned")
    }

    #[cfg(test)]
    fn tracked_snapshot(&self, fingerprint: &str) -> Option<Envelope> {
        self.lock_tracked().envelopes.get(fingerprint).cloned()
    }

    #[cfg(test)]
    fn put_raw(&self, fingerprint: &str, envelope: Envelope) {
        let mut tracked = self.lock_tracked();
        tracked.envelopes.insert(fingerprint.to_string(), envelope);
        tracked.last_sent.insert(fingerprint.to_string(), Instant::now());
    }
}

impl Drop for SendTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
