//! Detached side-effect queue.
//!
//! Request handlers enqueue audit entries and notifications through a
//! [`SideEffects`] handle and return immediately; a single
//! [`SideEffectWorker`] task drains the queue in order. Enqueueing never
//! waits: when the queue is full or the worker is gone the effect is dropped
//! with a warning.

use crate::audit::{AuditEntry, AuditLogger};
use crate::notify::{Notification, Notifier};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Work performed after the triggering request has been answered.
#[derive(Debug, Clone)]
pub enum SideEffect {
    /// Append to the audit trail.
    Audit(AuditEntry),
    /// Render and deliver a notification.
    Notify(Notification),
}

impl SideEffect {
    const fn label(&self) -> &'static str {
        match self {
            Self::Audit(_) => "audit",
            Self::Notify(_) => "notify",
        }
    }
}

/// Cloneable handle for enqueueing side effects.
#[derive(Debug, Clone)]
pub struct SideEffects {
    sender: mpsc::Sender<SideEffect>,
}

impl SideEffects {
    /// Creates a handle and the receiving end for a worker.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SideEffect>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    /// Enqueues an audit entry.
    pub fn audit(&self, entry: AuditEntry) -> bool {
        self.submit(SideEffect::Audit(entry))
    }

    /// Enqueues a notification.
    pub fn notify(&self, notification: Notification) -> bool {
        self.submit(SideEffect::Notify(notification))
    }

    /// Enqueues `effect` without waiting. Returns whether it was accepted.
    pub fn submit(&self, effect: SideEffect) -> bool {
        let label = effect.label();
        match self.sender.try_send(effect) {
            Ok(()) => {
                metrics::counter!("side_effects_enqueued_total", "kind" => label).increment(1);
                true
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("side_effects_dropped_total", "reason" => "full").increment(1);
                tracing::warn!(kind = label, "Side-effect queue full, dropping");
                false
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                metrics::counter!("side_effects_dropped_total", "reason" => "closed").increment(1);
                tracing::warn!(kind = label, "Side-effect worker stopped, dropping");
                false
            },
        }
    }
}

/// Drains the side-effect queue.
#[derive(Debug)]
pub struct SideEffectWorker {
    receiver: mpsc::Receiver<SideEffect>,
    audit: AuditLogger,
    notifier: Option<Notifier>,
}

impl SideEffectWorker {
    /// Creates a worker.
    #[must_use]
    pub const fn new(
        receiver: mpsc::Receiver<SideEffect>,
        audit: AuditLogger,
        notifier: Option<Notifier>,
    ) -> Self {
        Self {
            receiver,
            audit,
            notifier,
        }
    }

    /// Creates a queue and spawns its worker.
    #[must_use]
    pub fn start(
        audit: AuditLogger,
        notifier: Option<Notifier>,
        capacity: usize,
    ) -> (SideEffects, JoinHandle<u64>) {
        let (handle, receiver) = SideEffects::channel(capacity);
        let worker = Self::new(receiver, audit, notifier);
        (handle, tokio::spawn(worker.run()))
    }

    /// Processes effects until every [`SideEffects`] handle is dropped.
    ///
    /// Returns the number of effects processed.
    pub async fn run(mut self) -> u64 {
        let mut processed = 0_u64;
        while let Some(effect) = self.receiver.recv().await {
            self.handle(effect).await;
            processed += 1;
        }
        tracing::debug!(processed, "Side-effect queue closed, worker stopping");
        processed
    }

    async fn handle(&self, effect: SideEffect) {
        match effect {
            SideEffect::Audit(entry) => self.audit.create_audit_log(&entry).await,
            SideEffect::Notify(notification) => match &self.notifier {
                Some(notifier) => {
                    notifier.dispatch(&notification).await;
                },
                None => {
                    tracing::debug!(kind = %notification.kind, "No notifier configured, skipping");
                },
            },
        }
    }
}
