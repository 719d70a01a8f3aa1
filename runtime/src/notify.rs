//! Bounded notification queue and its delivery worker.
//!
//! [`notification_queue`] returns the two halves:
//!
//! - [`QueuedDispatcher`], the [`NotificationDispatcher`] handed to the
//!   allocator; `dispatch` only enqueues and fails fast when the queue is full
//! - [`NotificationWorker`], which drains the queue and delivers each job through
//!   a [`Mailer`], retrying failed deliveries with backoff
//!
//! ```rust,ignore
//! let (dispatcher, worker) = notification_queue(256, mailer, RetryPolicy::default());
//! let worker = tokio::spawn(worker.run());
//! let allocator = Allocator::builder(store).dispatcher(Arc::new(dispatcher)).build();
//! ```

use crate::metrics::NotificationMetrics;
use crate::retry::{RetryPolicy, retry_with_backoff};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use voucher_core::notify::{DispatchError, Notification, NotificationDispatcher, Recipient};

/// A notification waiting for delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    /// Where to send it
    pub recipient: Recipient,
    /// What to send
    pub notification: Notification,
}

/// Errors from a [`Mailer`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailerError {
    /// Delivery failed and may succeed later.
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Transport that actually delivers a voucher code (SMTP, HTTP API, console...).
pub trait Mailer: Send + Sync {
    /// Deliver `job`.
    ///
    /// # Errors
    ///
    /// Returns [`MailerError`] if the message was not delivered.
    fn deliver<'a>(
        &'a self,
        job: &'a DeliveryJob,
    ) -> Pin<Box<dyn Future<Output = Result<(), MailerError>> + Send + 'a>>;
}

/// Create a queue holding at most `capacity` undelivered notifications.
#[must_use]
pub fn notification_queue(
    capacity: usize,
    mailer: Arc<dyn Mailer>,
    retry: RetryPolicy,
) -> (QueuedDispatcher, NotificationWorker) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        QueuedDispatcher { tx },
        NotificationWorker { rx, mailer, retry },
    )
}

/// Enqueuing half of the notification queue.
#[derive(Clone, Debug)]
pub struct QueuedDispatcher {
    tx: mpsc::Sender<DeliveryJob>,
}

impl NotificationDispatcher for QueuedDispatcher {
    fn dispatch(
        &self,
        recipient: Recipient,
        notification: Notification,
    ) -> Pin<Box<dyn Future<Output = Result<(), DispatchError>> + Send + '_>> {
        let result = self
            .tx
            .try_send(DeliveryJob {
                recipient,
                notification,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
            });
        Box::pin(async move { result })
    }
}

/// Counts reported by a finished [`NotificationWorker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Jobs delivered
    pub delivered: u64,
    /// Jobs dropped after exhausting retries
    pub failed: u64,
}

/// Draining half of the notification queue.
pub struct NotificationWorker {
    rx: mpsc::Receiver<DeliveryJob>,
    mailer: Arc<dyn Mailer>,
    retry: RetryPolicy,
}

impl NotificationWorker {
    /// Deliver jobs until every [`QueuedDispatcher`] has been dropped and the
    /// queue is empty.
    pub async fn run(self) -> DeliveryStats {
        self.run_until(std::future::pending()).await
    }

    /// Deliver jobs until the queue closes or `shutdown` completes.
    ///
    /// Jobs still queued at shutdown are not delivered.
    pub async fn run_until<S>(mut self, shutdown: S) -> DeliveryStats
    where
        S: Future<Output = ()> + Send,
    {
        let mut stats = DeliveryStats::default();
        tracing::info!("Notification worker started");
        tokio::pin!(shutdown);

        loop {
            let job = tokio::select! {
                () = &mut shutdown => {
                    tracing::info!("Notification worker shutting down");
                    break;
                }
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            match retry_with_backoff(&self.retry, || self.mailer.deliver(&job)).await {
                Ok(()) => {
                    stats.delivered += 1;
                    NotificationMetrics::record_delivered();
                    tracing::debug!(
                        recipient = %job.recipient,
                        code = %job.notification.code,
                        "Notification delivered"
                    );
                }
                Err(e) => {
                    stats.failed += 1;
                    NotificationMetrics::record_failure("deliver");
                    tracing::error!(
                        recipient = %job.recipient,
                        voucher_id = %job.notification.voucher_id,
                        error = %e,
                        "Notification dropped"
                    );
                }
            }
        }

        tracing::info!(
            delivered = stats.delivered,
            failed = stats.failed,
            "Notification worker stopped"
        );
        stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use voucher_core::{EventId, VoucherCode, VoucherId};

    #[derive(Default)]
    struct FlakyMailer {
        failures_left: AtomicU32,
        delivered: Mutex<Vec<DeliveryJob>>,
    }

    impl Mailer for FlakyMailer {
        fn deliver<'a>(
            &'a self,
            job: &'a DeliveryJob,
        ) -> Pin<Box<dyn Future<Output = Result<(), MailerError>> + Send + 'a>> {
            Box::pin(async move {
                let left = self.failures_left.load(Ordering::SeqCst);
                if left > 0 {
                    self.failures_left.store(left - 1, Ordering::SeqCst);
                    return Err(MailerError::Delivery("smtp timeout".into()));
                }
                self.delivered.lock().unwrap().push(job.clone());
                Ok(())
            })
        }
    }

    fn notification(code: &str) -> Notification {
        Notification {
            voucher_id: VoucherId::new(),
            event_id: EventId::new(),
            code: VoucherCode::new(code),
        }
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let mailer = Arc::new(FlakyMailer::default());
        let (dispatcher, _worker) = notification_queue(1, mailer, RetryPolicy::immediate(1));

        dispatcher
            .dispatch(Recipient::new("a@x"), notification("VC-1"))
            .await
            .unwrap();
        let second = dispatcher
            .dispatch(Recipient::new("b@x"), notification("VC-2"))
            .await;

        assert_eq!(second, Err(DispatchError::QueueFull));
    }

    #[tokio::test]
    async fn closed_queue_is_reported() {
        let mailer = Arc::new(FlakyMailer::default());
        let (dispatcher, worker) = notification_queue(4, mailer, RetryPolicy::immediate(1));
        drop(worker);

        let result = dispatcher
            .dispatch(Recipient::new("a@x"), notification("VC-1"))
            .await;

        assert_eq!(result, Err(DispatchError::Closed));
    }

    #[tokio::test]
    async fn worker_delivers_and_stops_when_senders_drop() {
        let mailer = Arc::new(FlakyMailer::default());
        let (dispatcher, worker) =
            notification_queue(8, mailer.clone(), RetryPolicy::immediate(1));

        for code in ["VC-1", "VC-2", "VC-3"] {
            dispatcher
                .dispatch(Recipient::new("a@x"), notification(code))
                .await
                .unwrap();
        }
        drop(dispatcher);

        let stats = worker.run().await;

        assert_eq!(stats, DeliveryStats { delivered: 3, failed: 0 });
        let codes: Vec<_> = mailer
            .delivered
            .lock()
            .unwrap()
            .iter()
            .map(|job| job.notification.code.to_string())
            .collect();
        assert_eq!(codes, ["VC-1", "VC-2", "VC-3"]);
    }

    #[tokio::test]
    async fn delivery_is_retried_then_dropped() {
        let mailer = Arc::new(FlakyMailer {
            failures_left: AtomicU32::new(4),
            ..FlakyMailer::default()
        });
        let (dispatcher, worker) =
            notification_queue(8, mailer.clone(), RetryPolicy::immediate(3));

        dispatcher
            .dispatch(Recipient::new("a@x"), notification("VC-1"))
            .await
            .unwrap();
        dispatcher
            .dispatch(Recipient::new("b@x"), notification("VC-2"))
            .await
            .unwrap();
        drop(dispatcher);

        let stats = worker.run().await;

        // First job burns three failures, second burns the last one then succeeds
        assert_eq!(stats, DeliveryStats { delivered: 1, failed: 1 });
        assert_eq!(mailer.delivered.lock().unwrap()[0].recipient, Recipient::new("b@x"));
    }

    #[tokio::test]
    async fn shutdown_stops_worker() {
        let mailer = Arc::new(FlakyMailer::default());
        let (dispatcher, worker) = notification_queue(8, mailer, RetryPolicy::immediate(1));

        let stats = worker.run_until(async {}).await;

        assert_eq!(stats, DeliveryStats::default());
        drop(dispatcher);
    }
}
