//! Mailer that writes voucher emails to the log instead of sending them.

use std::future::Future;
use std::pin::Pin;
use voucher_runtime::notify::{DeliveryJob, Mailer, MailerError};

/// Logs each voucher email at `info` level.
///
/// Stands in for an SMTP or HTTP mail transport in development and in the demo.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleMailer;

impl ConsoleMailer {
    /// Subject line of the voucher email.
    #[must_use]
    pub fn subject(job: &DeliveryJob) -> String {
        format!("Your voucher {}", job.notification.code)
    }
}

impl Mailer for ConsoleMailer {
    fn deliver<'a>(
        &'a self,
        job: &'a DeliveryJob,
    ) -> Pin<Box<dyn Future<Output = Result<(), MailerError>> + Send + 'a>> {
        Box::pin(async move {
            let payload =
                serde_json::to_string(job).map_err(|e| MailerError::Delivery(e.to_string()))?;
            tracing::info!(
                to = %job.recipient,
                subject = %Self::subject(job),
                payload = %payload,
                "Voucher email"
            );
            Ok(())
        })
    }
}
