//! Recipient directory for deployments where requester ids already are
//! deliverable addresses.

use std::future::Future;
use std::pin::Pin;
use voucher_core::RequesterId;
use voucher_core::notify::{DirectoryError, Recipient, RecipientDirectory};

/// Treats the requester id itself as the address.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityDirectory;

impl RecipientDirectory for IdentityDirectory {
    fn resolve<'a>(
        &'a self,
        requester: &'a RequesterId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Recipient>, DirectoryError>> + Send + 'a>> {
        Box::pin(async move { Ok(Some(Recipient::new(requester.as_str()))) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_requester_through() {
        let requester = RequesterId::new("ada@example.com").unwrap();
        let resolved = IdentityDirectory.resolve(&requester).await.unwrap();
        assert_eq!(resolved, Some(Recipient::new("ada@example.com")));
    }
}
