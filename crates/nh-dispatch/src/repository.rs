//! Notification record store contract

use async_trait::async_trait;
use nh_common::{NotificationStatus, NotifyHubError};

/// Read/update contract for the backing notification record, keyed by
/// notification id. The core writes `Queued`, `Sending`, and terminal
/// statuses; persistence itself is an external collaborator.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn transition(
        &self,
        notification_id: &str,
        status: NotificationStatus,
        error: Option<String>,
    ) -> Result<(), NotifyHubError>;
}
