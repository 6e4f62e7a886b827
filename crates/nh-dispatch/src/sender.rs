//! Channel sender contract

use async_trait::async_trait;
use nh_common::{DeliveryError, Notification, NotificationChannel};

/// One delivery transport for one channel. Concrete provider integrations
/// (SMTP/SendGrid, SMS gateways, push services, webhook POSTs) live outside
/// the core; the worker pool only needs this single capability.
///
/// Implementations classify failures via [`DeliveryError`]: transient and
/// timeout failures are retried, validation failures are terminal.
#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn channel(&self) -> NotificationChannel;

    async fn send(&self, notification: &Notification) -> Result<(), DeliveryError>;
}
