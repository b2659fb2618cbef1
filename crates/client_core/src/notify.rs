use shared::domain::ChannelId;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub channel_id: ChannelId,
    pub title: String,
    pub body: String,
}

/// Outlet for desktop notifications. Delivery belongs to the host process;
/// the engine only decides when one is due.
pub trait Notifier: Send + Sync {
    fn notify(&self, request: NotificationRequest);
}

pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, request: NotificationRequest) {
        info!(
            channel_id = request.channel_id.0,
            title = %request.title,
            "notify: {}",
            request.body
        );
    }
}
