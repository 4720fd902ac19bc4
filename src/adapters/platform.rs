use tracing::debug;

use crate::queue::QueueStatus;

/// Native capabilities of the host platform (badges, local notifications).
///
/// Picked once when the service is built; environments without native
/// integration get `NoopBridge`.
pub trait PlatformBridge: Send + Sync {
	fn name(&self) -> &'static str;

	/// Push the latest queue status to native UI (badge counts, widgets).
	fn publish_status(&self, status: &QueueStatus);

	/// Show a local notification.
	fn notify(&self, title: &str, body: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBridge;

impl PlatformBridge for NoopBridge {
	fn name(&self) -> &'static str {
		"noop"
	}

	fn publish_status(&self, status: &QueueStatus) {
		debug!("No platform bridge; dropping status ({} pending)", status.pending);
	}

	fn notify(&self, title: &str, _body: &str) {
		debug!("No platform bridge; dropping notification {:?}", title);
	}
}
