use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

/// Online/offline signal shared between the host application and the sync core.
///
/// Cloning yields another handle to the same signal.
#[derive(Debug, Clone)]
pub struct Connectivity {
	sender: Arc<watch::Sender<bool>>,
}

impl Connectivity {
	pub fn new(online: bool) -> Self {
		let (sender, _) = watch::channel(online);
		Self {
			sender: Arc::new(sender),
		}
	}

	pub fn is_online(&self) -> bool {
		*self.sender.borrow()
	}

	/// Report a connectivity transition. Repeating the current state is a no-op.
	pub fn set_online(&self, online: bool) {
		let previous = self.sender.send_replace(online);
		if previous != online {
			info!(
				"Connectivity changed: {}",
				if online { "online" } else { "offline" }
			);
		}
	}

	pub fn subscribe(&self) -> watch::Receiver<bool> {
		self.sender.subscribe()
	}
}

impl Default for Connectivity {
	fn default() -> Self {
		Self::new(true)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn test_transition_notifies_subscribers() {
		let connectivity = Connectivity::new(false);
		let mut rx = connectivity.subscribe();

		connectivity.set_online(true);
		rx.changed().await.unwrap();
		assert!(*rx.borrow_and_update());
		assert!(connectivity.is_online());
	}
}
