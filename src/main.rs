use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use offline_sync::adapters::{
	Connectivity, FileDurableStore, MemoryDurableStore, MemoryRemoteStore, RemoteStore,
	user_collection,
};
use offline_sync::pipeline::ChaChaCryptoService;
use offline_sync::{
	DeviceContext, EntityKind, OperationRequest, QueueConfig, QueueEvent, SyncDependencies,
	SyncService,
};
use serde_json::json;
use tracing::{info, warn};

/// Two devices of one account sharing an in-memory remote store: the phone
/// edits while offline, the laptop edits the same subscription, and both
/// converge once the phone reconnects.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive("offline_sync=debug".parse()?)
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	let data_dir = std::env::var("OFFLINE_SYNC_DATA_DIR")
		.map(PathBuf::from)
		.unwrap_or_else(|_| std::env::temp_dir().join("offline-sync-demo"));
	let passphrase =
		std::env::var("OFFLINE_SYNC_PASSPHRASE").unwrap_or_else(|_| "demo passphrase".to_string());
	info!("Persisting phone queue under {}", data_dir.display());

	let remote = Arc::new(MemoryRemoteStore::new());
	let crypto = Arc::new(ChaChaCryptoService::from_passphrase(&passphrase));
	let config = QueueConfig {
		idle_poll_interval: Duration::from_millis(200),
		..QueueConfig::default()
	};

	let phone_online = Connectivity::new(false);
	let phone = SyncService::init(
		config.clone(),
		DeviceContext::new("demo-user", "phone").with_name("Phone"),
		SyncDependencies::new(remote.clone(), Arc::new(FileDurableStore::new(data_dir)))
			.with_crypto(crypto.clone())
			.with_connectivity(phone_online.clone()),
	)
	.await?;
	let laptop = SyncService::init(
		config,
		DeviceContext::new("demo-user", "laptop").with_name("Laptop"),
		SyncDependencies::new(remote.clone(), Arc::new(MemoryDurableStore::new()))
			.with_crypto(crypto),
	)
	.await?;

	let mut laptop_events = laptop.subscribe_events();
	phone.start().await?;
	laptop.start().await?;

	let category = phone
		.enqueue(OperationRequest::create(
			EntityKind::Category,
			"streaming",
			json!({"name": "Streaming"}),
		))
		.await?;
	phone
		.enqueue(
			OperationRequest::create(
				EntityKind::Subscription,
				"news",
				json!({"name": "Daily News", "price": 4, "category": "streaming"}),
			)
			.depends_on(category),
		)
		.await?;
	phone
		.enqueue(OperationRequest::settings(json!({"currency": "EUR", "theme": "dark"})))
		.await?;
	info!("Phone queued {} operations while offline", phone.list_pending().await.len());

	tokio::time::sleep(Duration::from_millis(50)).await;
	laptop
		.enqueue(OperationRequest::update(
			EntityKind::Subscription,
			"news",
			json!({"price": 5}),
		))
		.await?;

	let laptop_done = tokio::time::timeout(Duration::from_secs(5), async {
		while let Ok(event) = laptop_events.recv().await {
			if let QueueEvent::Completed { .. } = event {
				break;
			}
		}
	})
	.await;
	if laptop_done.is_err() {
		warn!("Laptop did not finish its update in time");
	}

	phone_online.set_online(true);
	for _ in 0..50 {
		if phone.list_pending().await.is_empty() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	tokio::time::sleep(Duration::from_millis(300)).await;

	for conflict in phone.conflicts().await.iter().chain(laptop.conflicts().await.iter()) {
		info!(
			"Conflict on {}/{} resolved as {}",
			conflict.entity_type,
			conflict.entity_id,
			conflict
				.resolution
				.as_ref()
				.map_or_else(|| "unresolved".to_string(), ToString::to_string)
		);
	}

	let news = remote
		.read(&user_collection("demo-user", "subscriptions"), "news")
		.await?;
	info!("Remote copy of news: {}", news.unwrap_or_default());

	for device in phone.devices().list_devices().await? {
		info!("Device {} ({}) last seen {}", device.name, device.platform, device.last_seen);
	}

	info!("Phone: {}", phone.status().await.summary());
	info!("Laptop: {}", laptop.status().await.summary());

	phone.shutdown().await;
	laptop.shutdown().await;
	Ok(())
}
