use std::fmt::Debug;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, SubsecRound, Utc};

/// Source of wall-clock time.
pub trait Clock: Send + Sync + Debug {
	fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
	/// Microsecond precision, matching what sync events carry.
	fn now(&self) -> DateTime<Utc> {
		Utc::now().trunc_subsecs(6)
	}
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
	micros: AtomicI64,
}

impl ManualClock {
	pub fn new(start: DateTime<Utc>) -> Self {
		Self {
			micros: AtomicI64::new(start.timestamp_micros()),
		}
	}

	pub fn set(&self, at: DateTime<Utc>) {
		self.micros.store(at.timestamp_micros(), Ordering::SeqCst);
	}

	pub fn advance(&self, by: chrono::Duration) {
		let delta = by.num_microseconds().unwrap_or(i64::MAX);
		self.micros.fetch_add(delta, Ordering::SeqCst);
	}
}

impl Default for ManualClock {
	fn default() -> Self {
		Self::new(Utc::now())
	}
}

impl Clock for ManualClock {
	fn now(&self) -> DateTime<Utc> {
		DateTime::from_timestamp_micros(self.micros.load(Ordering::SeqCst))
			.unwrap_or(DateTime::<Utc>::MAX_UTC)
	}
}
