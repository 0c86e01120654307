//! Reference-counted, bounded cache.
//!
//! A resident entry stays exactly as long as someone holds a handle to it.
//! When the last handle goes away the entry is handed back to its source
//! (write-back) and its slot freed. Admission is strictly bounded: a miss on
//! a full cache fails with `CacheFull` instead of evicting.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{KeelError, KeelResult};

/// Where cached values come from and go back to.
pub trait CacheSource: Send + Sync {
	type Key: Copy + Eq + Hash + Debug + Send;
	type Value: Send + Sync;

	/// Load the value for `key` on a miss.
	fn load(&self, key: Self::Key) -> KeelResult<Self::Value>;

	/// Called once the last reference is released (or at close).
	fn evict(&self, key: Self::Key, value: &Self::Value);
}

struct Resident<V> {
	value: Arc<V>,
	refs: usize,
}

struct CacheState<K, V> {
	resident: HashMap<K, Resident<V>>,
	/// Keys with a load in flight; waiters park on the key's condvar.
	loading: HashMap<K, Arc<Condvar>>,
	/// Resident entries plus in-flight loads.
	count: usize,
}

/// Bounded reference-counted cache over a [`CacheSource`]
pub struct RefCache<S: CacheSource> {
	source: S,
	state: Mutex<CacheState<S::Key, S::Value>>,
	capacity: usize,
}

/// A counted reference to a resident value; released on drop.
pub struct CacheHandle<'a, S: CacheSource> {
	cache: &'a RefCache<S>,
	key: S::Key,
	value: Arc<S::Value>,
}

impl<S: CacheSource> RefCache<S> {
	/// Create a cache holding at most `capacity` entries
	pub fn new(source: S, capacity: usize) -> Self {
		Self {
			source,
			state: Mutex::new(CacheState {
				resident: HashMap::new(),
				loading: HashMap::new(),
				count: 0,
			}),
			capacity,
		}
	}

	/// Fetch `key`, loading it from the source on a miss.
	pub fn get(&self, key: S::Key) -> KeelResult<CacheHandle<'_, S>> {
		let mut state = self.state.lock();
		loop {
			if let Some(signal) = state.loading.get(&key).cloned() {
				// Someone else is loading this key; wait for them
				signal.wait(&mut state);
				continue;
			}

			if let Some(entry) = state.resident.get_mut(&key) {
				entry.refs += 1;
				let value = Arc::clone(&entry.value);
				return Ok(CacheHandle {
					cache: self,
					key,
					value,
				});
			}

			if state.count >= self.capacity {
				tracing::debug!("Cache full ({} entries), refusing {:?}", self.capacity, key);
				return Err(KeelError::CacheFull);
			}

			state.count += 1;
			let signal = Arc::new(Condvar::new());
			state.loading.insert(key, Arc::clone(&signal));
			drop(state);

			let loaded = self.source.load(key);

			let mut state = self.state.lock();
			state.loading.remove(&key);
			let result = match loaded {
				Ok(value) => {
					let value = Arc::new(value);
					state.resident.insert(
						key,
						Resident {
							value: Arc::clone(&value),
							refs: 1,
						},
					);
					Ok(CacheHandle {
						cache: self,
						key,
						value,
					})
				}
				Err(e) => {
					state.count -= 1;
					Err(e)
				}
			};
			signal.notify_all();
			return result;
		}
	}

	/// Drop one reference to `key`; the last one evicts it.
	fn release(&self, key: S::Key) {
		let mut state = self.state.lock();
		let Some(entry) = state.resident.get_mut(&key) else {
			tracing::warn!("Release of non-resident cache key {:?}", key);
			return;
		};

		if entry.refs == 0 {
			tracing::warn!("Release of unreferenced cache key {:?}", key);
			return;
		}

		entry.refs -= 1;
		if entry.refs == 0 {
			if let Some(entry) = state.resident.remove(&key) {
				// Write back under the lock so a reload never reads stale bytes
				self.source.evict(key, &entry.value);
				state.count -= 1;
			}
		}
	}

	/// Evict every resident entry regardless of its reference count.
	pub fn close(&self) {
		let mut state = self.state.lock();
		let resident: Vec<_> = state.resident.drain().collect();
		for (key, entry) in resident {
			if entry.refs > 0 {
				tracing::debug!("Closing cache with {} live references to {:?}", entry.refs, key);
			}
			self.source.evict(key, &entry.value);
			state.count -= 1;
		}
	}

	/// Current reference count of `key` (0 when not resident).
	pub fn ref_count(&self, key: S::Key) -> usize {
		self.state
			.lock()
			.resident
			.get(&key)
			.map_or(0, |entry| entry.refs)
	}

	/// Number of resident entries
	pub fn resident(&self) -> usize {
		self.state.lock().resident.len()
	}

	/// Maximum number of entries
	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// The backing source
	pub fn source(&self) -> &S {
		&self.source
	}
}

impl<S: CacheSource> CacheHandle<'_, S> {
	/// Key this handle refers to
	pub fn key(&self) -> S::Key {
		self.key
	}
}

impl<S: CacheSource> Deref for CacheHandle<'_, S> {
	type Target = S::Value;

	fn deref(&self) -> &Self::Target {
		&self.value
	}
}

impl<S: CacheSource> Clone for CacheHandle<'_, S> {
	fn clone(&self) -> Self {
		let mut state = self.cache.state.lock();
		if let Some(entry) = state.resident.get_mut(&self.key) {
			entry.refs += 1;
		}
		Self {
			cache: self.cache,
			key: self.key,
			value: Arc::clone(&self.value),
		}
	}
}

impl<S: CacheSource> Drop for CacheHandle<'_, S> {
	fn drop(&mut self) {
		self.cache.release(self.key);
	}
}
