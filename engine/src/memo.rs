// =================================================================================================
// CONFIGURATION-KEYED MEMO
// =================================================================================================

/// Holds one value derived from a configuration key. A different key drops the old value
/// before the new one is built, so owned resources are released on rebuild.
#[derive(Debug)]
pub struct Memo<K, V> {
	entry: Option<(K, V)>,
	generation: u64,
}

impl<K, V> Default for Memo<K, V> {
	fn default() -> Self {
		Self { entry: None, generation: 0 }
	}
}

impl<K: PartialEq, V> Memo<K, V> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn get_or_try_init<E>(
		&mut self,
		key: K,
		build: impl FnOnce() -> Result<V, E>,
	) -> Result<&mut V, E> {
		if let Some((current, _)) = &self.entry {
			if *current != key {
				self.entry = None;
			}
		}

		let entry = match self.entry.take() {
			Some(entry) => entry,
			None => {
				let value = build()?;
				self.generation += 1;
				(key, value)
			}
		};
		Ok(&mut self.entry.insert(entry).1)
	}

	/// The memoized value, if it was built for `key`.
	pub fn get(&self, key: &K) -> Option<&V> {
		match &self.entry {
			Some((current, value)) if current == key => Some(value),
			_ => None,
		}
	}

	pub fn current(&self) -> Option<&V> {
		self.entry.as_ref().map(|(_, value)| value)
	}

	pub fn invalidate(&mut self) -> Option<V> {
		self.entry.take().map(|(_, value)| value)
	}

	/// How many times a value has been built.
	pub fn generation(&self) -> u64 {
		self.generation
	}
}
