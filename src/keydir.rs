use bytes::Bytes;
use crossbeam_skiplist::SkipMap;

/// On-disk location of the most recent live value for a key.
/// `value_offset` points just past the record header and key bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDirEntry {
  pub file_id: u64,
  pub value_offset: u64,
  pub value_size: u64,
  pub timestamp: u64,
}

/// The in-memory key→location index. Lookups are lock-free and never
/// block the writers.
///
/// Mutations are serialized externally: the flusher writes under the
/// shared side of the engine io-lock, the compactor under the exclusive
/// side. That discipline is what makes the read-then-write pairs in
/// [`KeyDir::put`], [`KeyDir::delete`] and [`KeyDir::update_if`] sound —
/// no second mutator can slip in between the two steps.
pub struct KeyDir {
  map: SkipMap<Vec<u8>, KeyDirEntry>,
}

impl KeyDir {
  pub fn new() -> Self {
    Self {
      map: SkipMap::new(),
    }
  }

  /// Inserts or replaces the entry for `key`, returning the previous one.
  pub fn put(&self, key: Vec<u8>, entry: KeyDirEntry) -> Option<KeyDirEntry> {
    let old = self.map.get(key.as_slice()).map(|e| *e.value());
    self.map.insert(key, entry);
    old
  }

  pub fn get(&self, key: &[u8]) -> Option<KeyDirEntry> {
    self.map.get(key).map(|e| *e.value())
  }

  /// Removes the entry for `key`, returning it. Idempotent.
  pub fn delete(&self, key: &[u8]) -> Option<KeyDirEntry> {
    self.map.remove(key).map(|e| *e.value())
  }

  /// Replaces the entry only if it still points at `(file_id,
  /// value_offset)`. Used by the compactor so a migrated copy never
  /// clobbers an entry a concurrent write has already moved on.
  pub fn update_if(
    &self,
    key: &[u8],
    file_id: u64,
    value_offset: u64,
    entry: KeyDirEntry,
  ) -> bool {
    match self.map.get(key) {
      Some(cur)
        if cur.value().file_id == file_id && cur.value().value_offset == value_offset =>
      {
        self.map.insert(key.to_vec(), entry);
        true
      }
      _ => false,
    }
  }

  pub fn len(&self) -> usize {
    self.map.len()
  }

  pub fn is_empty(&self) -> bool {
    self.map.is_empty()
  }

  pub fn keys(&self) -> Vec<Bytes> {
    self
      .map
      .iter()
      .map(|e| Bytes::from(e.key().clone()))
      .collect()
  }
}

impl Default for KeyDir {
  fn default() -> Self {
    Self::new()
  }
}
