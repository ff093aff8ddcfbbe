use lazy_static::lazy_static;
use std::path::PathBuf;

lazy_static! {
  pub static ref DEFAULT_DIR_PATH: PathBuf = std::env::temp_dir().join("ember-kv");
}

#[derive(Debug, Clone)]
pub struct Options {
  pub dir_path: PathBuf,

  /// Byte threshold that triggers rotation of the active data file.
  pub max_data_file_size: u64,

  /// Max key+value payload bytes coalesced into a single flush batch.
  pub flush_batch_size: u64,

  /// Max wait before a non-full batch is flushed anyway.
  pub flush_interval_usecs: u64,

  /// Period of background compaction runs; 0 disables the worker.
  pub compaction_interval_secs: u64,

  /// Minimum dead-record fraction for a sealed file to be compacted.
  pub compact_dead_ratio: f32,

  /// Skip a compaction run while the sealed files hold less than this
  /// fraction of the directory's bytes.
  pub merge_min_data_file_ratio: f32,

  /// If true, fsync the active file after every flushed batch.
  pub fsync_mode: bool,

  pub mmap_at_startup: bool,
}

impl Default for Options {
  fn default() -> Self {
    Self {
      dir_path: DEFAULT_DIR_PATH.clone(),
      max_data_file_size: 512 * 1024 * 1024, // 512MB
      flush_batch_size: 8 * 1024 * 1024,     // 8MB
      flush_interval_usecs: 50,
      compaction_interval_secs: 0,
      compact_dead_ratio: 0.4,
      merge_min_data_file_ratio: 0.3,
      fsync_mode: false,
      mmap_at_startup: true,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IOManagerType {
  StandardFileIO,

  MemoryMap,
}
