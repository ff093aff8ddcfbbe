use std::{
  collections::HashMap,
  fs::{self, File},
  path::Path,
  sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    mpsc::{self, SyncSender},
    Arc,
  },
  thread::{self, JoinHandle},
};

use bytes::Bytes;
use fs4::FileExt;
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
  data::{
    data_file::{DataFile, DATA_FILE_NAME_SUFFIX, TMP_FILE_NAME_SUFFIX},
    log_record::LogRecordType,
  },
  errors::{Errors, Result},
  flush::{Intent, WriteIntent, FLUSH_QUEUE_CAPACITY},
  keydir::{KeyDir, KeyDirEntry},
  option::{IOManagerType, Options},
  util,
};

pub use crate::flush::Completion;

pub const FILE_LOCK_NAME: &str = "flock";

/// Storage engine statistics, a point-in-time snapshot.
#[derive(Debug, Clone)]
pub struct EngineStat {
  pub num_keys: usize,
  pub num_data_files: usize,
  pub dead_records: u64,
  pub disk_size: u64,
}

/// The storage engine handle. Writes are queued to a dedicated flush
/// worker and acknowledged through [`Completion`]s; reads go straight to
/// the keydir and then the owning data file.
pub struct Engine {
  core: Arc<Core>,
  flush_handle: Mutex<Option<JoinHandle<()>>>,
  compact_handle: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct Core {
  pub(crate) options: Options,

  /// All data files by id, the active one included.
  pub(crate) data_files: RwLock<HashMap<u64, Arc<DataFile>>>,
  pub(crate) active_file: RwLock<Arc<DataFile>>,
  pub(crate) last_file_id: AtomicU64,

  pub(crate) keydir: KeyDir,

  /// Shared by readers and by the flusher's keydir updates; exclusive
  /// only for the compactor's swap step.
  pub(crate) io_lock: RwLock<()>,
  /// Serializes rotation; only the flusher creates new data files.
  pub(crate) file_lock: Mutex<()>,
  /// At most one compaction pass at a time (background or manual).
  pub(crate) compact_lock: Mutex<()>,

  pub(crate) flush_tx: SyncSender<Intent>,
  pub(crate) stop: AtomicBool,

  pub(crate) lock_file: File,
}

impl Engine {
  /// Opens the engine on `options.dir_path`, recovering the keydir from
  /// any existing data files, then starts the background workers.
  pub fn open(options: Options) -> Result<Engine> {
    check_options(&options)?;

    let dir_path = options.dir_path.clone();
    if !dir_path.is_dir() {
      if let Err(e) = fs::create_dir_all(&dir_path) {
        error!("failed to create database directory: {}", e);
        return Err(Errors::FailedToCreateDatabaseDir);
      }
    }

    let lock_file = acquire_dir_lock(&dir_path)?;
    remove_stale_tmp_files(&dir_path);

    let file_ids = load_data_file_ids(&dir_path)?;
    let io_type = if options.mmap_at_startup {
      IOManagerType::MemoryMap
    } else {
      IOManagerType::StandardFileIO
    };

    // Rebuild the keydir by scanning every file in ascending id order:
    // later records override earlier ones, tombstones erase.
    let keydir = KeyDir::new();
    let mut record_stats: HashMap<u64, (u64, u64)> = HashMap::new();
    for &file_id in &file_ids {
      let data_file = DataFile::new(&dir_path, file_id, io_type)?;
      load_index_from_data_file(&data_file, &keydir, &mut record_stats)?;
    }

    // Reopen the sealed files with standard file I/O for serving reads,
    // carrying over the record accounting the scan rebuilt.
    let mut data_files: HashMap<u64, Arc<DataFile>> = HashMap::new();
    for &file_id in &file_ids {
      let data_file = Arc::new(DataFile::new(
        &dir_path,
        file_id,
        IOManagerType::StandardFileIO,
      )?);
      if let Some(&(num, dead)) = record_stats.get(&file_id) {
        data_file.inc_num_records(num);
        data_file.inc_dead_records(dead);
      }
      data_files.insert(file_id, data_file);
    }

    // Recovery always rotates to a fresh active file.
    let active_id = file_ids.last().copied().unwrap_or(0) + 1;
    let active_file = Arc::new(DataFile::new(
      &dir_path,
      active_id,
      IOManagerType::StandardFileIO,
    )?);
    data_files.insert(active_id, active_file.clone());

    let (flush_tx, flush_rx) = mpsc::sync_channel(FLUSH_QUEUE_CAPACITY);
    let core = Arc::new(Core {
      options,
      data_files: RwLock::new(data_files),
      active_file: RwLock::new(active_file),
      last_file_id: AtomicU64::new(active_id),
      keydir,
      io_lock: RwLock::new(()),
      file_lock: Mutex::new(()),
      compact_lock: Mutex::new(()),
      flush_tx,
      stop: AtomicBool::new(false),
      lock_file,
    });

    let flush_core = core.clone();
    let flush_handle = thread::Builder::new()
      .name("ember-kv-flush".to_string())
      .spawn(move || flush_core.flush_worker(flush_rx))
      .map_err(|e| {
        error!("failed to start flush worker: {}", e);
        Errors::FailedToStartWorker
      })?;

    let compact_handle = if core.options.compaction_interval_secs > 0 {
      let compact_core = core.clone();
      let handle = thread::Builder::new()
        .name("ember-kv-compact".to_string())
        .spawn(move || compact_core.compact_worker())
        .map_err(|e| {
          error!("failed to start compaction worker: {}", e);
          Errors::FailedToStartWorker
        })?;
      Some(handle)
    } else {
      None
    };

    info!(
      "opened engine at {:?} with {} data files",
      core.options.dir_path,
      file_ids.len() + 1
    );

    Ok(Engine {
      core,
      flush_handle: Mutex::new(Some(flush_handle)),
      compact_handle: Mutex::new(compact_handle),
    })
  }

  /// Queues a write. The returned completion resolves `Ok(true)` once the
  /// record is in its data file and visible to every reader.
  pub fn put(&self, key: Bytes, value: Bytes) -> Completion {
    if key.is_empty() {
      return Completion::ready(Err(Errors::KeyIsEmpty));
    }
    self.core.enqueue(key, value, false)
  }

  /// Queues a deletion. Resolves `Ok(false)` iff the key was absent when
  /// the tombstone was applied.
  pub fn remove(&self, key: Bytes) -> Completion {
    if key.is_empty() {
      return Completion::ready(Err(Errors::KeyIsEmpty));
    }
    {
      let _guard = self.core.io_lock.read();
      if self.core.keydir.get(&key).is_none() {
        // Nothing to do, and no tombstone bytes spent saying so. The
        // flusher re-checks in case a racing put lands first.
        return Completion::ready(Ok(false));
      }
    }
    self.core.enqueue(key, Bytes::new(), true)
  }

  /// Returns the last durably written value, or `None` if the key is
  /// absent or tombstoned.
  pub fn get(&self, key: Bytes) -> Result<Option<Bytes>> {
    if key.is_empty() {
      return Err(Errors::KeyIsEmpty);
    }
    self.core.get_value(&key)
  }

  /// Snapshot of all live keys.
  pub fn list_keys(&self) -> Vec<Bytes> {
    self.core.keydir.keys()
  }

  pub fn stat(&self) -> EngineStat {
    let files = self.core.data_files.read();
    EngineStat {
      num_keys: self.core.keydir.len(),
      num_data_files: files.len(),
      dead_records: files.values().map(|f| f.dead_records()).sum(),
      disk_size: util::file::dir_disk_size(&self.core.options.dir_path),
    }
  }

  /// Fsyncs the active data file.
  pub fn sync(&self) -> Result<()> {
    self.core.active_file.read().sync()
  }

  /// Runs one compaction pass synchronously; the background worker uses
  /// the same entry point.
  pub fn compact(&self) -> Result<()> {
    self.core.compact()
  }

  /// Drains the flush queue (resolving every pending completion), joins
  /// the workers and syncs the active file. Idempotent; also invoked from
  /// `Drop`.
  pub fn close(&self) -> Result<()> {
    if self.core.stop.swap(true, Ordering::SeqCst) {
      return Ok(());
    }

    let _ = self.core.flush_tx.send(Intent::Shutdown);
    if let Some(handle) = self.flush_handle.lock().take() {
      if handle.join().is_err() {
        error!("flush worker panicked");
      }
    }
    if let Some(handle) = self.compact_handle.lock().take() {
      if handle.join().is_err() {
        error!("compaction worker panicked");
      }
    }

    self.core.active_file.read().sync()?;
    info!("closed engine at {:?}", self.core.options.dir_path);
    Ok(())
  }
}

impl Drop for Engine {
  fn drop(&mut self) {
    if let Err(e) = self.close() {
      error!("error while closing engine: {}", e);
    }
    let _ = self.core.lock_file.unlock();
  }
}

impl Core {
  pub(crate) fn enqueue(&self, key: Bytes, value: Bytes, tombstone: bool) -> Completion {
    if self.stop.load(Ordering::SeqCst) {
      return Completion::ready(Err(Errors::EngineClosed));
    }
    let (done, completion) = Completion::pair();
    let intent = Intent::Write(WriteIntent {
      key: key.to_vec(),
      value: value.to_vec(),
      tombstone,
      done,
    });
    if let Err(send_err) = self.flush_tx.send(intent) {
      if let Intent::Write(intent) = send_err.0 {
        intent.done.complete(Err(Errors::EngineClosed));
      }
    }
    completion
  }

  pub(crate) fn get_value(&self, key: &[u8]) -> Result<Option<Bytes>> {
    // Snapshot entry and file under the shared lock; the positioned read
    // itself runs lock-free on the append-only file.
    let located = {
      let _guard = self.io_lock.read();
      match self.keydir.get(key) {
        None => None,
        Some(entry) => {
          let files = self.data_files.read();
          let data_file = files
            .get(&entry.file_id)
            .cloned()
            .ok_or(Errors::DataFileNotFound)?;
          Some((entry, data_file))
        }
      }
    };

    let (entry, data_file) = match located {
      Some(located) => located,
      None => return Ok(None),
    };

    if entry.value_size == 0 {
      return Ok(Some(Bytes::new()));
    }
    match data_file.read_exact(entry.value_offset, entry.value_size as usize) {
      Ok(value) => Ok(Some(value)),
      Err(e) => {
        error!(
          "failed to read value from data file {} at offset {}: {}",
          entry.file_id, entry.value_offset, e
        );
        Ok(None)
      }
    }
  }

  /// Creates the next data file and publishes it as active. The sealed
  /// predecessor is synced first and stays readable through the map.
  pub(crate) fn rotate_active_file(&self) -> Result<()> {
    let _guard = self.file_lock.lock();

    self.active_file.read().sync()?;

    let new_id = self.last_file_id.load(Ordering::SeqCst) + 1;
    let new_file = Arc::new(DataFile::new(
      &self.options.dir_path,
      new_id,
      IOManagerType::StandardFileIO,
    )?);
    self.data_files.write().insert(new_id, new_file.clone());
    *self.active_file.write() = new_file;
    self.last_file_id.store(new_id, Ordering::SeqCst);

    info!("rotated to data file {}", new_id);
    Ok(())
  }
}

fn check_options(options: &Options) -> Result<()> {
  if options.dir_path.as_os_str().is_empty() {
    return Err(Errors::InvalidDbOptions);
  }
  if options.max_data_file_size == 0 || options.flush_batch_size == 0 {
    return Err(Errors::InvalidDbOptions);
  }
  if !(0.0..=1.0).contains(&options.compact_dead_ratio)
    || !(0.0..=1.0).contains(&options.merge_min_data_file_ratio)
  {
    return Err(Errors::InvalidDbOptions);
  }
  Ok(())
}

fn acquire_dir_lock(dir_path: &Path) -> Result<File> {
  let lock_path = dir_path.join(FILE_LOCK_NAME);
  let lock_file = match fs::OpenOptions::new()
    .create(true)
    .read(true)
    .write(true)
    .open(&lock_path)
  {
    Ok(file) => file,
    Err(e) => {
      error!("failed to open lock file: {}", e);
      return Err(Errors::FailedToOpenDataFile);
    }
  };
  if lock_file.try_lock_exclusive().is_err() {
    return Err(Errors::DatabaseIsUsing);
  }
  Ok(lock_file)
}

/// Leftover `.data.tmp` files mean a compaction was cut short; the
/// originals are intact, so the temporaries are just deleted.
fn remove_stale_tmp_files(dir_path: &Path) {
  let Ok(read_dir) = fs::read_dir(dir_path) else {
    return;
  };
  for entry in read_dir.flatten() {
    let file_name = entry.file_name();
    if let Some(name) = file_name.to_str() {
      if name.ends_with(TMP_FILE_NAME_SUFFIX) {
        warn!("removing stale compaction temporary {:?}", entry.path());
        let _ = fs::remove_file(entry.path());
      }
    }
  }
}

fn load_data_file_ids(dir_path: &Path) -> Result<Vec<u64>> {
  let read_dir = match fs::read_dir(dir_path) {
    Ok(read_dir) => read_dir,
    Err(e) => {
      error!("failed to read database directory: {}", e);
      return Err(Errors::FailedToReadDatabaseDir);
    }
  };

  let mut file_ids = Vec::new();
  for entry in read_dir.flatten() {
    if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
      continue;
    }
    let file_name = entry.file_name();
    let Some(name) = file_name.to_str() else {
      continue;
    };
    let Some(stem) = name.strip_suffix(DATA_FILE_NAME_SUFFIX) else {
      // Not a data file (lock file, stray temporary already removed).
      continue;
    };
    match stem.parse::<u64>() {
      Ok(file_id) => file_ids.push(file_id),
      Err(_) => {
        error!("malformed data file name {:?}", name);
        return Err(Errors::DataDirectoryCorrupted);
      }
    }
  }
  file_ids.sort_unstable();
  Ok(file_ids)
}

fn load_index_from_data_file(
  data_file: &DataFile,
  keydir: &KeyDir,
  record_stats: &mut HashMap<u64, (u64, u64)>,
) -> Result<()> {
  let file_id = data_file.get_file_id();
  data_file.scan(|header, key, value_offset, _value| {
    record_stats.entry(file_id).or_insert((0, 0)).0 += 1;
    match header.rec_type {
      LogRecordType::Deleted => {
        // The tombstone itself is garbage the moment it is applied.
        record_stats.entry(file_id).or_insert((0, 0)).1 += 1;
        if let Some(old) = keydir.delete(&key) {
          record_stats.entry(old.file_id).or_insert((0, 0)).1 += 1;
        }
      }
      LogRecordType::Normal => {
        let entry = KeyDirEntry {
          file_id,
          value_offset,
          value_size: header.value_size as u64,
          timestamp: header.timestamp,
        };
        if let Some(old) = keydir.put(key, entry) {
          record_stats.entry(old.file_id).or_insert((0, 0)).1 += 1;
        }
      }
    }
    Ok(())
  })
}
