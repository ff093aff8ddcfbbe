use std::{
  fs,
  sync::{atomic::Ordering, Arc},
  thread,
  time::{Duration, Instant},
};

use log::{error, info, warn};

use crate::{
  data::{
    data_file::{get_tmp_file_name, DataFile},
    log_record::{LogRecord, LogRecordType},
  },
  db::Core,
  errors::{Errors, Result},
  keydir::KeyDirEntry,
  option::IOManagerType,
  util,
};

struct Migration {
  key: Vec<u8>,
  old_value_offset: u64,
  entry: KeyDirEntry,
}

impl Core {
  pub(crate) fn compact_worker(&self) {
    let interval = Duration::from_secs(self.options.compaction_interval_secs);
    while !self.stop.load(Ordering::SeqCst) {
      match self.compact() {
        Ok(()) | Err(Errors::CompactionRatioUnreached) => {}
        Err(e) => error!("compaction run failed: {}", e),
      }

      // Sleep in slices so close() can join promptly.
      let deadline = Instant::now() + interval;
      while !self.stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
          break;
        }
        thread::sleep((deadline - now).min(Duration::from_millis(50)));
      }
    }
  }

  /// One compaction pass over the sealed files, ascending by id. The
  /// active file is never touched; the flusher owns it exclusively.
  pub(crate) fn compact(&self) -> Result<()> {
    let guard = self.compact_lock.try_lock();
    if guard.is_none() {
      return Err(Errors::CompactionInProgress);
    }

    // Snapshot under the rotation mutex so a file the flusher is just
    // publishing as active can never land in the candidate set.
    let mut candidates: Vec<Arc<DataFile>> = {
      let _file_guard = self.file_lock.lock();
      let active_id = self.last_file_id.load(Ordering::SeqCst);
      let files = self.data_files.read();
      files
        .values()
        .filter(|f| f.get_file_id() != active_id)
        .cloned()
        .collect()
    };
    if candidates.is_empty() {
      return Ok(());
    }
    candidates.sort_by_key(|f| f.get_file_id());

    // When most bytes still sit in the active file there is little to
    // reclaim; skip the whole run.
    let sealed_bytes: u64 = candidates.iter().map(|f| f.size()).sum();
    let active_bytes = self.active_file.read().size();
    let total_bytes = sealed_bytes + active_bytes;
    if total_bytes > 0
      && (sealed_bytes as f32 / total_bytes as f32) < self.options.merge_min_data_file_ratio
    {
      return Err(Errors::CompactionRatioUnreached);
    }

    // The rewrite momentarily needs room for a full copy of a candidate.
    let largest = candidates.iter().map(|f| f.size()).max().unwrap_or(0);
    if largest >= util::file::available_disk_space(&self.options.dir_path) {
      return Err(Errors::CompactionNoEnoughSpace);
    }

    for data_file in candidates {
      if self.stop.load(Ordering::SeqCst) {
        break;
      }
      if data_file.size() > 0 && data_file.dead_record_ratio() < self.options.compact_dead_ratio {
        continue;
      }
      if let Err(e) = self.compact_data_file(&data_file) {
        // State is unchanged for this file; the next run retries.
        error!(
          "failed to compact data file {}: {}",
          data_file.get_file_id(),
          e
        );
      }
    }
    Ok(())
  }

  /// Rewrites one sealed file into `NNNNNNNNN.data.tmp`, keeping only
  /// records the keydir still points at, then swaps the replacement in
  /// under the exclusive io-lock.
  fn compact_data_file(&self, data_file: &Arc<DataFile>) -> Result<()> {
    let file_id = data_file.get_file_id();
    let dir_path = &self.options.dir_path;

    // A tombstone may only be dropped when no lower-id file remains that
    // could still hold a stale live record for its key; otherwise it is
    // carried into the replacement and drained by a later run.
    let has_older = {
      let files = self.data_files.read();
      files.keys().any(|&id| id < file_id)
    };

    // A leftover temporary from an aborted pass would otherwise be
    // appended to.
    let _ = fs::remove_file(get_tmp_file_name(dir_path, file_id));
    let tmp_file = DataFile::new_tmp_file(dir_path, file_id)?;
    let mut migrations: Vec<Migration> = Vec::new();
    let mut carried_tombstones: u64 = 0;

    let scan_result = data_file.scan(|header, key, value_offset, value| {
      match header.rec_type {
        LogRecordType::Deleted => {
          if has_older {
            let record = LogRecord {
              key,
              value: Vec::new(),
              rec_type: LogRecordType::Deleted,
            };
            tmp_file.append(&[record])?;
            carried_tombstones += 1;
          }
        }
        LogRecordType::Normal => {
          let current = match self.keydir.get(&key) {
            Some(current) => current,
            None => return Ok(()),
          };
          if current.file_id != file_id || current.value_offset != value_offset {
            // A newer version exists elsewhere; this copy is stale.
            return Ok(());
          }
          let value_size = value.len() as u64;
          let record = LogRecord {
            key: key.clone(),
            value,
            rec_type: LogRecordType::Normal,
          };
          let offsets = tmp_file.append(&[record])?;
          migrations.push(Migration {
            key,
            old_value_offset: value_offset,
            entry: KeyDirEntry {
              file_id,
              value_offset: offsets[0],
              value_size,
              timestamp: header.timestamp,
            },
          });
        }
      }
      Ok(())
    });

    if let Err(e) = scan_result {
      let _ = fs::remove_file(tmp_file.path());
      return Err(e);
    }

    let survivors = migrations.len() as u64 + carried_tombstones;
    if survivors > 0 {
      // Make the replacement durable before it can take the original's
      // name; long I/O stays outside the lock.
      if let Err(e) = tmp_file.sync() {
        let _ = fs::remove_file(tmp_file.path());
        return Err(e);
      }
    }

    // The swap: readers either see the old file or the replacement,
    // never a half-applied state.
    let _guard = self.io_lock.write();

    if survivors == 0 {
      self.data_files.write().remove(&file_id);
      let _ = fs::remove_file(tmp_file.path());
      if let Err(e) = fs::remove_file(data_file.path()) {
        warn!("failed to remove stale data file {}: {}", file_id, e);
      }
      info!("compaction removed data file {}", file_id);
      return Ok(());
    }

    if let Err(e) = fs::rename(tmp_file.path(), data_file.path()) {
      error!("failed to rename compacted file {}: {}", file_id, e);
      let _ = fs::remove_file(tmp_file.path());
      return Err(Errors::FailedToWriteToDataFile);
    }

    let new_file = Arc::new(DataFile::new(
      dir_path,
      file_id,
      IOManagerType::StandardFileIO,
    )?);
    new_file.inc_num_records(survivors);
    new_file.inc_dead_records(carried_tombstones);

    let mut replaced = 0u64;
    for migration in &migrations {
      if self.keydir.update_if(
        &migration.key,
        file_id,
        migration.old_value_offset,
        migration.entry,
      ) {
        replaced += 1;
      } else {
        // Superseded during the scan; the migrated copy is garbage for
        // the next run.
        new_file.inc_dead_records(1);
      }
    }

    self.data_files.write().insert(file_id, new_file);
    info!(
      "compacted data file {}: {} records kept, {} keydir entries moved",
      file_id, survivors, replaced
    );
    Ok(())
  }
}
