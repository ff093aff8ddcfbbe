use std::{
  sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender},
  time::{Duration, Instant},
};

use log::error;

use crate::{
  data::log_record::{LogRecord, LogRecordType},
  db::Core,
  errors::{Errors, Result},
  keydir::KeyDirEntry,
};

/// Capacity of the bounded intent queue. Producers block when it is full;
/// backpressure, never an error.
pub(crate) const FLUSH_QUEUE_CAPACITY: usize = 65536;

pub(crate) struct WriteIntent {
  pub(crate) key: Vec<u8>,
  pub(crate) value: Vec<u8>,
  pub(crate) tombstone: bool,
  pub(crate) done: CompletionSender,
}

pub(crate) enum Intent {
  Write(WriteIntent),
  /// Wakes a blocked flusher during shutdown; everything still queued is
  /// flushed before the worker exits.
  Shutdown,
}

/// One-shot acknowledgement for a queued put/remove.
///
/// Resolves only after the record is in its data file and the keydir
/// reflects it, so a subsequent `get` from any thread observes the write.
pub struct Completion {
  rx: Receiver<Result<bool>>,
}

pub(crate) struct CompletionSender {
  tx: SyncSender<Result<bool>>,
}

impl Completion {
  pub(crate) fn pair() -> (CompletionSender, Completion) {
    let (tx, rx) = mpsc::sync_channel(1);
    (CompletionSender { tx }, Completion { rx })
  }

  /// A completion that is already resolved.
  pub(crate) fn ready(result: Result<bool>) -> Completion {
    let (tx, rx) = mpsc::sync_channel(1);
    let _ = tx.send(result);
    Completion { rx }
  }

  /// Blocks until the flusher acknowledges the operation.
  pub fn wait(self) -> Result<bool> {
    match self.rx.recv() {
      Ok(result) => result,
      Err(_) => Err(Errors::EngineClosed),
    }
  }
}

impl CompletionSender {
  pub(crate) fn complete(self, result: Result<bool>) {
    // The caller may have dropped its end without waiting.
    let _ = self.tx.send(result);
  }
}

impl Core {
  /// The dedicated flush worker: drains intents into batches bounded by
  /// `flush_batch_size` payload bytes or `flush_interval_usecs` of
  /// waiting, whichever comes first, and commits each batch.
  pub(crate) fn flush_worker(&self, rx: Receiver<Intent>) {
    let flush_interval = Duration::from_micros(self.options.flush_interval_usecs.max(1));

    loop {
      let first = match rx.recv() {
        Ok(Intent::Write(intent)) => intent,
        Ok(Intent::Shutdown) | Err(_) => break,
      };

      let mut payload = (first.key.len() + first.value.len()) as u64;
      let mut batch = vec![first];
      let deadline = Instant::now() + flush_interval;
      let mut shutdown = false;

      while payload < self.options.flush_batch_size {
        let now = Instant::now();
        if now >= deadline {
          break;
        }
        match rx.recv_timeout(deadline - now) {
          Ok(Intent::Write(intent)) => {
            payload += (intent.key.len() + intent.value.len()) as u64;
            batch.push(intent);
          }
          Ok(Intent::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
            shutdown = true;
            break;
          }
          Err(RecvTimeoutError::Timeout) => break,
        }
      }

      self.flush_batch(batch);
      if shutdown {
        break;
      }
    }

    // Shutdown path: every intent already accepted must still be
    // resolved before the worker exits.
    let mut rest = Vec::new();
    loop {
      match rx.try_recv() {
        Ok(Intent::Write(intent)) => rest.push(intent),
        Ok(Intent::Shutdown) => continue,
        Err(_) => break,
      }
    }
    if !rest.is_empty() {
      self.flush_batch(rest);
    }
  }

  /// Commits one batch: rotate if the active file would overflow, append
  /// everything in a single write, then publish the keydir mutations
  /// under the shared io-lock and signal the completions.
  fn flush_batch(&self, intents: Vec<WriteIntent>) {
    let mut records = Vec::with_capacity(intents.len());
    let mut pending = Vec::with_capacity(intents.len());
    for intent in intents {
      if intent.tombstone && self.keydir.get(&intent.key).is_none() {
        // Already gone; report false without spending a tombstone.
        intent.done.complete(Ok(false));
        continue;
      }
      let rec_type = if intent.tombstone {
        LogRecordType::Deleted
      } else {
        LogRecordType::Normal
      };
      records.push(LogRecord {
        key: intent.key,
        value: intent.value,
        rec_type,
      });
      pending.push(intent.done);
    }
    if records.is_empty() {
      return;
    }

    let batch_bytes: u64 = records.iter().map(|r| r.encoded_len() as u64).sum();
    if let Err(e) = self.rotate_if_needed(batch_bytes) {
      error!("rotation failed before flush: {}", e);
      for done in pending {
        done.complete(Err(e.clone()));
      }
      return;
    }

    let active = self.active_file.read().clone();
    let value_offsets = match active.append(&records) {
      Ok(offsets) => offsets,
      Err(e) => {
        error!("failed to append batch of {} records: {}", records.len(), e);
        for done in pending {
          done.complete(Err(e.clone()));
        }
        return;
      }
    };

    if self.options.fsync_mode {
      if let Err(e) = active.sync() {
        for done in pending {
          done.complete(Err(e.clone()));
        }
        return;
      }
    }

    // Each tombstone reports whether its erase actually found an entry:
    // two removes for the same key in one batch both pass the collect
    // pass, but only the first finds anything at apply time.
    let mut results = Vec::with_capacity(records.len());
    {
      // Shared side: the compactor's swap (the exclusive side) cannot
      // interleave with these updates.
      let _guard = self.io_lock.read();
      for (record, value_offset) in records.iter().zip(value_offsets) {
        match record.rec_type {
          LogRecordType::Deleted => {
            active.inc_dead_records(1);
            let old = self.keydir.delete(&record.key);
            if let Some(old) = &old {
              self.mark_dead_record(old.file_id);
            }
            results.push(old.is_some());
          }
          LogRecordType::Normal => {
            let entry = KeyDirEntry {
              file_id: active.get_file_id(),
              value_offset,
              value_size: record.value.len() as u64,
              timestamp: 0,
            };
            if let Some(old) = self.keydir.put(record.key.clone(), entry) {
              self.mark_dead_record(old.file_id);
            }
            results.push(true);
          }
        }
      }
    }

    for (done, applied) in pending.into_iter().zip(results) {
      done.complete(Ok(applied));
    }
  }

  fn rotate_if_needed(&self, incoming: u64) -> Result<()> {
    let active = self.active_file.read().clone();
    if active.size() == 0 || active.size() + incoming <= self.options.max_data_file_size {
      return Ok(());
    }
    self.rotate_active_file()
  }

  fn mark_dead_record(&self, file_id: u64) {
    if let Some(data_file) = self.data_files.read().get(&file_id) {
      data_file.inc_dead_records(1);
    }
  }
}
