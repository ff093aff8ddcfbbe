use std::{
  path::{Path, PathBuf},
  sync::atomic::{AtomicU64, Ordering},
};

use bytes::{Bytes, BytesMut};
use log::warn;

use crate::{
  errors::{Errors, Result},
  fio::{new_io_manager, IOManager},
  option::IOManagerType,
};

use super::log_record::{
  compute_record_crc, decode_log_record_header, LogRecord, LogRecordHeader,
  LOG_RECORD_HEADER_SIZE,
};

pub const DATA_FILE_NAME_SUFFIX: &str = ".data";
pub const TMP_FILE_NAME_SUFFIX: &str = ".data.tmp";

pub fn get_data_file_name<P>(dir_path: P, file_id: u64) -> PathBuf
where
  P: AsRef<Path>,
{
  dir_path
    .as_ref()
    .join(format!("{:09}{}", file_id, DATA_FILE_NAME_SUFFIX))
}

pub fn get_tmp_file_name<P>(dir_path: P, file_id: u64) -> PathBuf
where
  P: AsRef<Path>,
{
  dir_path
    .as_ref()
    .join(format!("{:09}{}", file_id, TMP_FILE_NAME_SUFFIX))
}

/// One log file: a sequence of records appended through a single writer.
/// Offsets handed out by [`DataFile::append`] are stable forever, so
/// positioned reads need no coordination with the writer.
pub struct DataFile {
  file_id: u64,
  path: PathBuf,
  write_off: AtomicU64,
  io_manager: Box<dyn IOManager>,

  // Compaction accounting, rebuilt from the log on startup.
  num_records: AtomicU64,
  dead_records: AtomicU64,
}

impl DataFile {
  pub fn new<P>(dir_path: P, file_id: u64, io_type: IOManagerType) -> Result<DataFile>
  where
    P: AsRef<Path>,
  {
    let path = get_data_file_name(dir_path, file_id);
    Self::open(path, file_id, io_type)
  }

  /// Opens a compaction temporary (`NNNNNNNNN.data.tmp`) carrying the
  /// same file id as the candidate it replaces.
  pub fn new_tmp_file<P>(dir_path: P, file_id: u64) -> Result<DataFile>
  where
    P: AsRef<Path>,
  {
    let path = get_tmp_file_name(dir_path, file_id);
    Self::open(path, file_id, IOManagerType::StandardFileIO)
  }

  fn open(path: PathBuf, file_id: u64, io_type: IOManagerType) -> Result<DataFile> {
    let io_manager = new_io_manager(&path, io_type)?;
    let write_off = io_manager.size();
    Ok(DataFile {
      file_id,
      path,
      write_off: AtomicU64::new(write_off),
      io_manager,
      num_records: AtomicU64::new(0),
      dead_records: AtomicU64::new(0),
    })
  }

  pub fn get_file_id(&self) -> u64 {
    self.file_id
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn size(&self) -> u64 {
    self.write_off.load(Ordering::SeqCst)
  }

  /// Appends a batch of records as one contiguous write and returns the
  /// absolute value offset of each record (just past its header and key).
  /// Single-writer: only the flusher (or the compactor, on its own tmp
  /// file) ever calls this on a given file.
  pub fn append(&self, records: &[LogRecord]) -> Result<Vec<u64>> {
    let total: usize = records.iter().map(|r| r.encoded_len()).sum();
    let mut buf = BytesMut::with_capacity(total);

    let base = self.write_off.load(Ordering::SeqCst);
    let mut value_offsets = Vec::with_capacity(records.len());
    for record in records {
      let record_start = base + buf.len() as u64;
      value_offsets.push(record_start + (LOG_RECORD_HEADER_SIZE + record.key.len()) as u64);
      record.encode_into(&mut buf);
    }

    let n = self.io_manager.write(&buf)?;
    if n != buf.len() {
      return Err(Errors::FailedToWriteToDataFile);
    }
    self.write_off.fetch_add(buf.len() as u64, Ordering::SeqCst);
    self
      .num_records
      .fetch_add(records.len() as u64, Ordering::SeqCst);
    Ok(value_offsets)
  }

  /// Positioned read of exactly `len` bytes at `offset`.
  pub fn read_exact(&self, offset: u64, len: usize) -> Result<Bytes> {
    let mut buf = vec![0u8; len];
    let n = self.io_manager.read(&mut buf, offset)?;
    if n != len {
      return Err(Errors::ReadDataFileEOF);
    }
    Ok(Bytes::from(buf))
  }

  /// Iterates all records from offset 0 to EOF. A truncated tail (short
  /// header, or declared key+value running past EOF) ends the scan
  /// cleanly; a crc mismatch stops the scan and the remainder of the
  /// file is treated as unreadable.
  pub fn scan<F>(&self, mut visit: F) -> Result<()>
  where
    F: FnMut(&LogRecordHeader, Vec<u8>, u64, Vec<u8>) -> Result<()>,
  {
    let file_size = self.io_manager.size();
    let mut offset = 0u64;
    loop {
      if offset + LOG_RECORD_HEADER_SIZE as u64 > file_size {
        break;
      }

      let header_buf = self.read_exact(offset, LOG_RECORD_HEADER_SIZE)?;
      let header = decode_log_record_header(&header_buf);
      if header.key_size == 0 {
        // Keys are never empty; a zero size means a half-written header.
        break;
      }

      let kv_size = header.key_size as u64 + header.value_size as u64;
      if offset + LOG_RECORD_HEADER_SIZE as u64 + kv_size > file_size {
        break;
      }

      let kv_buf = self.read_exact(offset + LOG_RECORD_HEADER_SIZE as u64, kv_size as usize)?;
      let key = kv_buf[..header.key_size as usize].to_vec();
      let value = kv_buf[header.key_size as usize..].to_vec();

      if header.crc != 0 {
        let crc = compute_record_crc(&header_buf[4..], &key, &value);
        if crc != header.crc {
          warn!(
            "crc mismatch in data file {} at offset {}, stopping scan",
            self.file_id, offset
          );
          break;
        }
      }

      let value_offset = offset + LOG_RECORD_HEADER_SIZE as u64 + header.key_size as u64;
      visit(&header, key, value_offset, value)?;

      offset += LOG_RECORD_HEADER_SIZE as u64 + kv_size;
    }
    Ok(())
  }

  pub fn sync(&self) -> Result<()> {
    self.io_manager.sync()
  }

  pub fn num_records(&self) -> u64 {
    self.num_records.load(Ordering::SeqCst)
  }

  pub fn dead_records(&self) -> u64 {
    self.dead_records.load(Ordering::SeqCst)
  }

  pub fn inc_num_records(&self, n: u64) {
    self.num_records.fetch_add(n, Ordering::SeqCst);
  }

  pub fn inc_dead_records(&self, n: u64) {
    self.dead_records.fetch_add(n, Ordering::SeqCst);
  }

  pub fn dead_record_ratio(&self) -> f32 {
    let num = self.num_records.load(Ordering::SeqCst);
    if num == 0 {
      return 0.0;
    }
    self.dead_records.load(Ordering::SeqCst) as f32 / num as f32
  }
}
