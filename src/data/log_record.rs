use bytes::{Buf, BufMut, BytesMut};

/// Fixed header size: crc(4) + timestamp(8) + key_size(4) + value_size(4)
/// + tombstone(1). All integers little-endian, no padding between records.
pub const LOG_RECORD_HEADER_SIZE: usize = 4 + 8 + 4 + 4 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordType {
  Normal,

  /// Deletion marker; the record carries no value bytes.
  Deleted,
}

impl LogRecordType {
  pub fn from_u8(v: u8) -> Self {
    match v {
      0 => LogRecordType::Normal,
      _ => LogRecordType::Deleted,
    }
  }

  pub fn to_u8(self) -> u8 {
    match self {
      LogRecordType::Normal => 0,
      LogRecordType::Deleted => 1,
    }
  }
}

#[derive(Debug, Clone, Copy)]
pub struct LogRecordHeader {
  pub crc: u32,
  pub timestamp: u64,
  pub key_size: u32,
  pub value_size: u32,
  pub rec_type: LogRecordType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
  pub key: Vec<u8>,
  pub value: Vec<u8>,
  pub rec_type: LogRecordType,
}

impl LogRecord {
  pub fn encoded_len(&self) -> usize {
    LOG_RECORD_HEADER_SIZE + self.key.len() + self.value.len()
  }

  /// Appends the encoded record to `buf`. The crc covers everything after
  /// the crc field itself (timestamp through the last value byte).
  pub fn encode_into(&self, buf: &mut BytesMut) {
    let start = buf.len();
    buf.put_u32_le(0); // crc placeholder
    buf.put_u64_le(0); // timestamp, reserved
    buf.put_u32_le(self.key.len() as u32);
    buf.put_u32_le(self.value.len() as u32);
    buf.put_u8(self.rec_type.to_u8());
    buf.put_slice(&self.key);
    buf.put_slice(&self.value);

    let crc = crc32fast::hash(&buf[start + 4..]);
    buf[start..start + 4].copy_from_slice(&crc.to_le_bytes());
  }
}

/// Decodes a header from exactly [`LOG_RECORD_HEADER_SIZE`] bytes.
pub fn decode_log_record_header(mut buf: &[u8]) -> LogRecordHeader {
  let crc = buf.get_u32_le();
  let timestamp = buf.get_u64_le();
  let key_size = buf.get_u32_le();
  let value_size = buf.get_u32_le();
  let rec_type = LogRecordType::from_u8(buf.get_u8());
  LogRecordHeader {
    crc,
    timestamp,
    key_size,
    value_size,
    rec_type,
  }
}

/// Recomputes the crc of a decoded record. `header_rest` is the header
/// minus the leading crc field; key and value are the payload bytes.
pub fn compute_record_crc(header_rest: &[u8], key: &[u8], value: &[u8]) -> u32 {
  let mut hasher = crc32fast::Hasher::new();
  hasher.update(header_rest);
  hasher.update(key);
  hasher.update(value);
  hasher.finalize()
}
