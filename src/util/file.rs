use std::{fs, path::Path};

/// Total size in bytes of the regular files directly under `dir_path`.
pub fn dir_disk_size<P>(dir_path: P) -> u64
where
  P: AsRef<Path>,
{
  let mut total = 0;
  if let Ok(read_dir) = fs::read_dir(dir_path) {
    for entry in read_dir.flatten() {
      if let Ok(meta) = entry.metadata() {
        if meta.is_file() {
          total += meta.len();
        }
      }
    }
  }
  total
}

/// Free space on the filesystem holding `dir_path`. Errors are treated
/// as unlimited so a stat failure never wedges compaction.
pub fn available_disk_space<P>(dir_path: P) -> u64
where
  P: AsRef<Path>,
{
  fs4::available_space(dir_path).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_dir_disk_size() {
    let dir = std::env::temp_dir().join("ember-kv-util-disk-size");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("a"), b"12345").unwrap();
    fs::write(dir.join("b"), b"123").unwrap();
    assert_eq!(dir_disk_size(&dir), 8);
    fs::remove_dir_all(&dir).unwrap();
  }

  #[test]
  fn test_available_disk_space() {
    assert!(available_disk_space(std::env::temp_dir()) > 0);
  }
}
