use std::{collections::HashMap, fs, path::PathBuf, sync::Arc, thread, time::Duration};

use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};

use crate::{
  db::Engine,
  errors::Errors,
  option::Options,
  util::rand_kv::{get_test_key, get_test_value},
};

fn test_opts(name: &str) -> Options {
  let mut opts = Options::default();
  opts.dir_path = PathBuf::from(format!("/tmp/ember-kv-test/{}", name));
  let _ = fs::remove_dir_all(&opts.dir_path);
  opts
}

fn random_value(len: usize) -> Bytes {
  let s: String = rand::thread_rng()
    .sample_iter(&Alphanumeric)
    .take(len)
    .map(char::from)
    .collect();
  Bytes::from(s)
}

fn data_file_ids(dir_path: &PathBuf) -> Vec<u64> {
  let mut ids: Vec<u64> = fs::read_dir(dir_path)
    .unwrap()
    .flatten()
    .filter_map(|e| {
      e.file_name()
        .to_str()
        .and_then(|n| n.strip_suffix(".data").map(|s| s.to_string()))
    })
    .map(|stem| stem.parse::<u64>().unwrap())
    .collect();
  ids.sort_unstable();
  ids
}

#[test]
fn test_put_get_across_reopen() {
  let opts = test_opts("put-get-reopen");
  {
    let engine = Engine::open(opts.clone()).expect("failed to open engine");
    for i in 0..100 {
      let key = Bytes::from(format!("sample{}", i));
      let value = Bytes::from(format!("hello world {}", i));
      assert!(engine.put(key.clone(), value.clone()).wait().unwrap());
      assert_eq!(engine.get(key).unwrap(), Some(value));
    }
  }

  let engine = Engine::open(opts.clone()).expect("failed to reopen engine");
  for i in 0..100 {
    let key = Bytes::from(format!("sample{}", i));
    let value = Bytes::from(format!("hello world {}", i));
    assert_eq!(engine.get(key).unwrap(), Some(value));
  }
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_update_overwrites() {
  let opts = test_opts("update");
  let mut expected: HashMap<usize, Bytes> = HashMap::new();
  {
    let engine = Engine::open(opts.clone()).expect("failed to open engine");
    for i in 0..1000 {
      let value = random_value(128);
      assert!(engine.put(get_test_key(i), value.clone()).wait().unwrap());
      expected.insert(i, value);
    }
    for (i, value) in &expected {
      assert_eq!(engine.get(get_test_key(*i)).unwrap(), Some(value.clone()));
    }

    for i in 0..1000 {
      let value = random_value(128);
      assert!(engine.put(get_test_key(i), value.clone()).wait().unwrap());
      expected.insert(i, value);
    }
    for (i, value) in &expected {
      assert_eq!(engine.get(get_test_key(*i)).unwrap(), Some(value.clone()));
    }
  }

  let engine = Engine::open(opts.clone()).expect("failed to reopen engine");
  for (i, value) in &expected {
    assert_eq!(engine.get(get_test_key(*i)).unwrap(), Some(value.clone()));
  }
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_remove_semantics() {
  let opts = test_opts("remove");
  {
    let engine = Engine::open(opts.clone()).expect("failed to open engine");
    for i in 0..1000 {
      assert!(engine.put(get_test_key(i), get_test_value(i)).wait().unwrap());
    }

    // First removal succeeds.
    for i in 0..500 {
      assert!(engine.remove(get_test_key(i)).wait().unwrap());
    }
    // Removing again reports there was nothing to do.
    for i in 0..500 {
      assert!(!engine.remove(get_test_key(i)).wait().unwrap());
    }

    for i in 0..500 {
      assert_eq!(engine.get(get_test_key(i)).unwrap(), None);
    }
    for i in 500..1000 {
      assert_eq!(engine.get(get_test_key(i)).unwrap(), Some(get_test_value(i)));
    }
  }

  let engine = Engine::open(opts.clone()).expect("failed to reopen engine");
  for i in 0..500 {
    assert_eq!(engine.get(get_test_key(i)).unwrap(), None);
  }
  for i in 500..1000 {
    assert_eq!(engine.get(get_test_key(i)).unwrap(), Some(get_test_value(i)));
  }
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_duplicate_removes_share_a_batch() {
  let mut opts = test_opts("remove-dup-batch");
  // A wide flush window so both tombstones land in the same batch.
  opts.flush_interval_usecs = 5000;

  let engine = Engine::open(opts.clone()).expect("failed to open engine");
  assert!(engine.put(get_test_key(1), get_test_value(1)).wait().unwrap());

  // Queue both before waiting on either; only the first erase finds an
  // entry at apply time, whichever batch each ends up in.
  let first = engine.remove(get_test_key(1));
  let second = engine.remove(get_test_key(1));
  assert!(first.wait().unwrap());
  assert!(!second.wait().unwrap());
  assert_eq!(engine.get(get_test_key(1)).unwrap(), None);
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_empty_value_is_not_absence() {
  let opts = test_opts("empty-value");
  let engine = Engine::open(opts.clone()).expect("failed to open engine");

  let key = Bytes::from("empty");
  assert!(engine.put(key.clone(), Bytes::new()).wait().unwrap());
  assert_eq!(engine.get(key.clone()).unwrap(), Some(Bytes::new()));
  assert_eq!(engine.get(Bytes::from("missing")).unwrap(), None);

  assert!(engine.remove(key.clone()).wait().unwrap());
  assert_eq!(engine.get(key).unwrap(), None);
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_empty_key_rejected() {
  let opts = test_opts("empty-key");
  let engine = Engine::open(opts.clone()).expect("failed to open engine");

  assert_eq!(
    engine.put(Bytes::new(), Bytes::from("v")).wait(),
    Err(Errors::KeyIsEmpty)
  );
  assert_eq!(engine.remove(Bytes::new()).wait(), Err(Errors::KeyIsEmpty));
  assert_eq!(engine.get(Bytes::new()), Err(Errors::KeyIsEmpty));
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_rotation_keeps_everything_readable() {
  let mut opts = test_opts("rotation");
  opts.max_data_file_size = 128;
  let num_keys = 30;
  {
    let engine = Engine::open(opts.clone()).expect("failed to open engine");
    for i in 0..num_keys {
      assert!(engine.put(get_test_key(i), get_test_value(i)).wait().unwrap());
    }
    for i in 0..num_keys {
      assert_eq!(engine.get(get_test_key(i)).unwrap(), Some(get_test_value(i)));
    }
  }

  let ids = data_file_ids(&opts.dir_path);
  assert!(ids.len() >= 5, "expected at least 5 data files, got {:?}", ids);
  for pair in ids.windows(2) {
    assert!(pair[0] < pair[1]);
  }

  let engine = Engine::open(opts.clone()).expect("failed to reopen engine");
  for i in 0..num_keys {
    assert_eq!(engine.get(get_test_key(i)).unwrap(), Some(get_test_value(i)));
  }
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_compaction_reclaims_space() {
  let mut opts = test_opts("compact-reclaim");
  opts.max_data_file_size = 256;
  opts.compact_dead_ratio = 0.0;
  opts.merge_min_data_file_ratio = 0.0;

  let engine = Engine::open(opts.clone()).expect("failed to open engine");
  let key = Bytes::from("target");
  let mut last_value = Bytes::new();
  for i in 0..10 {
    let value = Bytes::from(format!("{:0100}", i));
    assert!(engine.put(key.clone(), value.clone()).wait().unwrap());
    last_value = value;
  }

  let before = engine.stat();
  assert!(
    before.num_data_files >= 3,
    "expected several data files, got {}",
    before.num_data_files
  );

  engine.compact().expect("compaction failed");

  let after = engine.stat();
  assert_eq!(engine.get(key.clone()).unwrap(), Some(last_value.clone()));
  assert!(after.disk_size < before.disk_size);
  assert!(after.num_data_files < before.num_data_files);

  // A second pass finds nothing more to reclaim.
  engine.compact().expect("compaction failed");
  let again = engine.stat();
  assert!(again.disk_size <= after.disk_size);
  drop(engine);

  let engine = Engine::open(opts.clone()).expect("failed to reopen engine");
  assert_eq!(engine.get(key).unwrap(), Some(last_value));
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_compaction_preserves_tombstones() {
  let mut opts = test_opts("compact-tombstones");
  opts.max_data_file_size = 100;
  opts.compact_dead_ratio = 0.0;
  opts.merge_min_data_file_ratio = 0.0;

  let engine = Engine::open(opts.clone()).expect("failed to open engine");
  let value = Bytes::from([b'x'; 40].to_vec());
  for key in ["a", "b", "c"] {
    assert!(engine.put(Bytes::from(key), value.clone()).wait().unwrap());
  }
  assert!(engine.remove(Bytes::from("a")).wait().unwrap());
  // Push the tombstone out of the active file.
  assert!(engine.put(Bytes::from("d"), value.clone()).wait().unwrap());

  engine.compact().expect("compaction failed");
  assert_eq!(engine.get(Bytes::from("a")).unwrap(), None);
  for key in ["b", "c", "d"] {
    assert_eq!(engine.get(Bytes::from(key)).unwrap(), Some(value.clone()));
  }
  drop(engine);

  // The deletion must survive reopen even though the file that held the
  // deleted value was compacted away.
  let engine = Engine::open(opts.clone()).expect("failed to reopen engine");
  assert_eq!(engine.get(Bytes::from("a")).unwrap(), None);
  for key in ["b", "c", "d"] {
    assert_eq!(engine.get(Bytes::from(key)).unwrap(), Some(value.clone()));
  }
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_background_compaction() {
  let mut opts = test_opts("compact-background");
  opts.max_data_file_size = 256;
  opts.compact_dead_ratio = 0.0;
  opts.merge_min_data_file_ratio = 0.0;
  opts.compaction_interval_secs = 1;

  let engine = Engine::open(opts.clone()).expect("failed to open engine");
  let key = Bytes::from("target");
  let mut last_value = Bytes::new();
  for i in 0..10 {
    let value = Bytes::from(format!("{:0100}", i));
    assert!(engine.put(key.clone(), value.clone()).wait().unwrap());
    last_value = value;
  }
  let before = engine.stat();

  // Wait for at least two compaction cycles to run.
  let deadline = std::time::Instant::now() + Duration::from_secs(10);
  loop {
    if engine.stat().disk_size < before.disk_size {
      break;
    }
    assert!(
      std::time::Instant::now() < deadline,
      "background compaction never reclaimed space"
    );
    thread::sleep(Duration::from_millis(200));
  }
  assert_eq!(engine.get(key).unwrap(), Some(last_value));
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_truncated_tail_is_ignored_on_reopen() {
  let opts = test_opts("truncated-tail");
  {
    let engine = Engine::open(opts.clone()).expect("failed to open engine");
    for i in 0..50 {
      assert!(engine.put(get_test_key(i), get_test_value(i)).wait().unwrap());
    }
  }

  // Simulate a crash mid-append: a partial header at the tail of the
  // newest data file.
  let ids = data_file_ids(&opts.dir_path);
  let newest = opts
    .dir_path
    .join(format!("{:09}.data", ids.last().unwrap()));
  let mut raw = fs::read(&newest).unwrap();
  raw.extend_from_slice(&[0x42; 13]);
  fs::write(&newest, &raw).unwrap();

  let engine = Engine::open(opts.clone()).expect("failed to reopen engine");
  for i in 0..50 {
    assert_eq!(engine.get(get_test_key(i)).unwrap(), Some(get_test_value(i)));
  }
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_fsync_mode() {
  let mut opts = test_opts("fsync-mode");
  opts.fsync_mode = true;

  let engine = Engine::open(opts.clone()).expect("failed to open engine");
  for i in 0..100 {
    assert!(engine.put(get_test_key(i), get_test_value(i)).wait().unwrap());
  }
  for i in 0..100 {
    assert_eq!(engine.get(get_test_key(i)).unwrap(), Some(get_test_value(i)));
  }
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_dir_locked_against_second_open() {
  let opts = test_opts("flock");
  let engine = Engine::open(opts.clone()).expect("failed to open engine");

  let second = Engine::open(opts.clone());
  assert_eq!(second.err(), Some(Errors::DatabaseIsUsing));
  drop(engine);

  // Released on drop.
  let engine = Engine::open(opts.clone()).expect("failed to reopen engine");
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_list_keys_and_stat() {
  let opts = test_opts("list-stat");
  let engine = Engine::open(opts.clone()).expect("failed to open engine");

  for i in 0..10 {
    assert!(engine.put(get_test_key(i), get_test_value(i)).wait().unwrap());
  }
  assert!(engine.remove(get_test_key(0)).wait().unwrap());

  let keys = engine.list_keys();
  assert_eq!(keys.len(), 9);
  assert!(!keys.contains(&get_test_key(0)));

  let stat = engine.stat();
  assert_eq!(stat.num_keys, 9);
  assert!(stat.num_data_files >= 1);
  assert!(stat.dead_records >= 1);
  assert!(stat.disk_size > 0);
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_operations_after_close() {
  let opts = test_opts("after-close");
  let engine = Engine::open(opts.clone()).expect("failed to open engine");
  assert!(engine.put(get_test_key(1), get_test_value(1)).wait().unwrap());

  engine.close().expect("failed to close engine");
  assert_eq!(
    engine.put(get_test_key(2), get_test_value(2)).wait(),
    Err(Errors::EngineClosed)
  );
  // Closing twice is a no-op.
  engine.close().expect("second close failed");
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}

#[test]
fn test_concurrent_writes_and_compaction() {
  let mut opts = test_opts("concurrent");
  opts.max_data_file_size = 64 * 1024;
  opts.compact_dead_ratio = 0.0;
  opts.merge_min_data_file_ratio = 0.0;

  let engine = Engine::open(opts.clone()).expect("failed to open engine");
  for i in 0..10000 {
    assert!(engine.put(get_test_key(i), get_test_value(i)).wait().unwrap());
  }
  let updated = Bytes::from("updated while compacting");
  for i in 0..5000 {
    assert!(engine.put(get_test_key(i), updated.clone()).wait().unwrap());
  }

  let engine = Arc::new(engine);
  let mut handles = vec![];

  let writer = engine.clone();
  handles.push(thread::spawn(move || {
    for i in 10000..20000 {
      assert!(writer.put(get_test_key(i), get_test_value(i)).wait().unwrap());
    }
  }));

  let compactor = engine.clone();
  handles.push(thread::spawn(move || {
    for _ in 0..3 {
      compactor.compact().expect("compaction failed");
      thread::sleep(Duration::from_millis(10));
    }
  }));

  for handle in handles {
    handle.join().unwrap();
  }

  for i in 0..5000 {
    assert_eq!(engine.get(get_test_key(i)).unwrap(), Some(updated.clone()));
  }
  for i in 5000..20000 {
    assert_eq!(engine.get(get_test_key(i)).unwrap(), Some(get_test_value(i)));
  }
  assert_eq!(engine.list_keys().len(), 20000);
  drop(engine);

  let engine = Engine::open(opts.clone()).expect("failed to reopen engine");
  assert_eq!(engine.list_keys().len(), 20000);
  drop(engine);

  fs::remove_dir_all(&opts.dir_path).expect("failed to remove path");
}
