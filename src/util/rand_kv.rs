use bytes::Bytes;

pub fn get_test_key(i: usize) -> Bytes {
  Bytes::from(format!("ember-kv-key-{:09}", i))
}

pub fn get_test_value(i: usize) -> Bytes {
  Bytes::from(format!("ember-kv-value-{:09}", i))
}
