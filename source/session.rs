use std::{
  any::Any,
  collections, sync,
  sync::atomic::{AtomicBool, AtomicU64},
};

/// Per-connection state shared between the two direction threads and every registered plugin.
///
/// Plugin state lives in `extensions`, keyed by a plugin-chosen string, rather than in a
/// process-global map indexed by session id: that avoids leaking an entry forever if a session
/// object is ever dropped without running its teardown path.
pub struct Session {
  pub id: u64,
  pub connected: AtomicBool,
  pub capabilities_seen: AtomicBool,
  extensions: sync::Mutex<collections::HashMap<&'static str, Box<dyn Any + Send>>>,
}

impl Session {
  pub fn new(id: u64) -> Self {
    Self {
      id,
      connected: AtomicBool::new(true),
      capabilities_seen: AtomicBool::new(false),
      extensions: sync::Mutex::new(collections::HashMap::new()),
    }
  }

  /// Runs `f` against the plugin extension stored under `key`, creating it with `T::default()` on
  /// first use.
  pub fn with_extension<T, R>(&self, key: &'static str, f: impl FnOnce(&mut T) -> R) -> R
  where
    T: Any + Send + Default,
  {
    let mut extensions = self.extensions.lock().unwrap();
    let boxed = extensions.entry(key).or_insert_with(|| Box::<T>::default());
    f(boxed.downcast_mut::<T>().expect("extension type mismatch"))
  }

  pub fn clear_extension(&self, key: &'static str) {
    self.extensions.lock().unwrap().remove(key);
  }
}

pub static SESSION_IDS: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> u64 {
  SESSION_IDS.fetch_add(1, sync::atomic::Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn extensions_are_created_lazily_and_persist() {
    let session = Session::new(1);
    let first = session.with_extension::<Vec<i32>, usize>("numbers", |values| {
      values.push(1);
      values.len()
    });
    assert_eq!(first, 1);
    let second = session.with_extension::<Vec<i32>, usize>("numbers", |values| {
      values.push(2);
      values.len()
    });
    assert_eq!(second, 2);
  }

  #[test]
  fn clear_extension_resets_state() {
    let session = Session::new(1);
    session.with_extension::<Vec<i32>, ()>("numbers", |values| values.push(1));
    session.clear_extension("numbers");
    let len = session.with_extension::<Vec<i32>, usize>("numbers", |values| values.len());
    assert_eq!(len, 0);
  }
}
