use crate::net::SharedSocket;
use crate::session::Session;
use std::{collections, sync};

pub struct Event {
  pub seq: String,
  pub command: String,
  pub payload: Vec<u8>,
  pub write: bool,
  pub result: Option<Vec<u8>>,
  pub session: sync::Arc<Session>,
  pub upstream: SharedSocket,
  pub downstream: SharedSocket,
  /// Event names a listener wants removed from the client bus once this dispatch finishes.
  pub detach_client: Vec<String>,
  /// Same as `detach_client`, for the server bus.
  pub detach_server: Vec<String>,
}

pub trait Listener: Send {
  fn call(&mut self, event: &mut Event) -> anyhow::Result<()>;
}

impl<F> Listener for F
where
  F: FnMut(&mut Event) -> anyhow::Result<()> + Send,
{
  fn call(&mut self, event: &mut Event) -> anyhow::Result<()> {
    self(event)
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ListenerId(u64);

struct Slot {
  id: u64,
  once: bool,
  listener: Box<dyn Listener>,
}

#[derive(Default)]
pub struct EventBus {
  next_id: u64,
  listeners: collections::HashMap<String, Vec<Slot>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn on(&mut self, name: &str, listener: impl Listener + 'static) -> ListenerId {
    self.push(name, false, Box::new(listener))
  }

  pub fn once(&mut self, name: &str, listener: impl Listener + 'static) -> ListenerId {
    self.push(name, true, Box::new(listener))
  }

  fn push(&mut self, name: &str, once: bool, listener: Box<dyn Listener>) -> ListenerId {
    self.next_id += 1;
    let id = self.next_id;
    self
      .listeners
      .entry(name.to_string())
      .or_default()
      .push(Slot { id, once, listener });
    ListenerId(id)
  }

  pub fn off(&mut self, name: &str, id: ListenerId) {
    if let Some(slots) = self.listeners.get_mut(name) {
      slots.retain(|slot| slot.id != id.0);
    }
  }

  pub fn off_all(&mut self, name: &str) {
    self.listeners.remove(name);
  }

  /// Invokes every listener registered for `name`, in registration order, on `event`. A listener
  /// error is logged and does not stop the remaining listeners from running.
  pub fn emit(&mut self, name: &str, event: &mut Event) {
    let Some(mut slots) = self.listeners.remove(name) else {
      return;
    };
    let mut keep = Vec::with_capacity(slots.len());
    for mut slot in slots.drain(..) {
      if let Err(error) = slot.listener.call(event) {
        log::error!("listener for {name} failed: {error:#}");
      }
      if !slot.once {
        keep.push(slot);
      }
    }
    if !keep.is_empty() {
      self.listeners.insert(name.to_string(), keep);
    }
  }

  pub fn listener_count(&self, name: &str) -> usize {
    self.listeners.get(name).map_or(0, Vec::len)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net;
  use std::sync::{atomic, Arc, Mutex};

  fn fake_event() -> Event {
    let socket: net::SharedSocket = Arc::new(Mutex::new(Box::new(std::io::Cursor::new(
      Vec::<u8>::new(),
    ))));
    Event {
      seq: "a1".into(),
      command: "NOOP".into(),
      payload: Vec::new(),
      write: true,
      result: None,
      session: Arc::new(Session::new(1)),
      upstream: socket.clone(),
      downstream: socket,
      detach_client: Vec::new(),
      detach_server: Vec::new(),
    }
  }

  #[test]
  fn listeners_fire_in_registration_order() {
    let mut bus = EventBus::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second", "third"] {
      let order = Arc::clone(&order);
      bus.on("NOOP", move |_: &mut Event| {
        order.lock().unwrap().push(tag);
        Ok(())
      });
    }
    bus.emit("NOOP", &mut fake_event());
    assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
  }

  #[test]
  fn once_listener_runs_a_single_time() {
    let mut bus = EventBus::new();
    let calls = Arc::new(atomic::AtomicUsize::new(0));
    let counted = Arc::clone(&calls);
    bus.once("NOOP", move |_: &mut Event| {
      counted.fetch_add(1, atomic::Ordering::SeqCst);
      Ok(())
    });
    bus.emit("NOOP", &mut fake_event());
    bus.emit("NOOP", &mut fake_event());
    assert_eq!(calls.load(atomic::Ordering::SeqCst), 1);
  }

  #[test]
  fn a_failing_listener_does_not_block_its_siblings() {
    let mut bus = EventBus::new();
    let ran = Arc::new(atomic::AtomicBool::new(false));
    bus.on("NOOP", |_: &mut Event| anyhow::bail!("boom"));
    let flagged = Arc::clone(&ran);
    bus.on("NOOP", move |_: &mut Event| {
      flagged.store(true, atomic::Ordering::SeqCst);
      Ok(())
    });
    bus.emit("NOOP", &mut fake_event());
    assert!(ran.load(atomic::Ordering::SeqCst));
  }

  #[test]
  fn off_all_removes_every_listener_for_a_name() {
    let mut bus = EventBus::new();
    bus.on("LIST", |_: &mut Event| Ok(()));
    bus.on("LIST", |_: &mut Event| Ok(()));
    assert_eq!(bus.listener_count("LIST"), 2);
    bus.off_all("LIST");
    assert_eq!(bus.listener_count("LIST"), 0);
  }
}
