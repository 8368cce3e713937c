// Pumps bytes between a client and its matching upstream connection, framing each direction into
// commands and running them through the client/server event buses. Two threads cooperate per
// connection, one per byte direction; see Design Notes for why a single-threaded callback loop
// over blocking sockets isn't used here.

use crate::{
  bus::{Event, EventBus},
  framer,
  net::{self, SharedSocket},
  plugins::Plugin,
  session::Session,
};
use std::{
  io::{Read as _, Write as _},
  sync::{
    atomic::{AtomicI64, Ordering},
    Arc, Mutex,
  },
  thread, time,
};

const READ_CHUNK: usize = 8192;

pub struct Connection {
  pub session: Arc<Session>,
  pub downstream: SharedSocket,
  pub upstream: SharedSocket,
  pub upstream_host: String,
}

/// Runs one connection to completion: registers every plugin's listeners, publishes the
/// `__CONNECT__` handshake events, then pumps both directions until either side closes. Blocks
/// until both direction threads have exited.
pub fn run(
  connection: Connection,
  plugins: &[Box<dyn Plugin>],
  open_connections: Arc<AtomicI64>,
  idle_timeout: time::Duration,
  connection_log: bool,
) {
  let Connection {
    session,
    downstream,
    upstream,
    upstream_host,
  } = connection;

  let mut client_bus = EventBus::new();
  let mut server_bus = EventBus::new();
  for plugin in plugins {
    plugin.register(&session, &mut client_bus, &mut server_bus);
  }
  let client_bus = Arc::new(Mutex::new(client_bus));
  let server_bus = Arc::new(Mutex::new(server_bus));

  {
    let mut event = side_channel_event(&session, &upstream, &downstream, "__CONNECT__");
    client_bus.lock().unwrap().emit("__CONNECT__", &mut event);
  }
  {
    let mut event = side_channel_event(&session, &upstream, &downstream, "__CONNECT__");
    server_bus.lock().unwrap().emit("__CONNECT__", &mut event);
  }

  let downstream_thread = thread::spawn({
    let session = Arc::clone(&session);
    let downstream = Arc::clone(&downstream);
    let upstream = Arc::clone(&upstream);
    let client_bus = Arc::clone(&client_bus);
    let server_bus = Arc::clone(&server_bus);
    let open_connections = Arc::clone(&open_connections);
    move || {
      pump_client_to_server(
        &session,
        &downstream,
        &upstream,
        &client_bus,
        &server_bus,
        &open_connections,
        connection_log,
      );
    }
  });

  let upstream_thread = thread::spawn({
    let session = Arc::clone(&session);
    move || {
      pump_server_to_client(
        &session,
        &downstream,
        &upstream,
        &client_bus,
        &server_bus,
        &open_connections,
        idle_timeout,
        connection_log,
        &upstream_host,
      );
    }
  });

  let _ = downstream_thread.join();
  let _ = upstream_thread.join();
}

fn side_channel_event(session: &Arc<Session>, upstream: &SharedSocket, downstream: &SharedSocket, command: &str) -> Event {
  Event {
    seq: "0".to_string(),
    command: command.to_string(),
    payload: Vec::new(),
    write: true,
    result: None,
    session: Arc::clone(session),
    upstream: Arc::clone(upstream),
    downstream: Arc::clone(downstream),
    detach_client: Vec::new(),
    detach_server: Vec::new(),
  }
}

fn build_event(
  session: &Arc<Session>,
  upstream: &SharedSocket,
  downstream: &SharedSocket,
  descriptor: framer::CommandDescriptor,
) -> Event {
  Event {
    seq: descriptor.seq,
    command: descriptor.command,
    payload: descriptor.payload,
    write: descriptor.write,
    result: None,
    session: Arc::clone(session),
    upstream: Arc::clone(upstream),
    downstream: Arc::clone(downstream),
    detach_client: Vec::new(),
    detach_server: Vec::new(),
  }
}

/// Runs the command name, then `__DATA__` (unless it already is the command), then
/// `__POSTDATA__`, on `bus`, in order, against the same event.
fn publish_three(bus: &Mutex<EventBus>, event: &mut Event) {
  let command = event.command.clone();
  bus.lock().unwrap().emit(&command, event);
  if command != "__DATA__" {
    bus.lock().unwrap().emit("__DATA__", event);
  }
  bus.lock().unwrap().emit("__POSTDATA__", event);
}

fn drain_detachments(client_bus: &Mutex<EventBus>, server_bus: &Mutex<EventBus>, event: &mut Event) {
  for name in event.detach_client.drain(..) {
    client_bus.lock().unwrap().off_all(&name);
  }
  for name in event.detach_server.drain(..) {
    server_bus.lock().unwrap().off_all(&name);
  }
}

fn forward(target: &SharedSocket, event: &Event) {
  let bytes: &[u8] = match (&event.result, event.write) {
    (Some(result), _) => result,
    (None, true) => &event.payload,
    (None, false) => return,
  };
  if bytes.is_empty() {
    return;
  }
  let mut socket = target.lock().unwrap();
  if let Err(error) = socket.write_all(bytes) {
    log::warn!("write failed: {error}");
  }
}

/// Flips `session.connected` from true to false exactly once (whichever direction notices the
/// close first wins the race) and performs teardown only on that winning call.
fn teardown(
  session: &Arc<Session>,
  downstream: &SharedSocket,
  upstream: &SharedSocket,
  client_bus: &Mutex<EventBus>,
  server_bus: &Mutex<EventBus>,
  open_connections: &AtomicI64,
  connection_log: bool,
  reason: &str,
) {
  let first_to_notice = session
    .connected
    .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
    .is_ok();
  if !first_to_notice {
    return;
  }
  downstream.lock().unwrap().shutdown();
  upstream.lock().unwrap().shutdown();
  let remaining = open_connections.fetch_sub(1, Ordering::SeqCst) - 1;
  if connection_log {
    log::info!("{reason}; open connections: {remaining}");
  }
  let mut event = side_channel_event(session, upstream, downstream, "__DISCONNECT__");
  client_bus.lock().unwrap().emit("__DISCONNECT__", &mut event);
  server_bus.lock().unwrap().emit("__DISCONNECT__", &mut event);
}

fn pump_client_to_server(
  session: &Arc<Session>,
  downstream: &SharedSocket,
  upstream: &SharedSocket,
  client_bus: &Mutex<EventBus>,
  server_bus: &Mutex<EventBus>,
  open_connections: &AtomicI64,
  connection_log: bool,
) {
  let mut buf = vec![0u8; READ_CHUNK];
  let mut carry: Vec<u8> = Vec::new();

  loop {
    if !session.connected.load(Ordering::Acquire) {
      return;
    }
    let read = {
      let mut socket = downstream.lock().unwrap();
      socket.read(&mut buf)
    };
    match read {
      Ok(0) => {
        teardown(
          session, downstream, upstream, client_bus, server_bus, open_connections, connection_log,
          "Client connection closed",
        );
        return;
      }
      Ok(n) => {
        let mut chunk = if carry.is_empty() {
          buf[..n].to_vec()
        } else {
          let mut combined = std::mem::take(&mut carry);
          combined.extend_from_slice(&buf[..n]);
          combined
        };
        loop {
          let result = framer::frame_client(&chunk);
          if !result.descriptor.write {
            carry = result.descriptor.payload;
            break;
          }
          let mut event = build_event(session, upstream, downstream, result.descriptor);
          publish_three(client_bus, &mut event);
          drain_detachments(client_bus, server_bus, &mut event);
          forward(upstream, &event);
          match result.remainder {
            Some(remainder) => chunk = remainder,
            None => break,
          }
        }
      }
      Err(error) if net::is_timeout(&error) => continue,
      Err(error) => {
        log::warn!("session {}: client read error: {error}", session.id);
        teardown(
          session, downstream, upstream, client_bus, server_bus, open_connections, connection_log,
          "Client connection error",
        );
        return;
      }
    }
  }
}

#[allow(clippy::too_many_arguments)]
fn pump_server_to_client(
  session: &Arc<Session>,
  downstream: &SharedSocket,
  upstream: &SharedSocket,
  client_bus: &Mutex<EventBus>,
  server_bus: &Mutex<EventBus>,
  open_connections: &AtomicI64,
  idle_timeout: time::Duration,
  connection_log: bool,
  upstream_host: &str,
) {
  let mut buf = vec![0u8; READ_CHUNK];
  let mut last_activity = time::Instant::now();

  loop {
    if !session.connected.load(Ordering::Acquire) {
      return;
    }
    let read = {
      let mut socket = upstream.lock().unwrap();
      socket.read(&mut buf)
    };
    match read {
      Ok(0) => {
        teardown(
          session,
          downstream,
          upstream,
          client_bus,
          server_bus,
          open_connections,
          connection_log,
          &format!("Disconnected from {upstream_host}"),
        );
        return;
      }
      Ok(n) => {
        last_activity = time::Instant::now();
        let descriptor = framer::frame_server(&buf[..n]);
        let mut event = build_event(session, upstream, downstream, descriptor);
        publish_three(server_bus, &mut event);
        drain_detachments(client_bus, server_bus, &mut event);
        forward(downstream, &event);
      }
      Err(error) if net::is_timeout(&error) => {
        if last_activity.elapsed() > idle_timeout {
          log::warn!("session {} idle for over {idle_timeout:?}, closing", session.id);
          teardown(
            session, downstream, upstream, client_bus, server_bus, open_connections, connection_log,
            "Idle timeout",
          );
          return;
        }
      }
      Err(error) => {
        log::warn!("session {}: upstream read error: {error}", session.id);
        teardown(
          session, downstream, upstream, client_bus, server_bus, open_connections, connection_log,
          "Upstream connection error",
        );
        return;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::plugins::Plugin;
  use std::io::{self, Cursor};

  struct Echo;
  impl Plugin for Echo {
    fn name(&self) -> &str {
      "echo"
    }
    fn register(&self, _session: &Arc<Session>, client_bus: &mut EventBus, _server_bus: &mut EventBus) {
      client_bus.on("NOOP", |event: &mut Event| {
        event.result = Some(b"rewritten".to_vec());
        Ok(())
      });
    }
  }

  fn socket_around(bytes: &[u8]) -> SharedSocket {
    Arc::new(Mutex::new(Box::new(Cursor::new(bytes.to_vec()))))
  }

  /// A sink that records every byte written to it, so tests can assert on what `forward` sent
  /// without having to downcast the trait object it was given.
  #[derive(Default)]
  struct RecordingSink(Arc<Mutex<Vec<u8>>>);

  impl io::Read for RecordingSink {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
      Ok(0)
    }
  }
  impl io::Write for RecordingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      self.0.lock().unwrap().extend_from_slice(buf);
      Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
      Ok(())
    }
  }
  impl net::ReadWrite for RecordingSink {
    fn shutdown(&mut self) {}
  }

  #[test]
  fn a_listener_rewrite_is_forwarded_instead_of_the_original_bytes() {
    let session = Arc::new(Session::new(1));
    let mut client_bus = EventBus::new();
    let server_bus = EventBus::new();
    Echo.register(&session, &mut client_bus, &mut EventBus::new());
    let client_bus = Mutex::new(client_bus);
    let server_bus = Mutex::new(server_bus);

    let written = Arc::new(Mutex::new(Vec::new()));
    let upstream: SharedSocket = Arc::new(Mutex::new(Box::new(RecordingSink(Arc::clone(&written)))));
    let downstream = socket_around(b"");
    let descriptor = framer::classify(b"a1 NOOP\r\n", true);
    let mut event = build_event(&session, &upstream, &downstream, descriptor);
    publish_three(&client_bus, &mut event);
    drain_detachments(&client_bus, &server_bus, &mut event);
    forward(&upstream, &event);

    assert_eq!(&*written.lock().unwrap(), b"rewritten");
  }

  #[test]
  fn teardown_runs_exactly_once_across_a_race() {
    let session = Arc::new(Session::new(1));
    let client_bus = Mutex::new(EventBus::new());
    let server_bus = Mutex::new(EventBus::new());
    let downstream = socket_around(b"");
    let upstream = socket_around(b"");
    let open_connections = AtomicI64::new(1);

    teardown(&session, &downstream, &upstream, &client_bus, &server_bus, &open_connections, false, "first");
    teardown(&session, &downstream, &upstream, &client_bus, &server_bus, &open_connections, false, "second");

    assert_eq!(open_connections.load(Ordering::SeqCst), 0);
  }
}
