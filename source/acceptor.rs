// Binds the listening socket, accepts connections, and spins up a Mediator for each one. One
// Acceptor runs per worker process; see supervisor.rs for how multiple workers share a port.

use crate::{config::Config, mediator, net, plugins, session};
use anyhow::Context as _;
use std::{
  io,
  net::{SocketAddr, TcpListener, TcpStream},
  sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc, Mutex,
  },
  thread, time,
};

const SHUTDOWN_GRACE_PERIOD: time::Duration = time::Duration::from_secs(10);

/// Binds with `SO_REUSEPORT` so that a pre-fork worker pool (see supervisor.rs) can have every
/// worker bind the same port independently and let the kernel load-balance accepts between them.
pub fn bind(port: u16) -> anyhow::Result<TcpListener> {
  let address: SocketAddr = ([0, 0, 0, 0], port).into();
  let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
    .context("creating the listening socket")?;
  socket.set_reuse_address(true)?;
  socket.set_reuse_port(true)?;
  socket.bind(&address.into()).with_context(|| format!("binding port {port}"))?;
  socket.listen(1024)?;
  Ok(socket.into())
}

fn drop_privileges(config: &Config) -> anyhow::Result<()> {
  if let Some(gid) = config.user_gid {
    nix::unistd::setgid(nix::unistd::Gid::from_raw(gid)).context("dropping group privileges")?;
  }
  if let Some(uid) = config.user_uid {
    nix::unistd::setuid(nix::unistd::Uid::from_raw(uid)).context("dropping user privileges")?;
  }
  Ok(())
}

/// Runs the accept loop on an already-bound listener until a SIGINT/SIGTERM is received, then
/// stops accepting and waits up to `SHUTDOWN_GRACE_PERIOD` for open connections to finish on
/// their own before returning.
pub fn run(config: &Config, listener: TcpListener) -> anyhow::Result<()> {
  let tls_material = if config.ssl {
    let cert = config.ssl_cert.as_deref().context("--ssl-cert is required with --ssl")?;
    let key = config.ssl_key.as_deref().context("--ssl-key is required with --ssl")?;
    Some(Arc::new(net::load_tls_material(cert, key, config.ssl_ca.as_deref())?))
  } else {
    None
  };

  drop_privileges(config)?;

  let plugins: Arc<Vec<Box<dyn plugins::Plugin>>> = Arc::new(plugins::load_all(&config.plugins_dir));
  let open_connections = Arc::new(AtomicI64::new(0));
  let keep_alive = config.keep_alive_duration();

  let shutting_down = Arc::new(AtomicBool::new(false));
  signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutting_down))
    .context("registering SIGINT handler")?;
  signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutting_down))
    .context("registering SIGTERM handler")?;

  listener.set_nonblocking(true)?;
  loop {
    if shutting_down.load(Ordering::Relaxed) {
      log::info!("shutdown signal received, no longer accepting connections");
      break;
    }
    match listener.accept() {
      Ok((stream, peer)) => {
        let config = config.clone();
        let plugins = Arc::clone(&plugins);
        let tls_material = tls_material.clone();
        let open_connections = Arc::clone(&open_connections);
        thread::spawn(move || {
          if let Err(error) = handle_connection(&config, stream, peer, &plugins, tls_material.as_deref(), &open_connections, keep_alive) {
            log::warn!("connection from {peer}: {error:#}");
          }
        });
      }
      Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
        thread::sleep(net::LOCK_POLL_INTERVAL);
      }
      Err(error) => return Err(error).context("accepting a connection"),
    }
  }

  wait_for_drain(&open_connections, SHUTDOWN_GRACE_PERIOD);
  Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_connection(
  config: &Config,
  tcp: TcpStream,
  peer: SocketAddr,
  plugins: &[Box<dyn plugins::Plugin>],
  tls_material: Option<&net::TlsMaterial>,
  open_connections: &Arc<AtomicI64>,
  keep_alive: Option<time::Duration>,
) -> anyhow::Result<()> {
  tcp.set_nonblocking(false)?;
  net::apply_read_timeout(&tcp)?;
  let (downstream, downstream_tls_summary) = match tls_material {
    Some(material) => net::accept_tls(tcp, material)?,
    None => (Box::new(tcp) as Box<dyn net::ReadWrite>, None),
  };

  let url = net::UpstreamUrl::parse(&config.imap_server)?;
  let (upstream, upstream_tls_summary) = net::connect_upstream(&url, config.tls_nocheck_certs, keep_alive)?;

  let opened = open_connections.fetch_add(1, Ordering::SeqCst) + 1;
  if config.connection_log {
    log::info!("Connection established from {peer}; open connections: {opened}");
  }
  if let Some(summary) = downstream_tls_summary {
    log::info!("Downstream using {summary}");
  }
  if let Some(summary) = upstream_tls_summary {
    log::info!("Upstream using {summary}");
  }

  let connection = mediator::Connection {
    session: Arc::new(session::Session::new(session::next_session_id())),
    downstream: Arc::new(Mutex::new(downstream)),
    upstream: Arc::new(Mutex::new(upstream)),
    upstream_host: format!("{}:{}", url.host, url.port),
  };
  mediator::run(connection, plugins, Arc::clone(open_connections), net::DEFAULT_IDLE_TIMEOUT, config.connection_log);
  Ok(())
}

fn wait_for_drain(open_connections: &AtomicI64, grace_period: time::Duration) {
  let deadline = time::Instant::now() + grace_period;
  while open_connections.load(Ordering::SeqCst) > 0 && time::Instant::now() < deadline {
    thread::sleep(time::Duration::from_millis(100));
  }
  let remaining = open_connections.load(Ordering::SeqCst);
  if remaining > 0 {
    log::warn!("{remaining} connection(s) still open after the shutdown grace period, exiting anyway");
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bind_picks_an_ephemeral_port_and_can_be_rebound_with_reuseport() {
    let port = portpicker::pick_unused_port().expect("a free port");
    let first = bind(port).unwrap();
    // SO_REUSEPORT lets a second worker bind the very same port, which plain TcpListener::bind
    // would refuse with "address already in use".
    let second = bind(port);
    drop(first);
    assert!(second.is_ok());
  }

  #[test]
  fn drain_returns_once_the_counter_reaches_zero() {
    let open_connections = AtomicI64::new(0);
    wait_for_drain(&open_connections, time::Duration::from_secs(5));
  }
}
