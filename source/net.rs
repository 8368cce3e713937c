use anyhow::Context as _;
use std::{
  fs, io, io::Write as _, net, path, sync,
  sync::{Arc, Mutex},
  time,
};

/// A socket half that both directions of a session may need to read or write: the plain TCP
/// connection, or a TLS stream wrapping one. Reading is only ever done by the thread that owns a
/// given direction; writing is shared (the folder filter plugin injects auxiliary requests
/// upstream from the server-reading thread), hence the `SharedSocket` alias below.
pub trait ReadWrite: io::Read + io::Write + Send {
  fn shutdown(&mut self);
}

pub type SharedSocket = Arc<Mutex<Box<dyn ReadWrite>>>;

/// Read timeout applied to every socket purely so a blocked reader periodically releases the
/// shared write lock and notices a peer-driven shutdown; unrelated to the user-facing idle
/// timeout below.
pub const LOCK_POLL_INTERVAL: time::Duration = time::Duration::from_millis(200);

/// How long a session may go without receiving a byte from upstream before it is torn down. Not
/// configurable, unlike `keep_alive`, which only controls TCP-level probes.
pub const DEFAULT_IDLE_TIMEOUT: time::Duration = time::Duration::from_secs(30 * 60);

pub fn is_timeout(error: &io::Error) -> bool {
  matches!(error.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

impl ReadWrite for net::TcpStream {
  fn shutdown(&mut self) {
    let _ = net::TcpStream::shutdown(self, net::Shutdown::Both);
  }
}

pub fn apply_read_timeout(stream: &net::TcpStream) -> io::Result<()> {
  stream.set_read_timeout(Some(LOCK_POLL_INTERVAL))
}

pub fn apply_keep_alive(stream: &net::TcpStream, interval: time::Duration) -> anyhow::Result<()> {
  let socket = socket2::SockRef::from(stream);
  let keepalive = socket2::TcpKeepalive::new()
    .with_time(interval)
    .with_interval(interval);
  socket.set_tcp_keepalive(&keepalive)?;
  Ok(())
}

#[ouroboros::self_referencing]
pub struct UpstreamTlsStream {
  tcp: net::TcpStream,
  connection: rustls::ClientConnection,
  #[borrows(mut tcp, mut connection)]
  #[covariant]
  stream: rustls::Stream<'this, rustls::ClientConnection, net::TcpStream>,
}

impl io::Read for UpstreamTlsStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.stream.read(buf))
  }
}

impl io::Write for UpstreamTlsStream {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.stream.write(buf))
  }

  fn flush(&mut self) -> io::Result<()> {
    self.with_mut(|fields| fields.stream.flush())
  }
}

impl ReadWrite for UpstreamTlsStream {
  fn shutdown(&mut self) {
    self.with_mut(|fields| {
      let _ = net::TcpStream::shutdown(fields.stream.sock, net::Shutdown::Both);
    });
  }
}

impl UpstreamTlsStream {
  fn negotiated_summary(&mut self) -> Option<String> {
    self.with_mut(|fields| {
      fields
        .stream
        .conn
        .negotiated_cipher_suite()
        .map(|suite| format!("{:?} ; {:?}", suite.suite(), fields.stream.conn.protocol_version()))
    })
  }
}

#[ouroboros::self_referencing]
pub struct DownstreamTlsStream {
  tcp: net::TcpStream,
  connection: rustls::ServerConnection,
  #[borrows(mut tcp, mut connection)]
  #[covariant]
  stream: rustls::Stream<'this, rustls::ServerConnection, net::TcpStream>,
}

impl io::Read for DownstreamTlsStream {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.stream.read(buf))
  }
}

impl io::Write for DownstreamTlsStream {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.with_mut(|fields| fields.stream.write(buf))
  }

  fn flush(&mut self) -> io::Result<()> {
    self.with_mut(|fields| fields.stream.flush())
  }
}

impl ReadWrite for DownstreamTlsStream {
  fn shutdown(&mut self) {
    self.with_mut(|fields| {
      let _ = net::TcpStream::shutdown(fields.stream.sock, net::Shutdown::Both);
    });
  }
}

impl DownstreamTlsStream {
  fn negotiated_summary(&mut self) -> Option<String> {
    self.with_mut(|fields| {
      fields
        .stream
        .conn
        .negotiated_cipher_suite()
        .map(|suite| format!("{:?} ; {:?}", suite.suite(), fields.stream.conn.protocol_version()))
    })
  }
}

pub struct UpstreamUrl {
  pub tls: bool,
  pub host: String,
  pub port: u16,
}

impl UpstreamUrl {
  pub fn parse(raw: &str) -> anyhow::Result<Self> {
    let (scheme, rest) = raw
      .split_once("://")
      .with_context(|| format!("{raw:?} is not a URL of the form scheme://host:port"))?;
    anyhow::ensure!(
      matches!(scheme, "imap" | "imaps" | "tls" | "ssl"),
      "unsupported upstream scheme {scheme:?}"
    );
    let tls = matches!(scheme, "imaps" | "tls" | "ssl");
    let default_port = if tls { 993 } else { 143 };
    let rest = rest.trim_end_matches('/');
    let (host, port) = match rest.rsplit_once(':') {
      Some((host, port)) if !host.is_empty() => {
        (host.to_string(), port.parse().unwrap_or(default_port))
      }
      _ => (rest.to_string(), default_port),
    };
    Ok(Self { tls, host, port })
  }
}

struct NoCertificateVerification;

impl rustls::client::ServerCertVerifier for NoCertificateVerification {
  fn verify_server_cert(
    &self,
    _end_entity: &rustls::Certificate,
    _intermediates: &[rustls::Certificate],
    _server_name: &rustls::ServerName,
    _scts: &mut dyn Iterator<Item = &[u8]>,
    _ocsp_response: &[u8],
    _now: time::SystemTime,
  ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::ServerCertVerified::assertion())
  }
}

/// Connects to the configured upstream, performing a TLS handshake when the URL scheme calls for
/// one. `nocheck_certs` disables upstream certificate verification entirely.
pub fn connect_upstream(
  url: &UpstreamUrl,
  nocheck_certs: bool,
  keep_alive: Option<time::Duration>,
) -> anyhow::Result<(Box<dyn ReadWrite>, Option<String>)> {
  let address = (url.host.as_str(), url.port)
    .to_socket_addrs_first()
    .with_context(|| format!("couldn't resolve {}:{}", url.host, url.port))?;
  let tcp = net::TcpStream::connect(address)
    .with_context(|| format!("connecting to {}:{}", url.host, url.port))?;
  if let Some(interval) = keep_alive {
    apply_keep_alive(&tcp, interval)?;
  }
  apply_read_timeout(&tcp)?;

  if !url.tls {
    return Ok((Box::new(tcp), None));
  }

  let mut roots = rustls::RootCertStore::empty();
  for certificate in rustls_native_certs::load_native_certs()? {
    roots.add(&rustls::Certificate(certificate.0))?;
  }
  let mut config = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();
  if nocheck_certs {
    config
      .dangerous()
      .set_certificate_verifier(sync::Arc::new(NoCertificateVerification));
  }
  let connection = rustls::ClientConnection::new(
    sync::Arc::new(config),
    url
      .host
      .as_str()
      .try_into()
      .with_context(|| format!("{:?} is not a valid server name", url.host))?,
  )?;
  let mut stream = UpstreamTlsStreamBuilder {
    tcp,
    connection,
    stream_builder: |tcp, connection| rustls::Stream::new(connection, tcp),
  }
  .build();
  // Force the handshake so the negotiated parameters are available immediately.
  stream.flush()?;
  let summary = stream.negotiated_summary();
  Ok((Box::new(stream), summary))
}

trait ResolveFirst {
  fn to_socket_addrs_first(&self) -> io::Result<net::SocketAddr>;
}

impl<T: net::ToSocketAddrs> ResolveFirst for T {
  fn to_socket_addrs_first(&self) -> io::Result<net::SocketAddr> {
    self
      .to_socket_addrs()?
      .next()
      .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses resolved"))
  }
}

pub struct TlsMaterial {
  pub certs: Vec<rustls::Certificate>,
  pub key: rustls::PrivateKey,
  pub client_ca: Option<rustls::RootCertStore>,
}

fn load_certs(path: &path::Path) -> anyhow::Result<Vec<rustls::Certificate>> {
  let mut reader = io::BufReader::new(
    fs::File::open(path).with_context(|| format!("opening {path:?}"))?,
  );
  let raw = rustls_pemfile::certs(&mut reader)
    .with_context(|| format!("parsing certificates from {path:?}"))?;
  Ok(raw.into_iter().map(rustls::Certificate).collect())
}

fn load_private_key(path: &path::Path) -> anyhow::Result<rustls::PrivateKey> {
  let mut reader = io::BufReader::new(fs::File::open(path)?);
  let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
  if keys.is_empty() {
    let mut reader = io::BufReader::new(fs::File::open(path)?);
    keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
  }
  let key = keys
    .into_iter()
    .next()
    .with_context(|| format!("no private key found in {path:?}"))?;
  Ok(rustls::PrivateKey(key))
}

pub fn load_tls_material(
  cert: &path::Path,
  key: &path::Path,
  ca: Option<&path::Path>,
) -> anyhow::Result<TlsMaterial> {
  let certs = load_certs(cert)?;
  let key = load_private_key(key)?;
  let client_ca = match ca {
    Some(path) => {
      let mut store = rustls::RootCertStore::empty();
      for certificate in load_certs(path)? {
        store.add(&certificate)?;
      }
      Some(store)
    }
    None => None,
  };
  Ok(TlsMaterial { certs, key, client_ca })
}

/// Wraps an already-accepted TCP connection in a TLS server handshake, optionally requiring and
/// verifying a client certificate against `material.client_ca` (mutual TLS).
pub fn accept_tls(
  tcp: net::TcpStream,
  material: &TlsMaterial,
) -> anyhow::Result<(Box<dyn ReadWrite>, Option<String>)> {
  apply_read_timeout(&tcp)?;
  let builder = rustls::ServerConfig::builder().with_safe_defaults();
  let config = match &material.client_ca {
    Some(store) => builder
      .with_client_cert_verifier(rustls::server::AllowAnyAuthenticatedClient::new(store.clone()))
      .with_single_cert(material.certs.clone(), material.key.clone())?,
    None => builder
      .with_no_client_auth()
      .with_single_cert(material.certs.clone(), material.key.clone())?,
  };
  let connection = rustls::ServerConnection::new(sync::Arc::new(config))?;
  let mut stream = DownstreamTlsStreamBuilder {
    tcp,
    connection,
    stream_builder: |tcp, connection| rustls::Stream::new(connection, tcp),
  }
  .build();
  stream.flush()?;
  let summary = stream.negotiated_summary();
  Ok((Box::new(stream), summary))
}

/// Lets tests build a `SharedSocket` around an in-memory buffer instead of a real TCP connection.
#[cfg(test)]
impl ReadWrite for io::Cursor<Vec<u8>> {
  fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_plain_url_with_default_port() {
    let url = UpstreamUrl::parse("imap://mail.example.com").unwrap();
    assert!(!url.tls);
    assert_eq!(url.host, "mail.example.com");
    assert_eq!(url.port, 143);
  }

  #[test]
  fn parses_tls_url_with_explicit_port() {
    let url = UpstreamUrl::parse("imaps://mail.example.com:9993").unwrap();
    assert!(url.tls);
    assert_eq!(url.port, 9993);
  }

  #[test]
  fn rejects_unsupported_schemes() {
    assert!(UpstreamUrl::parse("http://mail.example.com").is_err());
  }

  #[test]
  fn ssl_and_tls_schemes_both_imply_tls() {
    assert!(UpstreamUrl::parse("tls://h:1").unwrap().tls);
    assert!(UpstreamUrl::parse("ssl://h:1").unwrap().tls);
  }

  /// Generates a throwaway self-signed certificate, serves it with `accept_tls`, and dials it
  /// with `connect_upstream` (certificate checking disabled, since the cert isn't CA-signed) to
  /// exercise the listener and upstream TLS paths against each other end to end.
  #[test]
  fn accept_tls_and_connect_upstream_interoperate() {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cert_path = dir.path().join("cert.pem");
    let key_path = dir.path().join("key.pem");
    fs::write(&cert_path, certified.cert.pem()).unwrap();
    fs::write(&key_path, certified.key_pair.serialize_pem()).unwrap();

    let material = load_tls_material(&cert_path, &key_path, None).unwrap();
    let listener = net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = std::thread::spawn(move || {
      let (tcp, _) = listener.accept().unwrap();
      let (mut stream, _) = accept_tls(tcp, &material).unwrap();
      let mut buf = [0u8; 5];
      stream.read_exact(&mut buf).unwrap();
      assert_eq!(&buf, b"hello");
      stream.write_all(b"world").unwrap();
    });

    let url = UpstreamUrl::parse(&format!("imaps://127.0.0.1:{port}")).unwrap();
    let (mut client, summary) = connect_upstream(&url, true, None).unwrap();
    assert!(summary.is_some());
    client.write_all(b"hello").unwrap();
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"world");

    server.join().unwrap();
  }
}
