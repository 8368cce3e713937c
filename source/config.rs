use std::path;

#[derive(clap::Args, Debug, Clone)]
#[group(skip)]
pub struct Config {
  #[arg(long = "imap-server", help = "Upstream URL, e.g. imaps://mail.example.com:993")]
  pub imap_server: String,
  #[arg(long = "bind-port", help = "Local TCP port to listen on")]
  pub bind_port: u16,

  #[arg(long = "ssl", help = "Listen with TLS", default_value_t = false)]
  pub ssl: bool,
  #[arg(long = "ssl-key", help = "Path to the listener's TLS private key")]
  pub ssl_key: Option<path::PathBuf>,
  #[arg(long = "ssl-cert", help = "Path to the listener's TLS certificate chain")]
  pub ssl_cert: Option<path::PathBuf>,
  #[arg(long = "ssl-ca", help = "Path to a CA bundle; enables mutual TLS when set")]
  pub ssl_ca: Option<path::PathBuf>,

  #[arg(long = "tls-nocheck-certs", help = "Do not verify the upstream certificate", default_value_t = false)]
  pub tls_nocheck_certs: bool,
  #[arg(long = "keep-alive", help = "Seconds between upstream TCP keepalive probes (0 = off)", default_value_t = 0)]
  pub keep_alive: u64,

  #[arg(long = "workers", help = "Pre-fork this many worker processes (0 = run in this process)", default_value_t = 0)]
  pub workers: u16,

  #[arg(long = "connection-log", help = "Emit per-connection lifecycle log lines", default_value_t = true)]
  pub connection_log: bool,
  #[arg(long = "use-colors", help = "Prefix log lines with an ANSI color code", default_value_t = false)]
  pub use_colors: bool,

  #[arg(long = "user-uid", help = "Drop to this UID after binding")]
  pub user_uid: Option<u32>,
  #[arg(long = "user-gid", help = "Drop to this GID after binding")]
  pub user_gid: Option<u32>,

  #[arg(long = "plugins-dir", help = "Directory of dynamic-library plugins to load", default_value_os_t = path::PathBuf::from("/etc/imaproxy/plugins"))]
  pub plugins_dir: path::PathBuf,

  #[arg(long = "log-directory", help = "Also log to a rolling file in this directory")]
  pub log_directory: Option<path::PathBuf>,

  #[clap(flatten)]
  pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,
}

impl Config {
  pub fn keep_alive_duration(&self) -> Option<std::time::Duration> {
    (self.keep_alive > 0).then(|| std::time::Duration::from_secs(self.keep_alive))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use clap::Parser as _;

  #[derive(clap::Parser)]
  struct Wrapper {
    #[clap(flatten)]
    config: Config,
  }

  #[test]
  fn parses_minimal_arguments() {
    let wrapper = Wrapper::parse_from(["imaproxy", "--imap-server", "imaps://mail:993", "--bind-port", "1143"]);
    assert_eq!(wrapper.config.imap_server, "imaps://mail:993");
    assert_eq!(wrapper.config.bind_port, 1143);
    assert_eq!(wrapper.config.workers, 0);
    assert!(wrapper.config.keep_alive_duration().is_none());
  }

  #[test]
  fn keep_alive_zero_disables_probes() {
    let wrapper = Wrapper::parse_from([
      "imaproxy",
      "--imap-server",
      "imap://mail:143",
      "--bind-port",
      "1143",
      "--keep-alive",
      "30",
    ]);
    assert_eq!(wrapper.config.keep_alive_duration(), Some(std::time::Duration::from_secs(30)));
  }
}
