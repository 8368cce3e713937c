// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc5464 - IMAP METADATA Extension
// https://tools.ietf.org/id/draft-daboo-imap-annotatemore-07.txt - ANNOTATEMORE (Cyrus/Kolab)

pub mod acceptor;
pub mod bus;
pub mod config;
pub mod framer;
pub mod mediator;
pub mod metadata;
pub mod net;
pub mod plugins;
pub mod session;
pub mod supervisor;
pub mod tokenizer;

use config::Config;

/// Library entry point. Dispatches to one of three run modes depending on how the process was
/// invoked: a re-exec'd worker, a supervisor spawning a worker pool, or a single process running
/// the accept loop directly (`--workers 0`, the default).
pub fn run(config: &Config) -> anyhow::Result<()> {
  if supervisor::worker_id().is_some() {
    return supervisor::run_worker(config);
  }
  if config.workers > 0 {
    return supervisor::run_supervisor(config);
  }
  let listener = acceptor::bind(config.bind_port)?;
  acceptor::run(config, listener)
}
