// Pre-fork worker pool. The supervisor process re-execs itself once per worker with
// IMAPROXY_WORKER_ID set; each worker binds the listening port independently via SO_REUSEPORT
// (see acceptor::bind) and the kernel spreads incoming connections across them.

use crate::{acceptor, config::Config};
use anyhow::Context as _;
use std::{env, path, process, thread, time};

const WORKER_ID_VAR: &str = "IMAPROXY_WORKER_ID";
const CRASH_BUDGET: u32 = 10;
const POLL_INTERVAL: time::Duration = time::Duration::from_millis(500);

/// This process's worker index, if it was re-exec'd by `run_supervisor`; `None` for the original
/// process invoked by the user.
pub fn worker_id() -> Option<u16> {
  env::var(WORKER_ID_VAR).ok()?.parse().ok()
}

/// Binds this worker's listener and runs the accept loop until shutdown.
pub fn run_worker(config: &Config) -> anyhow::Result<()> {
  let listener = acceptor::bind(config.bind_port)?;
  acceptor::run(config, listener)
}

struct Worker {
  id: u16,
  child: process::Child,
  restarts: u32,
}

fn spawn_worker(executable: &path::Path, id: u16) -> anyhow::Result<process::Child> {
  process::Command::new(executable)
    .env(WORKER_ID_VAR, id.to_string())
    .args(env::args().skip(1))
    .spawn()
    .with_context(|| format!("spawning worker {id}"))
}

/// Spawns `config.workers` worker processes and restarts any that exit, up to `CRASH_BUDGET`
/// restarts per worker. Returns once every worker has exhausted its budget.
pub fn run_supervisor(config: &Config) -> anyhow::Result<()> {
  let executable = env::current_exe().context("resolving the current executable")?;
  let mut workers: Vec<Worker> = (0..config.workers)
    .map(|id| {
      Ok(Worker {
        id,
        child: spawn_worker(&executable, id)?,
        restarts: 0,
      })
    })
    .collect::<anyhow::Result<_>>()?;

  loop {
    thread::sleep(POLL_INTERVAL);
    let mut all_exhausted = true;
    for worker in &mut workers {
      match worker.child.try_wait() {
        Ok(Some(status)) => {
          log::warn!("worker {} exited with {status}", worker.id);
          if worker.restarts >= CRASH_BUDGET {
            log::error!("worker {} exceeded its crash budget ({CRASH_BUDGET}), not restarting", worker.id);
            continue;
          }
          worker.restarts += 1;
          worker.child = spawn_worker(&executable, worker.id)?;
          all_exhausted = false;
        }
        Ok(None) => all_exhausted = false,
        Err(error) => {
          log::warn!("worker {}: couldn't check status: {error}", worker.id);
          all_exhausted = false;
        }
      }
    }
    if all_exhausted {
      anyhow::bail!("every worker exhausted its crash budget ({CRASH_BUDGET} restarts)");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn worker_id_is_absent_without_the_env_var() {
    env::remove_var(WORKER_ID_VAR);
    assert_eq!(worker_id(), None);
  }

  #[test]
  fn worker_id_parses_the_env_var() {
    env::set_var(WORKER_ID_VAR, "3");
    assert_eq!(worker_id(), Some(3));
    env::remove_var(WORKER_ID_VAR);
  }
}
