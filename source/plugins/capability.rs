use crate::{bus::Event, bus::EventBus, plugins::Plugin, session::Session};
use std::sync::{atomic::Ordering, Arc};

const COMPRESS_DEFLATE: &str = "COMPRESS=DEFLATE";
const TRIGGER_CAPABILITIES: [&str; 3] = ["SORT", "ANNOTATEMORE", "METADATA"];

pub struct CapabilityRewriter;

impl Plugin for CapabilityRewriter {
  fn name(&self) -> &str {
    "capability-rewriter"
  }

  fn register(&self, session: &Arc<Session>, _client_bus: &mut EventBus, server_bus: &mut EventBus) {
    let session_capability = Arc::clone(session);
    server_bus.on("CAPABILITY", move |event: &mut Event| {
      on_capability(&session_capability, event);
      Ok(())
    });

    let session_ok = Arc::clone(session);
    server_bus.on("OK", move |event: &mut Event| {
      on_ok(&session_ok, event);
      Ok(())
    });
  }
}

fn has_any_trigger_capability(text: &str) -> bool {
  TRIGGER_CAPABILITIES.iter().any(|keyword| text.contains(keyword))
}

fn strip_compress_deflate(payload: &[u8]) -> Option<Vec<u8>> {
  let text = String::from_utf8_lossy(payload);
  if text.contains(&format!("{COMPRESS_DEFLATE} ")) {
    return Some(text.replacen(&format!("{COMPRESS_DEFLATE} "), "", 1).into_bytes());
  }
  if text.contains(COMPRESS_DEFLATE) {
    return Some(text.replacen(&format!(" {COMPRESS_DEFLATE}"), "", 1).into_bytes());
  }
  None
}

fn on_capability(session: &Arc<Session>, event: &mut Event) {
  let text = String::from_utf8_lossy(&event.payload).into_owned();
  if let Some(stripped) = strip_compress_deflate(&event.payload) {
    event.result = Some(stripped);
  }
  if has_any_trigger_capability(&text) {
    session.capabilities_seen.store(true, Ordering::Release);
  }
}

fn on_ok(session: &Arc<Session>, event: &mut Event) {
  if session.capabilities_seen.load(Ordering::Acquire) {
    return;
  }
  let text = String::from_utf8_lossy(&event.payload).into_owned();
  if !text.contains("[CAPABILITY ") || !has_any_trigger_capability(&text) {
    return;
  }
  if let Some(stripped) = strip_compress_deflate(&event.payload) {
    event.result = Some(stripped);
  }
  session.capabilities_seen.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn strips_compress_deflate_with_trailing_token() {
    let stripped = strip_compress_deflate(b"* CAPABILITY IMAP4rev1 COMPRESS=DEFLATE IDLE\r\n").unwrap();
    assert_eq!(stripped, b"* CAPABILITY IMAP4rev1 IDLE\r\n");
  }

  #[test]
  fn strips_compress_deflate_when_last_token() {
    let stripped = strip_compress_deflate(b"* CAPABILITY IMAP4rev1 IDLE COMPRESS=DEFLATE\r\n").unwrap();
    assert_eq!(stripped, b"* CAPABILITY IMAP4rev1 IDLE\r\n");
  }

  #[test]
  fn leaves_payload_untouched_when_absent() {
    assert!(strip_compress_deflate(b"* CAPABILITY IMAP4rev1 IDLE\r\n").is_none());
  }

  #[test]
  fn detects_trigger_capabilities() {
    assert!(has_any_trigger_capability("IMAP4rev1 METADATA IDLE"));
    assert!(!has_any_trigger_capability("IMAP4rev1 IDLE"));
  }
}
