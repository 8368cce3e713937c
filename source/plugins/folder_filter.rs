use crate::{bus::Event, bus::EventBus, metadata, plugins::Plugin, session::Session, tokenizer};
use std::{
  collections::{HashMap, HashSet},
  io::Write as _,
  sync::{Arc, Mutex},
};

const LISTING_COMMANDS: [&str; 3] = ["LIST", "LSUB", "XLIST"];
const ANNOTATEMORE_ENTRY: &str = "/vendor/kolab/folder-type";
const METADATA_PRIVATE_ENTRY: &str = "/private/vendor/kolab/folder-type";
const METADATA_SHARED_ENTRY: &str = "/shared/vendor/kolab/folder-type";

struct ListingEntry {
  buffer: Vec<u8>,
}

#[derive(Default)]
struct ListingJob {
  /// Accumulates whichever response is currently in flight: the original listing, then (once it
  /// completes) the injected auxiliary request. The two never overlap in time, since the
  /// auxiliary request is only sent after the original listing's completion arrives.
  raw: Vec<u8>,
  entries: HashMap<String, ListingEntry>,
  pending: usize,
}

#[derive(Default)]
struct FolderFilterState {
  capabilities: HashSet<String>,
  capabilities_known: bool,
  job: Option<ListingJob>,
  metadata: Option<HashMap<String, String>>,
}

impl FolderFilterState {
  fn has_annotatemore(&self) -> bool {
    self.capabilities.contains("ANNOTATEMORE")
  }

  fn has_metadata(&self) -> bool {
    self.capabilities.contains("METADATA")
  }
}

pub struct FolderFilter;

impl Plugin for FolderFilter {
  fn name(&self) -> &str {
    "folder-filter"
  }

  fn register(&self, _session: &Arc<Session>, client_bus: &mut EventBus, server_bus: &mut EventBus) {
    let state: Arc<Mutex<FolderFilterState>> = Arc::new(Mutex::new(FolderFilterState::default()));

    {
      let state = Arc::clone(&state);
      server_bus.on("CAPABILITY", move |event: &mut Event| {
        record_capabilities(&state, &event.payload, true);
        Ok(())
      });
    }
    {
      let state = Arc::clone(&state);
      server_bus.on("OK", move |event: &mut Event| {
        record_capabilities(&state, &event.payload, false);
        Ok(())
      });
    }
    for command in LISTING_COMMANDS {
      let state = Arc::clone(&state);
      client_bus.on(command, move |event: &mut Event| on_listing_command(&state, event));
    }
    {
      let state = Arc::clone(&state);
      server_bus.on("__DATA__", move |event: &mut Event| on_server_data(&state, event));
    }
    {
      let state = Arc::clone(&state);
      client_bus.on("__DISCONNECT__", move |_event: &mut Event| {
        *state.lock().unwrap() = FolderFilterState::default();
        Ok(())
      });
    }
    {
      let state = Arc::clone(&state);
      server_bus.on("__DISCONNECT__", move |_event: &mut Event| {
        *state.lock().unwrap() = FolderFilterState::default();
        Ok(())
      });
    }
  }
}

fn record_capabilities(state: &Arc<Mutex<FolderFilterState>>, payload: &[u8], unconditional: bool) {
  let mut guard = state.lock().unwrap();
  if guard.capabilities_known {
    return;
  }
  let text = String::from_utf8_lossy(payload);
  if !unconditional && !text.contains("[CAPABILITY ") {
    return;
  }
  for word in text.split(|c: char| c.is_whitespace() || c == '[' || c == ']') {
    if word.len() > 1 && word.chars().all(|c| c.is_ascii_uppercase() || c == '=' || c.is_ascii_digit() || c == '+' || c == '.') {
      guard.capabilities.insert(word.to_string());
    }
  }
  guard.capabilities_known = true;
}

fn on_listing_command(state: &Arc<Mutex<FolderFilterState>>, event: &mut Event) -> anyhow::Result<()> {
  let mut guard = state.lock().unwrap();
  if !guard.capabilities_known {
    return Ok(());
  }
  if !guard.has_annotatemore() && !guard.has_metadata() {
    drop(guard);
    for command in LISTING_COMMANDS {
      event.detach_client.push(command.to_string());
    }
    event.detach_server.push("__DATA__".to_string());
    return Ok(());
  }
  let job = guard.job.get_or_insert_with(ListingJob::default);
  let key = format!("A{}", event.seq);
  job
    .entries
    .entry(key)
    .or_insert_with(|| ListingEntry { buffer: Vec::new() });
  job.pending += 1;
  Ok(())
}

fn on_server_data(state: &Arc<Mutex<FolderFilterState>>, event: &mut Event) -> anyhow::Result<()> {
  let mut guard = state.lock().unwrap();
  if guard.job.is_none() {
    return Ok(());
  }
  event.write = false;

  guard.job.as_mut().unwrap().raw.extend_from_slice(&event.payload);
  let parsed = tokenizer::parse_response(&guard.job.as_ref().unwrap().raw);
  let Some(tag) = parsed.seq else {
    return Ok(());
  };
  let raw = std::mem::take(&mut guard.job.as_mut().unwrap().raw);

  if guard.job.as_ref().unwrap().entries.contains_key(&tag) {
    // `tag` is already the injected auxiliary tag ("A" + the original listing's tag); strip the
    // prefix back off so `send_filtered_list` can key the entry and label the completion line.
    let orig_seq = tag.strip_prefix('A').unwrap_or(&tag).to_string();
    if guard.has_annotatemore() {
      complete_annotatemore(&mut guard, event, &orig_seq, &raw);
    } else if guard.has_metadata() {
      complete_metadata(&mut guard, event, &orig_seq, &raw);
    } else {
      guard.job = None;
      event.write = true;
      event.result = Some(raw);
    }
  } else {
    process_listing(&mut guard, event, &tag, raw)?;
  }
  Ok(())
}

/// The original `LIST`/`LSUB`/`XLIST` is completing. Tears the job down and passes the response
/// through unfiltered if it doesn't look like a real listing for one of our pending tags.
fn process_listing(
  state: &mut FolderFilterState,
  event: &mut Event,
  tag: &str,
  raw: Vec<u8>,
) -> anyhow::Result<()> {
  let key = format!("A{tag}");
  let mut lines = tokenizer::split_crlf(&raw);
  let has_entry = state.job.as_ref().map_or(false, |job| job.entries.contains_key(&key));
  if lines.len() < 2 || !has_entry {
    state.job = None;
    event.write = true;
    event.result = Some(raw);
    return Ok(());
  }
  lines.pop();
  {
    let job = state.job.as_mut().unwrap();
    let entry = job.entries.get_mut(&key).unwrap();
    for line in lines {
      entry.buffer.extend_from_slice(&line);
      entry.buffer.extend_from_slice(b"\r\n");
    }
  }

  if state.metadata.is_some() {
    send_filtered_list(state, event, tag);
    return Ok(());
  }

  if state.has_annotatemore() {
    state.metadata = Some(HashMap::new());
    write_upstream(
      event,
      format!("A{tag} GETANNOTATION \"*\" \"{ANNOTATEMORE_ENTRY}\" (\"value.priv\" \"value.shared\")\r\n"),
    )?;
  } else {
    state.metadata = Some(HashMap::new());
    write_upstream(
      event,
      format!("A{tag} GETMETADATA \"*\" ({METADATA_PRIVATE_ENTRY} {METADATA_SHARED_ENTRY})\r\n"),
    )?;
  }
  Ok(())
}

fn write_upstream(event: &Event, command: String) -> anyhow::Result<()> {
  let mut socket = event.upstream.lock().unwrap();
  socket.write_all(command.as_bytes())?;
  Ok(())
}

fn complete_annotatemore(state: &mut FolderFilterState, event: &mut Event, tag: &str, raw: &[u8]) {
  let metadata = state.metadata.get_or_insert_with(HashMap::new);
  for line in tokenizer::split_crlf(raw) {
    let tokens = tokenizer::tokenize_data(&line, None);
    if tokens.len() != 5 {
      continue;
    }
    let mailbox = tokens[2].as_str();
    let entry = tokens[3].as_str();
    if entry != ANNOTATEMORE_ENTRY {
      continue;
    }
    let tokenizer::Token::List(values) = &tokens[4] else {
      continue;
    };
    let value = values
      .get(1)
      .or_else(|| values.get(3))
      .map(tokenizer::Token::as_str)
      .unwrap_or_default();
    metadata.insert(mailbox, value.split('.').next().unwrap_or("").to_string());
  }
  send_filtered_list(state, event, tag);
}

fn complete_metadata(state: &mut FolderFilterState, event: &mut Event, tag: &str, raw: &[u8]) {
  let metadata = state.metadata.get_or_insert_with(HashMap::new);
  for entry in metadata::parse_metadata_responses(raw) {
    for (attr, value) in &entry.pairs {
      if attr != METADATA_PRIVATE_ENTRY && attr != METADATA_SHARED_ENTRY {
        continue;
      }
      let text = String::from_utf8_lossy(value);
      let stored = if text == "NIL" {
        "NIL".to_string()
      } else {
        text.split('.').next().unwrap_or("").to_string()
      };
      metadata.insert(entry.mailbox.clone(), stored);
    }
  }
  send_filtered_list(state, event, tag);
}

fn is_shared_mailbox(name: &str) -> bool {
  name == "shared" || name.starts_with("shared/")
}

fn send_filtered_list(state: &mut FolderFilterState, event: &mut Event, orig_seq: &str) {
  let key = format!("A{orig_seq}");
  let Some(job) = state.job.as_mut() else {
    return;
  };
  let Some(entry) = job.entries.remove(&key) else {
    return;
  };
  job.pending = job.pending.saturating_sub(1);

  let metadata = state.metadata.as_ref();
  let mut out = Vec::new();
  for line in tokenizer::split_crlf(&entry.buffer) {
    if line.is_empty() {
      continue;
    }
    let tokens = tokenizer::tokenize_data(&line, None);
    let mailbox = tokens.last().map(tokenizer::Token::as_str).unwrap_or_default();
    if is_shared_mailbox(&mailbox) {
      continue;
    }
    let keep = match metadata.and_then(|m| m.get(&mailbox)) {
      None => true,
      Some(folder_type) => folder_type == "mail" || folder_type == "NIL",
    };
    if keep {
      out.extend_from_slice(&line);
      out.extend_from_slice(b"\r\n");
    }
  }
  out.extend_from_slice(format!("{orig_seq} OK Completed (filtered by IMAProxy)\r\n").as_bytes());

  event.write = true;
  event.result = Some(out);

  let job = state.job.as_ref().unwrap();
  if job.entries.is_empty() && job.pending == 0 {
    state.job = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::SharedSocket;
  use std::io::Cursor;

  fn state_with_capabilities(caps: &[&str]) -> FolderFilterState {
    let mut state = FolderFilterState::default();
    state.capabilities_known = true;
    for cap in caps {
      state.capabilities.insert(cap.to_string());
    }
    state
  }

  fn fake_event(seq: &str, command: &str, payload: &[u8]) -> Event {
    let upstream: SharedSocket = Arc::new(Mutex::new(Box::new(Cursor::new(Vec::<u8>::new()))));
    let downstream: SharedSocket = Arc::new(Mutex::new(Box::new(Cursor::new(Vec::<u8>::new()))));
    Event {
      seq: seq.to_string(),
      command: command.to_string(),
      payload: payload.to_vec(),
      write: true,
      result: None,
      session: Arc::new(Session::new(1)),
      upstream,
      downstream,
      detach_client: Vec::new(),
      detach_server: Vec::new(),
    }
  }

  #[test]
  fn detaches_when_no_relevant_capability_is_advertised() {
    let state = Arc::new(Mutex::new(state_with_capabilities(&["IMAP4REV1"])));
    let mut event = fake_event("a1", "LIST", b"a1 LIST \"\" \"*\"\r\n");
    on_listing_command(&state, &mut event).unwrap();
    assert_eq!(event.detach_client, vec!["LIST", "LSUB", "XLIST"]);
    assert_eq!(event.detach_server, vec!["__DATA__"]);
  }

  #[test]
  fn registers_a_listing_entry_when_annotatemore_is_present() {
    let state = Arc::new(Mutex::new(state_with_capabilities(&["ANNOTATEMORE"])));
    let mut event = fake_event("a1", "LIST", b"a1 LIST \"\" \"*\"\r\n");
    on_listing_command(&state, &mut event).unwrap();
    assert!(event.detach_client.is_empty());
    let guard = state.lock().unwrap();
    assert!(guard.job.as_ref().unwrap().entries.contains_key("Aa1"));
  }

  #[test]
  fn shared_mailboxes_are_always_dropped() {
    assert!(is_shared_mailbox("shared"));
    assert!(is_shared_mailbox("shared/Team"));
    assert!(!is_shared_mailbox("Shared-ish"));
  }

  #[test]
  fn full_annotatemore_flow_filters_non_mail_folders() {
    let state = Arc::new(Mutex::new(state_with_capabilities(&["ANNOTATEMORE"])));
    let mut listing_event = fake_event("a1", "LIST", b"a1 LIST \"\" \"*\"\r\n");
    on_listing_command(&state, &mut listing_event).unwrap();

    let listing_response = b"* LIST () \"/\" INBOX\r\n* LIST () \"/\" Calendar\r\na1 OK Completed\r\n";
    let mut server_event = fake_event("0", "__DATA__", listing_response);
    on_server_data(&state, &mut server_event).unwrap();
    assert!(!server_event.write);

    let annotation_response =
      b"* ANNOTATION INBOX /vendor/kolab/folder-type (value.priv mail value.shared NIL)\r\n\
* ANNOTATION Calendar /vendor/kolab/folder-type (value.priv event value.shared NIL)\r\n\
Aa1 OK Completed\r\n";
    let mut aux_event = fake_event("0", "__DATA__", annotation_response);
    on_server_data(&state, &mut aux_event).unwrap();

    assert!(aux_event.write);
    let result = String::from_utf8(aux_event.result.unwrap()).unwrap();
    assert!(result.contains("INBOX"));
    assert!(!result.contains("Calendar"));
    assert!(result.contains("a1 OK Completed (filtered by IMAProxy)"));
  }
}
