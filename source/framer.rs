// RFC 3501 only describes the grammar; it says nothing about how to slice a raw byte stream into
// commands when the transport is a plain duplex socket. This module deliberately approximates
// that job rather than fully parsing IMAP (see Non-goals): it classifies the first line of a
// buffer well enough to dispatch it, and leaves literal payloads opaque.

pub struct CommandDescriptor {
  pub seq: String,
  pub command: String,
  pub write: bool,
  pub payload: Vec<u8>,
}

pub struct FrameResult {
  pub descriptor: CommandDescriptor,
  /// Bytes left over after this command when more than one command arrived in a single read.
  /// Only ever populated in the client direction.
  pub remainder: Option<Vec<u8>>,
}

const CLASSIFY_WINDOW: usize = 256;
const SPLIT_TAG_LIMIT: usize = 10;

fn is_word(token: &str) -> bool {
  !token.is_empty() && token.chars().all(|c| c.is_ascii_alphabetic())
}

fn first_line(buf: &[u8]) -> String {
  let head = &buf[..buf.len().min(CLASSIFY_WINDOW)];
  let text = String::from_utf8_lossy(head);
  let end = text.find(['\r', '\n']).unwrap_or(text.len());
  text[..end].to_string()
}

fn line_end(buf: &[u8]) -> Option<usize> {
  if let Some(pos) = memchr::memmem::find(buf, b"\r\n") {
    return Some(pos + 2);
  }
  memchr::memchr(b'\n', buf).map(|pos| pos + 1)
}

/// Classifies a buffer's first line. `allow_split` controls whether an under-length, unterminated
/// single token is held back as a fragment (client direction) or forced to `write = true`
/// (server direction, which never buffers a fragment).
pub fn classify(buf: &[u8], allow_split: bool) -> CommandDescriptor {
  let line = first_line(buf);
  let has_newline = memchr::memchr(b'\n', buf).is_some();
  let tokens: Vec<&str> = line.split_whitespace().collect();

  // Classification only looks at the first two tokens (tag, command keyword); anything after is
  // left as part of the payload, so a command's arguments never prevent it from being recognized.
  let (seq, mut command, write) = match (tokens.first(), tokens.get(1)) {
    (Some(tag), Some(word)) if is_word(word) => (tag.to_string(), word.to_uppercase(), true),
    (Some(word), None) => {
      if allow_split && !has_newline && buf.len() < SPLIT_TAG_LIMIT {
        ("0".to_string(), String::new(), false)
      } else if is_word(word) {
        ("0".to_string(), word.to_uppercase(), true)
      } else {
        ("0".to_string(), "__DATA__".to_string(), true)
      }
    }
    _ => ("0".to_string(), "__DATA__".to_string(), true),
  };

  if command == "UID" {
    if let Some(third) = tokens.get(2) {
      command = format!("UID {}", third.to_uppercase());
    }
  }

  CommandDescriptor {
    seq,
    command,
    write,
    payload: buf.to_vec(),
  }
}

/// Frames one client-direction command out of `buf`. Honors literal continuations (a first line
/// ending in `}` pulls the whole buffer into one command, since what follows is opaque literal
/// data) and re-queues any pipelined remainder for a second pass.
pub fn frame_client(buf: &[u8]) -> FrameResult {
  let descriptor = classify(buf, true);
  if !descriptor.write {
    return FrameResult {
      descriptor,
      remainder: None,
    };
  }

  let line = first_line(buf);
  if line.trim_end().ends_with('}') {
    return FrameResult {
      descriptor,
      remainder: None,
    };
  }

  match line_end(buf) {
    Some(end) if end < buf.len() => {
      let mut descriptor = descriptor;
      descriptor.payload = buf[..end].to_vec();
      FrameResult {
        descriptor,
        remainder: Some(buf[end..].to_vec()),
      }
    }
    _ => FrameResult {
      descriptor,
      remainder: None,
    },
  }
}

/// Frames one server-direction chunk. Always reports `write = true`; never holds back a fragment
/// or re-queues a remainder (see Design Notes Open Question (a)).
pub fn frame_server(buf: &[u8]) -> CommandDescriptor {
  classify(buf, false)
}
