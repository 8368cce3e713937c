// Tokenizes already-framed server response lines. Like the framer, this is deliberately not a
// full IMAP grammar: it understands atoms, quoted strings, parenthesized lists and literals well
// enough for the built-in plugins, and nothing more.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
  Atom(Vec<u8>),
  List(Vec<Token>),
}

impl Token {
  pub fn as_str(&self) -> String {
    match self {
      Token::Atom(bytes) => String::from_utf8_lossy(bytes).into_owned(),
      Token::List(_) => String::new(),
    }
  }
}

pub struct ParsedResponse {
  pub seq: Option<String>,
  pub status: Option<String>,
  pub lines: Vec<Vec<u8>>,
}

/// Splits `bytes` on CRLF. Unlike `str::lines`, operates on raw bytes so literal payloads
/// embedding arbitrary content don't need to be valid UTF-8.
pub fn split_crlf(bytes: &[u8]) -> Vec<Vec<u8>> {
  let mut lines = Vec::new();
  let mut start = 0;
  while let Some(pos) = memchr::memmem::find(&bytes[start..], b"\r\n") {
    lines.push(bytes[start..start + pos].to_vec());
    start += pos + 2;
  }
  if start < bytes.len() {
    lines.push(bytes[start..].to_vec());
  }
  lines
}

/// Splits a server response into untagged payload lines plus an optional trailing tagged
/// completion (`<tag> OK|NO|BAD ...`).
pub fn parse_response(bytes: &[u8]) -> ParsedResponse {
  let mut lines = split_crlf(bytes);
  let mut seq = None;
  let mut status = None;
  if let Some(last) = lines.last() {
    let text = String::from_utf8_lossy(last);
    let mut tokens = text.splitn(3, ' ');
    if let (Some(tag), Some(word)) = (tokens.next(), tokens.next()) {
      if tag != "*" && !tag.is_empty() && matches!(word, "OK" | "NO" | "BAD") {
        seq = Some(tag.to_string());
        status = Some(word.to_string());
        lines.pop();
      }
    }
  }
  ParsedResponse { seq, status, lines }
}

fn parse_literal_header(input: &[u8]) -> Option<(usize, usize)> {
  if input.first() != Some(&b'{') {
    return None;
  }
  let close = memchr::memchr(b'}', input)?;
  let digits = std::str::from_utf8(&input[1..close]).ok()?;
  let n: usize = digits.parse().ok()?;
  let mut header_len = close + 1;
  if input.get(header_len) == Some(&b'\r') && input.get(header_len + 1) == Some(&b'\n') {
    header_len += 2;
  } else if input.get(header_len) == Some(&b'\n') {
    header_len += 1;
  } else {
    return None;
  }
  Some((n, header_len))
}

fn read_quoted(input: &[u8]) -> (Vec<u8>, usize) {
  let mut out = Vec::new();
  let mut i = 0;
  while i < input.len() {
    match input[i] {
      b'"' => {
        i += 1;
        break;
      }
      b'\\' if i + 1 < input.len() => {
        out.push(input[i + 1]);
        i += 2;
      }
      byte => {
        out.push(byte);
        i += 1;
      }
    }
  }
  (out, i)
}

fn read_atom(input: &[u8]) -> (Vec<u8>, usize) {
  let mut i = 0;
  while i < input.len() && !matches!(input[i], b' ' | b'(' | b')') {
    i += 1;
  }
  (input[..i].to_vec(), i)
}

fn tokenize_list(input: &[u8]) -> (Vec<Token>, usize) {
  let mut tokens = Vec::new();
  let mut i = 0;
  loop {
    while input.get(i) == Some(&b' ') {
      i += 1;
    }
    match input.get(i) {
      None => break,
      Some(b')') => {
        i += 1;
        break;
      }
      Some(b'(') => {
        let (nested, consumed) = tokenize_list(&input[i + 1..]);
        tokens.push(Token::List(nested));
        i += 1 + consumed;
      }
      Some(b'"') => {
        let (atom, consumed) = read_quoted(&input[i + 1..]);
        tokens.push(Token::Atom(atom));
        i += 1 + consumed;
      }
      Some(_) => {
        if let Some((n, header_len)) = parse_literal_header(&input[i..]) {
          let start = i + header_len;
          let end = (start + n).min(input.len());
          tokens.push(Token::Atom(input[start..end].to_vec()));
          i = end;
        } else {
          let (atom, consumed) = read_atom(&input[i..]);
          tokens.push(Token::Atom(atom));
          i += consumed.max(1);
        }
      }
    }
  }
  (tokens, i)
}

/// Tokenizes one line into atoms, quoted strings, parenthesized lists and literals. If `limit` is
/// given, the remainder of the line after `limit` tokens is returned as one final atom.
pub fn tokenize_data(line: &[u8], limit: Option<usize>) -> Vec<Token> {
  let mut tokens = Vec::new();
  let mut i = 0;
  while i < line.len() {
    if let Some(lim) = limit {
      if tokens.len() == lim {
        tokens.push(Token::Atom(line[i..].to_vec()));
        break;
      }
    }
    match line[i] {
      b' ' => i += 1,
      b'(' => {
        let (list, consumed) = tokenize_list(&line[i + 1..]);
        tokens.push(Token::List(list));
        i += 1 + consumed;
      }
      b'"' => {
        let (atom, consumed) = read_quoted(&line[i + 1..]);
        tokens.push(Token::Atom(atom));
        i += 1 + consumed;
      }
      _ => {
        if let Some((n, header_len)) = parse_literal_header(&line[i..]) {
          let start = i + header_len;
          let end = (start + n).min(line.len());
          tokens.push(Token::Atom(line[start..end].to_vec()));
          i = end;
        } else {
          let (atom, consumed) = read_atom(&line[i..]);
          tokens.push(Token::Atom(atom));
          i += consumed.max(1);
        }
      }
    }
  }
  tokens
}

pub fn explode_quoted_string(line: &str, sep: char) -> Vec<String> {
  let mut parts = Vec::new();
  let mut current = String::new();
  let mut in_quotes = false;
  let mut chars = line.chars().peekable();
  while let Some(c) = chars.next() {
    match c {
      '"' => {
        in_quotes = !in_quotes;
        current.push(c);
      }
      '\\' if in_quotes => {
        current.push(c);
        if let Some(next) = chars.next() {
          current.push(next);
        }
      }
      c if c == sep && !in_quotes => parts.push(std::mem::take(&mut current)),
      c => current.push(c),
    }
  }
  parts.push(current);
  parts
}

fn join_atoms(tokens: &[Token]) -> String {
  tokens
    .iter()
    .map(Token::as_str)
    .collect::<Vec<_>>()
    .join(" ")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_response_peels_the_tagged_completion() {
    let parsed = parse_response(b"* LIST () \"/\" INBOX\r\na1 OK Completed\r\n");
    assert_eq!(parsed.seq.as_deref(), Some("a1"));
    assert_eq!(parsed.status.as_deref(), Some("OK"));
    assert_eq!(parsed.lines, vec![b"* LIST () \"/\" INBOX".to_vec()]);
  }

  #[test]
  fn parse_response_without_a_completion_keeps_every_line() {
    let parsed = parse_response(b"* 1 EXISTS\r\n* 1 RECENT\r\n");
    assert!(parsed.seq.is_none());
    assert_eq!(parsed.lines.len(), 2);
  }

  #[test]
  fn tokenize_data_splits_atoms_and_quoted_strings() {
    let tokens = tokenize_data(br#"* ANNOTATION INBOX "/comment" ("value.priv" "x")"#, None);
    assert_eq!(
      tokens,
      vec![
        Token::Atom(b"*".to_vec()),
        Token::Atom(b"ANNOTATION".to_vec()),
        Token::Atom(b"INBOX".to_vec()),
        Token::Atom(b"/comment".to_vec()),
        Token::List(vec![
          Token::Atom(b"value.priv".to_vec()),
          Token::Atom(b"x".to_vec()),
        ]),
      ]
    );
  }

  #[test]
  fn tokenize_data_handles_literals() {
    let tokens = tokenize_data(b"* 1 FETCH (BODY[] {5}\r\nhello)", None);
    let Token::List(items) = &tokens[3] else {
      panic!("expected a list");
    };
    assert_eq!(items[1], Token::Atom(b"hello".to_vec()));
  }

  #[test]
  fn tokenize_data_limit_returns_remainder_as_one_token() {
    let tokens = tokenize_data(b"a b c d", Some(2));
    assert_eq!(
      tokens,
      vec![
        Token::Atom(b"a".to_vec()),
        Token::Atom(b"b".to_vec()),
        Token::Atom(b"c d".to_vec()),
      ]
    );
  }

  #[test]
  fn atoms_round_trip_through_tokenize_and_join() {
    let line = b"* LSUB () INBOX Drafts Sent";
    let rejoined = join_atoms(&tokenize_data(line, None));
    assert_eq!(tokenize_data(rejoined.as_bytes(), None), tokenize_data(line, None));
  }

  #[test]
  fn explode_quoted_string_ignores_separators_inside_quotes() {
    let parts = explode_quoted_string(r#"a/"b/c"/d"#, '/');
    assert_eq!(parts, vec!["a", "\"b/c\"", "d"]);
  }
}
