//! IMAP response tokenizing
//!
//! Splits server response chunks into untagged payload lines plus an
//! optional tagged completion, and tokenizes single lines into atoms,
//! quoted strings and parenthesized lists.

/// One token of an IMAP line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Atom(String),
    List(Vec<Token>),
}

impl Token {
    /// The token's text, for atoms
    pub fn as_atom(&self) -> Option<&str> {
        match self {
            Token::Atom(s) => Some(s.as_str()),
            Token::List(_) => None,
        }
    }

    /// The token's elements, for lists
    pub fn as_list(&self) -> Option<&[Token]> {
        match self {
            Token::Atom(_) => None,
            Token::List(items) => Some(items),
        }
    }
}

/// A server response chunk split into payload lines and completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    /// Tag of the trailing completion line, if one was present
    pub seq: Option<String>,
    /// `OK`, `NO` or `BAD` from the completion line
    pub status: Option<String>,
    /// Untagged payload lines, in order
    pub lines: Vec<String>,
}

/// IMAP response tokenizer
pub struct ResponseTokenizer;

impl ResponseTokenizer {
    /// Split a response chunk on CRLF and peel a trailing
    /// `<tag> OK|NO|BAD ...` completion line if present.
    pub fn parse_response(data: &[u8]) -> ParsedResponse {
        let text = String::from_utf8_lossy(data);
        let mut lines: Vec<String> = text
            .split('\n')
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect();

        let mut seq = None;
        let mut status = None;

        if let Some(last) = lines.last() {
            let mut words = last.split_whitespace();
            if let (Some(tag), Some(word)) = (words.next(), words.next()) {
                let upper = word.to_uppercase();
                if tag != "*" && matches!(upper.as_str(), "OK" | "NO" | "BAD") {
                    seq = Some(tag.to_string());
                    status = Some(upper);
                    lines.pop();
                }
            }
        }

        ParsedResponse { seq, status, lines }
    }

    /// Tokenize one IMAP line into atoms, quoted strings and parenthesized
    /// lists. With `limit`, tokenizing stops after that many top-level
    /// tokens and the untouched remainder becomes a single final atom.
    pub fn tokenize_data(line: &str, limit: Option<usize>) -> Vec<Token> {
        let bytes = line.as_bytes();
        let mut pos = 0;
        let mut tokens = Vec::new();

        loop {
            skip_spaces(bytes, &mut pos);
            if pos >= bytes.len() || matches!(bytes[pos], b'\r' | b'\n') {
                break;
            }
            if let Some(max) = limit {
                if tokens.len() == max {
                    let rest = line[pos..].trim().to_string();
                    if !rest.is_empty() {
                        tokens.push(Token::Atom(rest));
                    }
                    break;
                }
            }
            tokens.push(next_token(bytes, &mut pos));
        }

        tokens
    }

    /// Split `line` on `sep`, ignoring separators inside double quotes.
    pub fn explode_quoted_string(line: &str, sep: char) -> Vec<String> {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut escaped = false;

        for c in line.chars() {
            if escaped {
                current.push(c);
                escaped = false;
            } else if in_quotes && c == '\\' {
                current.push(c);
                escaped = true;
            } else if c == '"' {
                current.push(c);
                in_quotes = !in_quotes;
            } else if c == sep && !in_quotes {
                parts.push(std::mem::take(&mut current));
            } else {
                current.push(c);
            }
        }
        parts.push(current);
        parts
    }
}

fn skip_spaces(bytes: &[u8], pos: &mut usize) {
    while *pos < bytes.len() && (bytes[*pos] == b' ' || bytes[*pos] == b'\t') {
        *pos += 1;
    }
}

fn next_token(bytes: &[u8], pos: &mut usize) -> Token {
    match bytes[*pos] {
        b'(' => {
            *pos += 1;
            let mut items = Vec::new();
            loop {
                skip_spaces(bytes, pos);
                if *pos >= bytes.len() {
                    break;
                }
                if bytes[*pos] == b')' {
                    *pos += 1;
                    break;
                }
                if matches!(bytes[*pos], b'\r' | b'\n') {
                    break;
                }
                items.push(next_token(bytes, pos));
            }
            Token::List(items)
        }
        b'"' => Token::Atom(read_quoted(bytes, pos)),
        _ => {
            let start = *pos;
            while *pos < bytes.len()
                && !matches!(bytes[*pos], b' ' | b'\t' | b')' | b'\r' | b'\n')
            {
                *pos += 1;
            }
            let atom = String::from_utf8_lossy(&bytes[start..*pos]).into_owned();
            // Counted literal: `{n}` at end of segment, bytes follow CRLF
            if let Some(n) = literal_len(&atom) {
                if bytes[*pos..].starts_with(b"\r\n") || bytes[*pos..].starts_with(b"\n") {
                    let skip = if bytes[*pos] == b'\r' { 2 } else { 1 };
                    let start = *pos + skip;
                    let end = (start + n).min(bytes.len());
                    *pos = end;
                    return Token::Atom(String::from_utf8_lossy(&bytes[start..end]).into_owned());
                }
            }
            Token::Atom(atom)
        }
    }
}

fn read_quoted(bytes: &[u8], pos: &mut usize) -> String {
    *pos += 1;
    let mut out = Vec::new();
    let mut escaped = false;
    while *pos < bytes.len() {
        let b = bytes[*pos];
        *pos += 1;
        if escaped {
            out.push(b);
            escaped = false;
        } else if b == b'\\' {
            escaped = true;
        } else if b == b'"' {
            break;
        } else {
            out.push(b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn literal_len(atom: &str) -> Option<usize> {
    atom.strip_prefix('{')?
        .strip_suffix('}')?
        .parse::<usize>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atoms(tokens: &[Token]) -> Vec<String> {
        tokens
            .iter()
            .filter_map(|t| t.as_atom().map(str::to_string))
            .collect()
    }

    #[test]
    fn test_parse_response_with_completion() {
        let parsed = ResponseTokenizer::parse_response(
            b"* LIST () \"/\" INBOX\r\n* LIST () \"/\" Sent\r\na1 OK LIST completed\r\n",
        );
        assert_eq!(parsed.seq.as_deref(), Some("a1"));
        assert_eq!(parsed.status.as_deref(), Some("OK"));
        assert_eq!(parsed.lines.len(), 2);
        assert_eq!(parsed.lines[0], "* LIST () \"/\" INBOX");
    }

    #[test]
    fn test_parse_response_untagged_only() {
        let parsed = ResponseTokenizer::parse_response(b"* 3 EXISTS\r\n* 0 RECENT\r\n");
        assert!(parsed.seq.is_none());
        assert!(parsed.status.is_none());
        assert_eq!(parsed.lines.len(), 2);
    }

    #[test]
    fn test_parse_response_star_completion_is_payload() {
        let parsed = ResponseTokenizer::parse_response(b"* OK still here\r\n");
        assert!(parsed.seq.is_none());
        assert_eq!(parsed.lines, vec!["* OK still here"]);
    }

    #[test]
    fn test_tokenize_atoms_and_quotes() {
        let tokens =
            ResponseTokenizer::tokenize_data("* LIST (\\HasNoChildren) \"/\" \"My Folder\"", None);
        assert_eq!(tokens.len(), 5);
        assert_eq!(tokens[0], Token::Atom("*".to_string()));
        assert_eq!(
            tokens[2],
            Token::List(vec![Token::Atom("\\HasNoChildren".to_string())])
        );
        assert_eq!(tokens[4], Token::Atom("My Folder".to_string()));
    }

    #[test]
    fn test_tokenize_nested_list() {
        let tokens = ResponseTokenizer::tokenize_data("a (b (c d) e)", None);
        assert_eq!(tokens.len(), 2);
        let outer = tokens[1].as_list().unwrap();
        assert_eq!(outer.len(), 3);
        assert_eq!(outer[1].as_list().unwrap().len(), 2);
    }

    #[test]
    fn test_tokenize_quoted_escapes() {
        let tokens = ResponseTokenizer::tokenize_data(r#""a \"quoted\" name""#, None);
        assert_eq!(tokens[0], Token::Atom("a \"quoted\" name".to_string()));
    }

    #[test]
    fn test_tokenize_with_limit() {
        let tokens =
            ResponseTokenizer::tokenize_data("* ANNOTATION INBOX /vendor/x (\"a\" \"b\")", Some(3));
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[3], Token::Atom("/vendor/x (\"a\" \"b\")".to_string()));
    }

    #[test]
    fn test_tokenize_literal() {
        let tokens = ResponseTokenizer::tokenize_data("a {5}\r\nhello b", None);
        assert_eq!(atoms(&tokens), vec!["a", "hello", "b"]);
    }

    #[test]
    fn test_tokenize_round_trip() {
        let line = "* LIST (\\Noselect \\HasChildren) \"/\" Archive";
        let first = ResponseTokenizer::tokenize_data(line, None);
        let joined = first
            .iter()
            .map(render)
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(ResponseTokenizer::tokenize_data(&joined, None), first);
    }

    fn render(token: &Token) -> String {
        match token {
            Token::Atom(s) if s.contains(' ') => format!("\"{}\"", s),
            Token::Atom(s) => s.clone(),
            Token::List(items) => format!(
                "({})",
                items.iter().map(render).collect::<Vec<_>>().join(" ")
            ),
        }
    }

    #[test]
    fn test_explode_quoted_string() {
        let parts =
            ResponseTokenizer::explode_quoted_string("a1 LIST \"\" \"a b c\"", ' ');
        assert_eq!(parts, vec!["a1", "LIST", "\"\"", "\"a b c\""]);
    }

    #[test]
    fn test_explode_preserves_escaped_quotes() {
        let parts = ResponseTokenizer::explode_quoted_string(r#"x "a \" b" y"#, ' ');
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1], r#""a \" b""#);
    }
}
