//! IMAP command framing and classification
//!
//! Extracts the first logical IMAP command from a raw byte buffer and
//! classifies it by tag and keyword. Classification only ever looks at the
//! first line, decoded leniently; the original bytes are forwarded
//! unchanged.

/// Pseudo command name for traffic that does not classify as a command
pub const DATA_EVENT: &str = "__DATA__";

/// Only this many leading bytes are decoded for classification
const CLASSIFY_WINDOW: usize = 256;

/// A read this short with no newline is taken to be a split tag
const SPLIT_TAG_MAX: usize = 10;

/// The result of classifying one IMAP line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Client tag, or `"0"` when none was recognized
    pub seq: String,
    /// Uppercased command keyword, or [`DATA_EVENT`]
    pub command: String,
    /// False means "buffer more bytes before emitting anything"
    pub write: bool,
}

impl CommandDescriptor {
    fn data() -> Self {
        Self {
            seq: "0".to_string(),
            command: DATA_EVENT.to_string(),
            write: true,
        }
    }

    fn hold() -> Self {
        Self {
            seq: "0".to_string(),
            command: DATA_EVENT.to_string(),
            write: false,
        }
    }
}

/// One framed client command: its descriptor plus how many input bytes
/// belong to it. Bytes beyond `consumed` are pipelined follow-up commands
/// that must be framed again.
#[derive(Debug)]
pub struct Frame {
    pub descriptor: CommandDescriptor,
    pub consumed: usize,
}

/// IMAP line framer and command classifier
pub struct Framer;

impl Framer {
    /// Classify a chunk without any literal handling. Used for the
    /// server-to-client direction, where `write` always starts true.
    pub fn classify(data: &[u8]) -> CommandDescriptor {
        let mut descriptor = Self::classify_client(data);
        descriptor.write = true;
        descriptor
    }

    /// Classify a client-direction chunk. May return `write == false` for
    /// a fragment that should be held until more bytes arrive.
    pub fn classify_client(data: &[u8]) -> CommandDescriptor {
        let window = &data[..data.len().min(CLASSIFY_WINDOW)];
        let text = String::from_utf8_lossy(window);
        let first_line = match text.split('\n').next() {
            Some(line) => line.trim_end_matches('\r'),
            None => "",
        };

        let tokens: Vec<&str> = first_line.split_whitespace().collect();

        if tokens.len() >= 2 && is_keyword(tokens[1]) {
            let mut command = tokens[1].to_uppercase();
            if command == "UID" {
                if let Some(sub) = tokens.get(2) {
                    command.push(' ');
                    command.push_str(&sub.to_uppercase());
                }
            }
            return CommandDescriptor {
                seq: tokens[0].to_string(),
                command,
                write: true,
            };
        }

        if tokens.len() == 1 && is_keyword(tokens[0]) {
            return CommandDescriptor {
                seq: "0".to_string(),
                command: tokens[0].to_uppercase(),
                write: true,
            };
        }

        let has_newline = data.contains(&b'\n');
        if tokens.len() == 1 && !has_newline && data.len() < SPLIT_TAG_MAX {
            return CommandDescriptor::hold();
        }

        CommandDescriptor::data()
    }

    /// Frame the first command in a client-direction buffer.
    ///
    /// A command is its first line plus, while the line ends in a literal
    /// marker `{n}` or `{n+}`, the n literal bytes and the command line
    /// that follows them. A literal that extends past the buffer consumes
    /// the whole buffer: the fragment must be forwarded now, because the
    /// client is waiting for the server's continuation before it sends the
    /// rest.
    pub fn frame_command(data: &[u8]) -> Frame {
        let descriptor = Self::classify_client(data);
        if !descriptor.write {
            return Frame {
                descriptor,
                consumed: 0,
            };
        }

        let mut end = match find_newline(data, 0) {
            Some(nl) => nl + 1,
            None => {
                return Frame {
                    descriptor,
                    consumed: data.len(),
                }
            }
        };

        let mut line_start = 0;
        while let Some(lit_len) = trailing_literal(&data[line_start..end]) {
            let lit_end = end + lit_len;
            if lit_end >= data.len() {
                end = data.len();
                break;
            }
            match find_newline(data, lit_end) {
                Some(nl) => {
                    line_start = lit_end;
                    end = nl + 1;
                }
                None => {
                    end = data.len();
                    break;
                }
            }
        }

        Frame {
            descriptor,
            consumed: end,
        }
    }
}

fn is_keyword(token: &str) -> bool {
    !token.is_empty() && token.bytes().all(|b| b.is_ascii_alphabetic())
}

fn find_newline(data: &[u8], from: usize) -> Option<usize> {
    data[from..].iter().position(|&b| b == b'\n').map(|p| from + p)
}

/// Byte count of a literal marker terminating `line`, if any
fn trailing_literal(line: &[u8]) -> Option<usize> {
    let trimmed = match line {
        [rest @ .., b'\r', b'\n'] => rest,
        [rest @ .., b'\n'] => rest,
        other => other,
    };
    if !trimmed.ends_with(b"}") {
        return None;
    }
    let open = trimmed.iter().rposition(|&b| b == b'{')?;
    let inner = &trimmed[open + 1..trimmed.len() - 1];
    let digits = inner.strip_suffix(b"+").unwrap_or(inner);
    if digits.is_empty() {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse::<usize>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_tagged_command() {
        let d = Framer::classify_client(b"a001 NOOP\r\n");
        assert_eq!(d.seq, "a001");
        assert_eq!(d.command, "NOOP");
        assert!(d.write);
    }

    #[test]
    fn test_classify_command_with_arguments() {
        let d = Framer::classify_client(b"a003 LSUB \"\" \"*\"\r\n");
        assert_eq!(d.seq, "a003");
        assert_eq!(d.command, "LSUB");
    }

    #[test]
    fn test_classify_untagged_server_line() {
        let d = Framer::classify(b"* CAPABILITY IMAP4rev1 SORT METADATA\r\n");
        assert_eq!(d.seq, "*");
        assert_eq!(d.command, "CAPABILITY");
        assert!(d.write);
    }

    #[test]
    fn test_classify_completion_line() {
        let d = Framer::classify(b"a001 OK NOOP completed\r\n");
        assert_eq!(d.seq, "a001");
        assert_eq!(d.command, "OK");
    }

    #[test]
    fn test_classify_bare_keyword() {
        let d = Framer::classify_client(b"DONE\r\n");
        assert_eq!(d.seq, "0");
        assert_eq!(d.command, "DONE");
        assert!(d.write);
    }

    #[test]
    fn test_classify_uid_subcommand() {
        let d = Framer::classify_client(b"a7 UID FETCH 1:* FLAGS\r\n");
        assert_eq!(d.command, "UID FETCH");
        assert_eq!(d.seq, "a7");
    }

    #[test]
    fn test_split_tag_is_held() {
        let d = Framer::classify_client(b"a0");
        assert!(!d.write);
    }

    #[test]
    fn test_short_line_with_newline_is_not_held() {
        let d = Framer::classify_client(b"a0\r\n");
        assert!(d.write);
        assert_eq!(d.command, DATA_EVENT);
    }

    #[test]
    fn test_long_fragment_is_data() {
        let d = Framer::classify_client(b"0123456789abcdef");
        assert!(d.write);
        assert_eq!(d.command, DATA_EVENT);
    }

    #[test]
    fn test_frame_single_command() {
        let frame = Framer::frame_command(b"a1 NOOP\r\n");
        assert_eq!(frame.consumed, 9);
    }

    #[test]
    fn test_frame_pipelined_commands() {
        let data = b"a1 NOOP\r\na2 CAPABILITY\r\n";
        let frame = Framer::frame_command(data);
        assert_eq!(&data[..frame.consumed], b"a1 NOOP\r\n");
        let rest = &data[frame.consumed..];
        let frame = Framer::frame_command(rest);
        assert_eq!(&rest[..frame.consumed], b"a2 CAPABILITY\r\n");
    }

    #[test]
    fn test_frame_literal_command() {
        let data = b"a1 LOGIN {5}\r\nfred! {6}\r\nsecret\r\na2 NOOP\r\n";
        let frame = Framer::frame_command(data);
        assert_eq!(frame.descriptor.command, "LOGIN");
        assert_eq!(
            &data[..frame.consumed],
            b"a1 LOGIN {5}\r\nfred! {6}\r\nsecret\r\n" as &[u8]
        );
        assert_eq!(&data[frame.consumed..], b"a2 NOOP\r\n");
    }

    #[test]
    fn test_frame_literal_spanning_reads_forwards_everything() {
        // The literal bytes have not arrived yet; the fragment must go out
        // now so the server can answer with its continuation.
        let data = b"a1 APPEND INBOX {310}\r\n";
        let frame = Framer::frame_command(data);
        assert!(frame.descriptor.write);
        assert_eq!(frame.consumed, data.len());
    }

    #[test]
    fn test_frame_nonsync_literal() {
        let data = b"a1 LOGIN {4+}\r\nfred pass\r\n";
        let frame = Framer::frame_command(data);
        assert_eq!(frame.consumed, data.len());
    }

    #[test]
    fn test_trailing_literal() {
        assert_eq!(trailing_literal(b"a1 LOGIN {5}\r\n"), Some(5));
        assert_eq!(trailing_literal(b"a1 LOGIN {12+}\r\n"), Some(12));
        assert_eq!(trailing_literal(b"a1 NOOP\r\n"), None);
        assert_eq!(trailing_literal(b"a1 X {}\r\n"), None);
    }

    #[test]
    fn test_classification_ignores_bytes_past_window() {
        let mut data = b"a1 SEARCH TEXT ".to_vec();
        data.extend(std::iter::repeat(b'x').take(500));
        data.extend_from_slice(b"\r\n");
        let d = Framer::classify_client(&data);
        assert_eq!(d.command, "SEARCH");
        assert_eq!(d.seq, "a1");
    }
}
