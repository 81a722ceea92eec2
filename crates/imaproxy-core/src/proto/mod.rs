//! IMAP wire-level helpers
//!
//! Framing of client commands, tokenizing of server responses, and the
//! literal-aware GETMETADATA response parser.

pub mod framer;
pub mod metadata;
pub mod tokenizer;

pub use framer::{CommandDescriptor, Frame, Framer, DATA_EVENT};
pub use metadata::{parse_metadata_response, MetadataEntry};
pub use tokenizer::{ParsedResponse, ResponseTokenizer, Token};
