//! Groupware folder filtering
//!
//! Kolab-style servers keep calendars, tasks and notes in IMAP folders
//! annotated with a folder type. This plugin intercepts `LIST`, `LSUB` and
//! `XLIST`, buffers the server's listing, asks the server for the folder
//! types over the same connection (`GETANNOTATION` on `ANNOTATEMORE`
//! servers, `GETMETADATA` on `METADATA` servers), and hands the client a
//! listing with the non-mail folders removed, closed by a synthesized
//! completion for the client's own tag.

use super::{PluginContext, ProxyPlugin};
use crate::bus::{Event, EventBus, ListenerId, DISCONNECT_EVENT};
use crate::proto::framer::DATA_EVENT;
use crate::proto::metadata::parse_metadata_response;
use crate::proto::tokenizer::{ResponseTokenizer, Token};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Key of the plugin's state in the session extension bag
const STATE_KEY: &str = "folder-filter";

const ANNOTATION_ENTRY: &str = "/vendor/kolab/folder-type";
const METADATA_PRIVATE_ENTRY: &str = "/private/vendor/kolab/folder-type";
const METADATA_SHARED_ENTRY: &str = "/shared/vendor/kolab/folder-type";

/// Folder types that stay visible
const VISIBLE_TYPES: [&str; 2] = ["mail", "NIL"];

/// Which side of the proxy a listener was registered on
#[derive(Debug, Clone, Copy)]
enum BusSide {
    Client,
    Server,
}

/// One intercepted listing command, keyed by its synthetic tag.
///
/// The synthetic tag is `"A"` prepended to the client's tag, which assumes
/// the client never itself uses that exact tag for a concurrent command.
#[derive(Debug)]
struct Listing {
    seq: String,
    command: String,
    lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Caps {
    annotatemore: bool,
    metadata: bool,
}

/// Per-session filter state, kept in the session extension bag
#[derive(Default)]
struct FilterState {
    /// Capability map, populated from the first CAPABILITY sighting
    caps: Option<Caps>,
    /// Active listings by synthetic tag
    listings: HashMap<String, Listing>,
    /// Accumulates suppressed server bytes until a tagged completion sorts
    /// them out
    buffer: Vec<u8>,
    /// Folder name to folder type; survives across listings on the session
    folder_types: Option<HashMap<String, String>>,
    /// The armed server-bus `__DATA__` listener, while listings are active
    armed: Option<ListenerId>,
    /// Everything registered at attach time, for detaching
    registered: Vec<(BusSide, String, ListenerId)>,
}

/// Built-in plugin hiding non-mail groupware folders from listings
pub struct FolderFilter;

impl ProxyPlugin for FolderFilter {
    fn name(&self) -> &'static str {
        STATE_KEY
    }

    fn attach(&self, ctx: &PluginContext, session: &mut Session) {
        let mut state = FilterState::default();
        let debug_log = ctx.debug_log;

        let capability_id = ctx.server_bus.on("CAPABILITY", |session, event| {
            with_state(session, |state, _| {
                if state.caps.is_none() {
                    let line = String::from_utf8_lossy(&event.payload).into_owned();
                    state.caps = Some(parse_caps(&line));
                }
            });
        });
        state
            .registered
            .push((BusSide::Server, "CAPABILITY".to_string(), capability_id));

        let ok_id = ctx.server_bus.on("OK", |session, event| {
            with_state(session, |state, _| {
                if state.caps.is_some() {
                    return;
                }
                let text = String::from_utf8_lossy(&event.payload).into_owned();
                if let Some(start) = text.find("[CAPABILITY ") {
                    let inner = &text[start + 1..];
                    let inner = inner.split(']').next().unwrap_or(inner);
                    state.caps = Some(parse_caps(inner));
                }
            });
        });
        state
            .registered
            .push((BusSide::Server, "OK".to_string(), ok_id));

        for command in ["LSUB", "LIST", "XLIST"] {
            // Weak references: these closures are stored on the very buses
            // they need to talk to, and strong captures would cycle.
            let client_weak = Arc::downgrade(&ctx.client_bus);
            let server_weak = Arc::downgrade(&ctx.server_bus);
            let id = ctx.client_bus.on(command, move |session, event| {
                let (Some(client_bus), Some(server_bus)) =
                    (client_weak.upgrade(), server_weak.upgrade())
                else {
                    return;
                };
                on_listing_command(session, event, &client_bus, &server_bus, debug_log);
            });
            state
                .registered
                .push((BusSide::Client, command.to_string(), id));
        }

        let disconnect_id = ctx.client_bus.on(DISCONNECT_EVENT, |session, _event| {
            session.ext_remove(STATE_KEY);
        });
        state
            .registered
            .push((BusSide::Client, DISCONNECT_EVENT.to_string(), disconnect_id));

        session.ext_put(STATE_KEY, state);
    }
}

/// Run `f` with the session's filter state taken out of the extension bag,
/// putting it back afterwards
fn with_state<R>(
    session: &mut Session,
    f: impl FnOnce(&mut FilterState, &mut Session) -> R,
) -> Option<R> {
    let mut state = session.ext_take::<FilterState>(STATE_KEY)?;
    let result = f(&mut state, session);
    session.ext_put(STATE_KEY, *state);
    Some(result)
}

/// Client sent LSUB, LIST or XLIST
fn on_listing_command(
    session: &mut Session,
    event: &mut Event,
    client_bus: &Arc<EventBus>,
    server_bus: &Arc<EventBus>,
    debug_log: bool,
) {
    let Some(mut state) = session.ext_take::<FilterState>(STATE_KEY) else {
        return;
    };

    let caps = state.caps.unwrap_or_default();
    if !caps.annotatemore && !caps.metadata {
        // Nothing to filter by on this server; get out of the data path
        // for the rest of the session.
        if debug_log {
            debug!(
                "No folder-type capability on session {}; detaching",
                session.display_id()
            );
        }
        detach(&mut state, client_bus, server_bus);
        return;
    }

    let text = String::from_utf8_lossy(&event.payload).into_owned();
    for line in text.split("\r\n").filter(|l| !l.trim().is_empty()) {
        let mut words = line.split_whitespace();
        if let (Some(tag), Some(command)) = (words.next(), words.next()) {
            state.listings.insert(
                format!("A{}", tag),
                Listing {
                    seq: tag.to_string(),
                    command: command.to_uppercase(),
                    lines: Vec::new(),
                },
            );
        }
    }

    if state.armed.is_none() && !state.listings.is_empty() {
        let server_weak = Arc::downgrade(server_bus);
        state.armed = Some(server_bus.on(DATA_EVENT, move |session, event| {
            let Some(bus) = server_weak.upgrade() else {
                return;
            };
            on_server_data(session, event, &bus);
        }));
    }

    session.ext_put(STATE_KEY, *state);
}

/// Server-to-client traffic while at least one listing is being buffered
fn on_server_data(session: &mut Session, event: &mut Event, server_bus: &Arc<EventBus>) {
    let Some(mut state) = session.ext_take::<FilterState>(STATE_KEY) else {
        return;
    };

    if state.listings.is_empty() {
        session.ext_put(STATE_KEY, *state);
        return;
    }

    event.write = false;
    let parsed = ResponseTokenizer::parse_response(&event.payload);

    match parsed.seq {
        Some(ref tag) if state.listings.contains_key(tag) => {
            // Our injected folder-type request completed; everything it
            // produced sits in the buffer.
            let caps = state.caps.unwrap_or_default();
            let harvested = if caps.annotatemore {
                parse_annotation_types(&state.buffer)
            } else {
                parse_metadata_types(&state.buffer)
            };
            state
                .folder_types
                .get_or_insert_with(HashMap::new)
                .extend(harvested);
            state.buffer.clear();
            let key = tag.clone();
            send_filtered_list(&mut state, &key, event, server_bus);
        }
        _ => {
            state.buffer.extend_from_slice(&event.payload);
            if let Some(tag) = parsed.seq {
                if !process_listing(&mut state, &tag, event, server_bus) {
                    // Not a listing of ours after all; let the buffered
                    // bytes through untouched.
                    event.write = true;
                    event.result = Some(std::mem::take(&mut state.buffer));
                }
            }
        }
    }

    session.ext_put(STATE_KEY, *state);
}

/// The original listing command completed upstream. Stash its untagged
/// lines and either answer from the known folder types or inject the
/// folder-type request. Returns false when the buffered bytes are not a
/// listing this plugin is handling.
fn process_listing(
    state: &mut FilterState,
    seq: &str,
    event: &mut Event,
    server_bus: &Arc<EventBus>,
) -> bool {
    let key = format!("A{}", seq);

    let text = String::from_utf8_lossy(&state.buffer).into_owned();
    let mut lines: Vec<String> = text
        .split("\r\n")
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    if lines.len() < 2 || !state.listings.contains_key(&key) {
        teardown_listing(state, &key, server_bus);
        return false;
    }

    lines.pop();
    state.buffer.clear();
    if let Some(listing) = state.listings.get_mut(&key) {
        listing.lines.extend(lines);
    }

    if state.folder_types.is_some() {
        send_filtered_list(state, &key, event, server_bus);
        return true;
    }

    state.folder_types = Some(HashMap::new());
    let caps = state.caps.unwrap_or_default();
    let request = if caps.annotatemore {
        format!(
            "A{} GETANNOTATION \"*\" \"{}\" (\"value.priv\" \"value.shared\")\r\n",
            seq, ANNOTATION_ENTRY
        )
    } else {
        format!(
            "A{} GETMETADATA \"*\" ({} {})\r\n",
            seq, METADATA_PRIVATE_ENTRY, METADATA_SHARED_ENTRY
        )
    };
    event.to_upstream.push(request.into_bytes());
    true
}

/// Emit the filtered listing plus a synthesized completion for the
/// client's original tag
fn send_filtered_list(
    state: &mut FilterState,
    key: &str,
    event: &mut Event,
    server_bus: &Arc<EventBus>,
) {
    let Some(listing) = state.listings.remove(key) else {
        return;
    };

    let mut out = String::new();
    for line in &listing.lines {
        if keep_line(line, state.folder_types.as_ref()) {
            out.push_str(line);
            out.push_str("\r\n");
        }
    }
    out.push_str(&format!(
        "{} OK Completed (filtered by IMAProxy)\r\n",
        listing.seq
    ));
    event.result = Some(out.into_bytes());

    if state.listings.is_empty() {
        state.buffer.clear();
        if let Some(id) = state.armed.take() {
            server_bus.off(DATA_EVENT, id);
        }
    }
}

/// Whether one untagged listing line survives filtering
fn keep_line(line: &str, folder_types: Option<&HashMap<String, String>>) -> bool {
    let tokens = ResponseTokenizer::tokenize_data(line, None);
    let mailbox = match tokens.last().and_then(Token::as_atom) {
        Some(name) => name,
        None => return true,
    };

    if mailbox == "shared" || mailbox.starts_with("shared/") {
        return false;
    }

    match folder_types.and_then(|m| m.get(mailbox)) {
        None => true,
        Some(t) => VISIBLE_TYPES.contains(&t.as_str()),
    }
}

/// Drop one listing and disarm once nothing is left
fn teardown_listing(state: &mut FilterState, key: &str, server_bus: &Arc<EventBus>) {
    state.listings.remove(key);
    if state.listings.is_empty() {
        if let Some(id) = state.armed.take() {
            server_bus.off(DATA_EVENT, id);
        }
    }
}

/// Remove every listener this plugin registered on the session's buses
fn detach(state: &mut FilterState, client_bus: &Arc<EventBus>, server_bus: &Arc<EventBus>) {
    for (side, name, id) in state.registered.drain(..) {
        match side {
            BusSide::Client => client_bus.off(&name, id),
            BusSide::Server => server_bus.off(&name, id),
        };
    }
    if let Some(id) = state.armed.take() {
        server_bus.off(DATA_EVENT, id);
    }
}

fn parse_caps(line: &str) -> Caps {
    let mut caps = Caps::default();
    for word in ResponseTokenizer::explode_quoted_string(line, ' ') {
        match word.trim_end_matches(']').to_uppercase().as_str() {
            "ANNOTATEMORE" => caps.annotatemore = true,
            "METADATA" => caps.metadata = true,
            _ => {}
        }
    }
    caps
}

/// Fold a buffered GETANNOTATION response into folder-name to type.
/// Annotation lines carry `(attribute value ...)` pairs; the private value
/// sits at index 1 with the shared value at index 3 as the fallback.
fn parse_annotation_types(buffer: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(buffer).into_owned();
    let mut types = HashMap::new();

    for line in text.split("\r\n") {
        let tokens = ResponseTokenizer::tokenize_data(line, None);
        if tokens.len() < 5
            || tokens[0].as_atom() != Some("*")
            || tokens[1].as_atom() != Some("ANNOTATION")
        {
            continue;
        }
        let (mailbox, entry) = match (tokens[2].as_atom(), tokens[3].as_atom()) {
            (Some(mailbox), Some(entry)) => (mailbox, entry),
            _ => continue,
        };
        if entry != ANNOTATION_ENTRY {
            continue;
        }
        let values = match tokens[4].as_list() {
            Some(values) => values,
            None => continue,
        };
        let value = [1usize, 3]
            .iter()
            .filter_map(|&i| values.get(i).and_then(Token::as_atom))
            .find(|v| *v != "NIL");
        if let Some(value) = value {
            types.insert(mailbox.to_string(), folder_type(value));
        }
    }

    types
}

/// Fold a buffered GETMETADATA response into folder-name to type. The
/// private entry wins over the shared one.
fn parse_metadata_types(buffer: &[u8]) -> HashMap<String, String> {
    let mut types = HashMap::new();

    for entry in parse_metadata_response(buffer) {
        match entry.entry.as_str() {
            METADATA_PRIVATE_ENTRY => {
                types.insert(entry.folder, folder_type(&entry.value));
            }
            METADATA_SHARED_ENTRY => {
                types
                    .entry(entry.folder)
                    .or_insert_with(|| folder_type(&entry.value));
            }
            _ => {}
        }
    }

    types
}

/// A folder type stripped of its dot suffix; `NIL` stays literal
fn folder_type(value: &str) -> String {
    if value == "NIL" {
        return value.to_string();
    }
    value.split('.').next().unwrap_or(value).to_string()
}
