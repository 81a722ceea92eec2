//! Capability rewriting
//!
//! Strips `COMPRESS=DEFLATE` from advertised capabilities so clients never
//! negotiate compression the proxy cannot see through, and marks the
//! session once the server has advertised a capability the other plugins
//! care about.

use super::{PluginContext, ProxyPlugin};
use crate::session::Session;
use tracing::debug;

/// The token removed from capability advertisements
const COMPRESS_TOKEN: &str = "COMPRESS=DEFLATE ";

/// Capabilities that flip `capabilities_seen`
const RELEVANT: [&str; 3] = ["SORT", "ANNOTATEMORE", "METADATA"];

/// Built-in plugin rewriting `CAPABILITY` advertisements
pub struct CapabilityRewriter;

impl ProxyPlugin for CapabilityRewriter {
    fn name(&self) -> &'static str {
        "capability-rewriter"
    }

    fn attach(&self, ctx: &PluginContext, _session: &mut Session) {
        let debug_log = ctx.debug_log;

        ctx.server_bus.on("CAPABILITY", move |session, event| {
            let text = String::from_utf8_lossy(&event.payload).into_owned();
            if text.contains(COMPRESS_TOKEN) {
                if debug_log {
                    debug!(
                        "Stripping COMPRESS=DEFLATE for session {}",
                        session.display_id()
                    );
                }
                event.result = Some(text.replace(COMPRESS_TOKEN, "").into_bytes());
            }
            if RELEVANT.iter().any(|cap| text.contains(cap)) {
                session.capabilities_seen = true;
            }
        });

        // Greeting and login responses may piggyback the capability list
        // in an OK response code. Only relevant until the first sighting.
        ctx.server_bus.on("OK", move |session, event| {
            if session.capabilities_seen {
                return;
            }
            let text = String::from_utf8_lossy(&event.payload).into_owned();
            if !text.contains("[CAPABILITY ") {
                return;
            }
            if RELEVANT.iter().any(|cap| text.contains(cap)) {
                if text.contains(COMPRESS_TOKEN) {
                    event.result = Some(text.replace(COMPRESS_TOKEN, "").into_bytes());
                }
                session.capabilities_seen = true;
            }
        });
    }
}
