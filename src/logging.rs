//! Logging setup and id formatting for log fields.
//!
//! All components log through `tracing`. [`init`] installs a `fmt`
//! subscriber filtered by `RUST_LOG` (falling back to the given directive).
//!
//! Ids are long base64 digests; [`node_id`] and [`request_id`] shorten them
//! to a stable prefix such as `n-1GDfZUq`, coloured per id when stderr is a
//! terminal so the same peer is easy to follow across lines.

use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

/// Install the global subscriber. Later calls are no-ops.
pub fn init(default_directive: Option<&str>) {
    let is_terminal = std::io::stderr().is_terminal();
    COLOUR_ENABLED.store(is_terminal, Ordering::Relaxed);

    let default = default_directive
        .and_then(|d| d.parse().ok())
        .unwrap_or_else(|| Level::INFO.into());
    let filter = EnvFilter::builder()
        .with_default_directive(default)
        .from_env_lossy();

    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(is_terminal)
        .with_target(false)
        .try_init();
}

pub fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";

const ID_COLOURS: &[&str] = &[
    "\x1b[91m", "\x1b[92m", "\x1b[93m", "\x1b[94m", "\x1b[95m", "\x1b[96m", "\x1b[31m",
    "\x1b[32m", "\x1b[33m", "\x1b[34m", "\x1b[35m", "\x1b[36m",
];

fn hash_colour(id: &str) -> &'static str {
    let hash: u32 = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const LOG_ID_TRUNCATE_LEN: usize = 7;

fn truncate_id(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(LOG_ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn format_id(prefix: char, id: &str) -> String {
    let short = truncate_id(id);
    if colour_enabled() {
        format!("{}{prefix}-{short}{RESET}", hash_colour(id))
    } else {
        format!("{prefix}-{short}")
    }
}

/// Short form of a node id, e.g. `n-1GDfZUq`.
pub fn node_id(id: &str) -> String {
    format_id('n', id)
}

/// Short form of a request id, e.g. `r-x81_aQe`.
pub fn request_id(id: &str) -> String {
    format_id('r', id)
}

/// Short form of a conversation id, e.g. `c-Qm2s0aL`.
pub fn conversation_id(id: &str) -> String {
    format_id('c', id)
}
