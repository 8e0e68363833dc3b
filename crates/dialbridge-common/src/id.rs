//! Identifier generation and caller identity helpers.
//!
//! Conference peers are identified by a short random token the room server
//! uses in URLs and notifications. Tracks and streams use UUID v4 since they
//! never leave the process.

use rand::{Rng, distr::Alphanumeric};
use uuid::Uuid;

/// Length of a generated conference peer id.
pub const PEER_ID_LEN: usize = 8;

/// Display name used when the caller presents no identity.
pub const ANONYMOUS_CALLER: &str = "Dial-In User";

/// Generate a random peer id: eight lowercase alphanumerics.
pub fn generate_peer_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PEER_ID_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

/// Generate an id for a locally created track or stream.
pub fn generate_track_id() -> String {
    Uuid::new_v4().to_string()
}

/// Mask a caller id for display inside the conference.
///
/// Keeps the first three and the last two characters, so `+4915112345678`
/// becomes `+49xxxx78`. Missing or empty caller ids map to [`ANONYMOUS_CALLER`].
pub fn mask_caller_id(caller_id: Option<&str>) -> String {
    let Some(caller_id) = caller_id.filter(|c| !c.is_empty()) else {
        return ANONYMOUS_CALLER.to_string();
    };
    let chars: Vec<char> = caller_id.chars().collect();
    let head: String = chars.iter().take(3).collect();
    let tail: String = chars[chars.len().saturating_sub(2)..].iter().collect();
    format!("{head}xxxx{tail}")
}
