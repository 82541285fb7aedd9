//! Text lines of the authentication exchange.
//!
//! ```text
//! server → client   challenge:<decimal handle>\n
//! client            SetEvent(<handle>)
//! server → client   OK\n
//!
//! unauthenticated:  challenge:none\nOK\n
//! ```

use shared_types::RawHandle;

/// Sent on success.
pub const OK_LINE: &str = "OK\n";

/// Sent at once on channels that do not authenticate.
pub const NO_CHALLENGE: &str = "challenge:none\nOK\n";

const CHALLENGE_PREFIX: &str = "challenge:";

/// What the server asks of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Challenge {
    /// Signal the event with this handle value.
    Signal(RawHandle),
    /// Nothing to prove.
    None,
}

/// The challenge line for a duplicated event handle.
pub fn challenge_line(handle: RawHandle) -> String {
    format!("{CHALLENGE_PREFIX}{}\n", handle.0)
}

/// Parse one line (without the newline).
pub fn parse_challenge(line: &str) -> Option<Challenge> {
    match line.trim().strip_prefix(CHALLENGE_PREFIX)? {
        "none" => Some(Challenge::None),
        value => value.parse().ok().map(|h| Challenge::Signal(RawHandle(h))),
    }
}

/// Remove and return the first complete line from `buffer`.
pub fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let end = buffer.iter().position(|b| *b == b'\n')?;
    let line: Vec<u8> = buffer.drain(..=end).collect();
    Some(String::from_utf8_lossy(&line[..end]).into_owned())
}
