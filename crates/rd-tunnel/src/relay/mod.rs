//! Relay Pod lifecycle
//!
//! The relay Pod runs an SSH server inside the cluster. Its log announces the
//! user the server accepts the session key for; the local control port is
//! forwarded to it once it is ready.

mod forwarder;
pub mod manifest;

use std::sync::LazyLock;

use regex::Regex;

pub use forwarder::RelayPodForwarder;
pub use manifest::{pod_name, relay_pod, relay_selector};

static CONTAINER_USER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Current container user is: (\S+)").expect("container user pattern is valid")
});

/// Extract the tunnel user from a relay log line
pub fn container_user(line: &str) -> Option<&str> {
    CONTAINER_USER_REGEX
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|user| user.as_str())
}
