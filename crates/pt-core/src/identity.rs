//! Identity presented to the tunnel server

use std::fmt;

/// The SSH username for a tunnel session: `<secret>:<subdomain-or-name>`
///
/// Carries the shared secret: there is no `Display` impl and `Debug` only
/// shows the label.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    username: String,
    label_start: usize,
}

impl Identity {
    /// Compose an identity from the shared secret and the tunnel label
    pub fn new(secret: &str, label: &str) -> Self {
        Self {
            username: format!("{}:{}", secret, label),
            label_start: secret.len() + 1,
        }
    }

    /// The full username sent during SSH authentication
    pub fn username(&self) -> &str {
        &self.username
    }

    /// The subdomain or name part, safe to log
    pub fn label(&self) -> &str {
        &self.username[self.label_start..]
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("secret", &"<redacted>")
            .field("label", &self.label())
            .finish()
    }
}
