//! Capabilities: named features a device advertises in its announcement.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A feature a device supports, e.g. `"PUT /action/ping"`. Equality is by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability {
    name: String,
}

impl Capability {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Capability advertised by a node that accepts the named action. The name is
    /// percent-encoded as in the request path the action is sent on.
    pub fn for_action(action: &str) -> Self {
        Self::new(format!(
            "PUT {}{}",
            crate::action::ACTION_PATH_PREFIX,
            urlencoding::encode(action)
        ))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Capability {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}
