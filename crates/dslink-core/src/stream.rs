use serde::{Deserialize, Serialize};

/// Lifecycle marker of a response stream.
///
/// `Initialized` is the wire default: a response without a `stream` field is
/// read as initialized, and an initialized response is written without one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    #[default]
    Initialized,
    Open,
    Closed,
}

impl StreamState {
    pub fn is_initialized(&self) -> bool {
        matches!(self, Self::Initialized)
    }

    /// Whether more updates may follow on this rid.
    pub fn is_live(&self) -> bool {
        !matches!(self, Self::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}
