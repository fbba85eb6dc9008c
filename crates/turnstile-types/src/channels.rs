use serde::{Deserialize, Serialize};

/// Sentinel scope code that expands to every configured channel.
pub const ALL_CHANNELS: &str = "all";

/// A content channel the engine can gate: short code plus display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub code: String,
    pub name: String,
}

/// The fixed set of concrete channels, supplied at startup and immutable
/// afterwards. Order is preserved for display and for `all` expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSet {
    channels: Vec<Channel>,
}

impl ChannelSet {
    pub fn new(channels: Vec<Channel>) -> Self {
        Self { channels }
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.channels.iter().map(|c| c.code.as_str())
    }

    pub fn contains(&self, code: &str) -> bool {
        self.channels.iter().any(|c| c.code == code)
    }

    pub fn name_of(&self, code: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|c| c.code == code)
            .map(|c| c.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Channel> {
        self.channels.iter()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Target of a grant: one concrete channel, or the whole configured set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scope {
    All,
    Channel(String),
}

impl Scope {
    /// Parse a raw scope code against the configured set. `all` maps to the
    /// full expansion; anything else must be a recognized channel code.
    pub fn parse(raw: &str, channels: &ChannelSet) -> Option<Self> {
        if raw == ALL_CHANNELS {
            return Some(Scope::All);
        }
        channels
            .contains(raw)
            .then(|| Scope::Channel(raw.to_string()))
    }

    /// The concrete channel codes this scope covers.
    pub fn expand<'a>(&'a self, channels: &'a ChannelSet) -> Vec<&'a str> {
        match self {
            Scope::All => channels.codes().collect(),
            Scope::Channel(code) => vec![code.as_str()],
        }
    }
}
