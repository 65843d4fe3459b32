//! Provider capability flags and the bitset used for routing filters.

use serde::{Deserialize, Serialize};

/// A boolean attribute a provider can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    Vision,
    Thinking,
    Tools,
    Streaming,
    JsonMode,
    FunctionCalling,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Vision,
        Capability::Thinking,
        Capability::Tools,
        Capability::Streaming,
        Capability::JsonMode,
        Capability::FunctionCalling,
    ];

    fn bit(self) -> u8 {
        match self {
            Capability::Vision => 1 << 0,
            Capability::Thinking => 1 << 1,
            Capability::Tools => 1 << 2,
            Capability::Streaming => 1 << 3,
            Capability::JsonMode => 1 << 4,
            Capability::FunctionCalling => 1 << 5,
        }
    }
}

/// A set of capabilities, stored as a bitmask.
///
/// Serialized as a list of capability names so configs stay readable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Capability::ALL.iter().copied().collect()
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    pub fn with(mut self, cap: Capability) -> Self {
        self.insert(cap);
        self
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    /// True when every capability in `required` is present here.
    pub fn contains_all(&self, required: CapabilitySet) -> bool {
        self.0 & required.0 == required.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.iter().copied().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        let mut set = CapabilitySet::empty();
        for cap in iter {
            set.insert(cap);
        }
        set
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let caps = Vec::<Capability>::deserialize(deserializer)?;
        Ok(caps.into_iter().collect())
    }
}
