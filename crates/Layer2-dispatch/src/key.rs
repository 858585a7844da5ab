//! Dispatch keys and lanes

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;

/// Canonical identifier for one execution context (after alias resolution)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DispatchKey(String);

impl DispatchKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DispatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DispatchKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DispatchKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for DispatchKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Scheduling track for a key
///
/// The two lanes of one key are independent: each has its own live input
/// channel into the sandbox, so both may run at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Interactive, user-triggered
    Message,
    /// Background, scheduler-triggered
    Task,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Message, Lane::Task];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Message => "message",
            Lane::Task => "task",
        }
    }

    fn index(self) -> usize {
        match self {
            Lane::Message => 0,
            Lane::Task => 1,
        }
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "message" | "msg" => Ok(Lane::Message),
            "task" => Ok(Lane::Task),
            other => Err(format!("unknown lane: {}", other)),
        }
    }
}

/// Fixed-size map with one slot per lane
#[derive(Debug, Clone, Default)]
pub struct LaneMap<T> {
    slots: [T; 2],
}

impl<T> LaneMap<T> {
    pub fn get(&self, lane: Lane) -> &T {
        &self.slots[lane.index()]
    }

    pub fn get_mut(&mut self, lane: Lane) -> &mut T {
        &mut self.slots[lane.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (Lane, &T)> {
        Lane::ALL.into_iter().zip(self.slots.iter())
    }
}
