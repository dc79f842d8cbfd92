use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::FragmentError;

/// The identity of a fragment: the timestamp range of the writes it contains and a unique id.
///
/// Displayed as the fragment name `__<t_start>_<t_end>_<uuid>`.
/// Fragments are ordered by creation: by timestamp range, then by id.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct FragmentId {
    t_start: u64,
    t_end: u64,
    uuid: Uuid,
}

impl FragmentId {
    /// Create a fragment id with a new random uuid covering the timestamps `[t_start, t_end]`.
    ///
    /// `t_end` is raised to `t_start` if it is lower.
    #[must_use]
    pub fn new(t_start: u64, t_end: u64) -> Self {
        Self {
            t_start,
            t_end: t_end.max(t_start),
            uuid: Uuid::new_v4(),
        }
    }

    /// Return the first timestamp.
    #[must_use]
    pub fn t_start(&self) -> u64 {
        self.t_start
    }

    /// Return the last timestamp.
    #[must_use]
    pub fn t_end(&self) -> u64 {
        self.t_end
    }

    /// Returns true if the timestamp range of `self` strictly contains the timestamp range of `other`.
    #[must_use]
    pub fn covers(&self, other: &FragmentId) -> bool {
        self.t_start <= other.t_start
            && other.t_end <= self.t_end
            && (self.t_start, self.t_end) != (other.t_start, other.t_end)
    }
}

impl fmt::Display for FragmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "__{}_{}_{}", self.t_start, self.t_end, self.uuid.simple())
    }
}

impl FromStr for FragmentId {
    type Err = FragmentError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = || FragmentError::InvalidName(name.to_string());
        let mut parts = name.strip_prefix("__").ok_or_else(invalid)?.split('_');
        let (Some(t_start), Some(t_end), Some(uuid), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let t_start = t_start.parse().map_err(|_| invalid())?;
        let t_end = t_end.parse().map_err(|_| invalid())?;
        let uuid = Uuid::try_parse(uuid).map_err(|_| invalid())?;
        if t_end < t_start {
            return Err(invalid());
        }
        Ok(Self {
            t_start,
            t_end,
            uuid,
        })
    }
}

impl From<FragmentId> for String {
    fn from(id: FragmentId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for FragmentId {
    type Error = FragmentError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        name.parse()
    }
}
