//! Forwarding element identifier.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a switch (datapath) in the fabric.
///
/// Parses either a plain decimal number or the `openflow:<n>` node form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwitchId(u64);

impl SwitchId {
    pub const fn new(id: u64) -> Self {
        SwitchId(id)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SwitchId {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("openflow:").unwrap_or(s);
        digits
            .parse::<u64>()
            .map(SwitchId)
            .map_err(|_| ParseError::InvalidSwitchId(s.to_string()))
    }
}

impl From<u64> for SwitchId {
    fn from(id: u64) -> Self {
        SwitchId(id)
    }
}
