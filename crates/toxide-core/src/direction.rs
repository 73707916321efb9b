//! Traffic direction through a proxy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ToxicError;

/// Which half of a connection a toxic applies to.
///
/// `Upstream` is client → destination traffic, `Downstream` is
/// destination → client traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upstream,
    #[default]
    Downstream,
}

impl Direction {
    /// Both directions, upstream first.
    pub const ALL: [Direction; 2] = [Direction::Upstream, Direction::Downstream];

    /// Returns the wire name of this direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = ToxicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upstream" => Ok(Direction::Upstream),
            "downstream" => Ok(Direction::Downstream),
            other => Err(ToxicError::InvalidDirection(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wire_names() {
        assert_eq!("upstream".parse::<Direction>().unwrap(), Direction::Upstream);
        assert_eq!(
            "downstream".parse::<Direction>().unwrap(),
            Direction::Downstream
        );
        assert!(matches!(
            "sideways".parse::<Direction>(),
            Err(ToxicError::InvalidDirection(_))
        ));
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Direction::Upstream).unwrap(),
            "\"upstream\""
        );
        let d: Direction = serde_json::from_str("\"downstream\"").unwrap();
        assert_eq!(d, Direction::Downstream);
    }
}
