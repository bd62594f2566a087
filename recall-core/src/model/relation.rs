//! Typed, directed edges between entities.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{RecallError, Result};
use crate::types::{Timestamp, require_text};

/// A directed typed edge `from -> to`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    /// Source entity id.
    pub from_id: String,
    /// Target entity id.
    pub to_id: String,
    /// Edge type (`depends_on`, `fixes`, ...).
    pub relation_type: String,
    /// Edge strength (0.0 to 1.0).
    pub weight: f32,
    /// When the edge was created.
    pub created_at: Timestamp,
}

impl Relation {
    /// Validate the parts of a new edge.
    ///
    /// # Errors
    ///
    /// Returns [`RecallError::Validation`] for blank ids or type, self-loops,
    /// or a weight outside 0.0..=1.0.
    pub fn validate_parts(from: &str, to: &str, relation_type: &str, weight: f32) -> Result<()> {
        require_text("relation source", from)?;
        require_text("relation target", to)?;
        require_text("relation type", relation_type)?;
        if from == to {
            return Err(RecallError::validation(format!(
                "relation {relation_type} from {from} to itself"
            )));
        }
        crate::model::entity::check_unit("relation weight", weight)
    }

    /// The endpoint on the far side when viewed from `id`.
    #[must_use]
    pub fn other_end(&self, id: &str) -> Option<(&str, Direction)> {
        if self.from_id == id {
            Some((&self.to_id, Direction::Outgoing))
        } else if self.to_id == id {
            Some((&self.from_id, Direction::Incoming))
        } else {
            None
        }
    }
}

/// Which way an edge points relative to the entity it was reached from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// `current -> neighbor`.
    Outgoing,
    /// `neighbor -> current`.
    Incoming,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Outgoing => "outgoing",
            Self::Incoming => "incoming",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now;

    #[test]
    fn other_end_reports_direction() {
        let r = Relation {
            from_id: "a".into(),
            to_id: "b".into(),
            relation_type: "uses".into(),
            weight: 1.0,
            created_at: now(),
        };
        assert_eq!(r.other_end("a"), Some(("b", Direction::Outgoing)));
        assert_eq!(r.other_end("b"), Some(("a", Direction::Incoming)));
        assert_eq!(r.other_end("c"), None);
    }

    #[test]
    fn rejects_bad_parts() {
        assert!(Relation::validate_parts("a", "a", "uses", 1.0).is_err());
        assert!(Relation::validate_parts("a", "b", " ", 1.0).is_err());
        assert!(Relation::validate_parts("a", "b", "uses", f32::NAN).is_err());
        assert!(Relation::validate_parts("a", "b", "uses", 0.5).is_ok());
    }
}
