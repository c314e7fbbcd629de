//! Fixed graph vocabulary: node labels (pools) and relationship verbs

use serde::{Deserialize, Serialize};

use super::GraphError;

/// Node label. The first seven are the pool vocabulary that typed entities
/// come from; `Rights` marks provenance nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeLabel {
    Idea,
    Manifest,
    Experience,
    Practice,
    Person,
    Place,
    Term,
    Rights,
}

impl NodeLabel {
    pub const ALL: [NodeLabel; 8] = [
        NodeLabel::Idea,
        NodeLabel::Manifest,
        NodeLabel::Experience,
        NodeLabel::Practice,
        NodeLabel::Person,
        NodeLabel::Place,
        NodeLabel::Term,
        NodeLabel::Rights,
    ];

    pub const POOLS: [NodeLabel; 7] = [
        NodeLabel::Idea,
        NodeLabel::Manifest,
        NodeLabel::Experience,
        NodeLabel::Practice,
        NodeLabel::Person,
        NodeLabel::Place,
        NodeLabel::Term,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeLabel::Idea => "Idea",
            NodeLabel::Manifest => "Manifest",
            NodeLabel::Experience => "Experience",
            NodeLabel::Practice => "Practice",
            NodeLabel::Person => "Person",
            NodeLabel::Place => "Place",
            NodeLabel::Term => "Term",
            NodeLabel::Rights => "Rights",
        }
    }

    /// Case-insensitive parse of any label
    pub fn from_str(s: &str) -> Result<Self, GraphError> {
        let wanted = s.trim();
        NodeLabel::ALL
            .iter()
            .find(|label| label.as_str().eq_ignore_ascii_case(wanted))
            .copied()
            .ok_or_else(|| GraphError::UnknownLabel(s.to_string()))
    }

    /// Parse a pool name coming from extraction; `Rights` is not a pool
    pub fn pool(s: &str) -> Result<Self, GraphError> {
        match Self::from_str(s)? {
            NodeLabel::Rights => Err(GraphError::UnknownLabel(s.to_string())),
            label => Ok(label),
        }
    }

    pub fn is_pool(&self) -> bool {
        !matches!(self, NodeLabel::Rights)
    }
}

impl std::fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Relationship type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verb {
    Expresses,
    Embodies,
    Informs,
    Practices,
    LocatedIn,
    AuthoredBy,
    Defines,
    RelatesTo,
    ContrastsWith,
    /// Structural entity → rights edge; never produced by extraction
    GovernedBy,
}

impl Verb {
    /// Verbs extraction may produce
    pub const DOMAIN: [Verb; 9] = [
        Verb::Expresses,
        Verb::Embodies,
        Verb::Informs,
        Verb::Practices,
        Verb::LocatedIn,
        Verb::AuthoredBy,
        Verb::Defines,
        Verb::RelatesTo,
        Verb::ContrastsWith,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Expresses => "EXPRESSES",
            Verb::Embodies => "EMBODIES",
            Verb::Informs => "INFORMS",
            Verb::Practices => "PRACTICES",
            Verb::LocatedIn => "LOCATED_IN",
            Verb::AuthoredBy => "AUTHORED_BY",
            Verb::Defines => "DEFINES",
            Verb::RelatesTo => "RELATES_TO",
            Verb::ContrastsWith => "CONTRASTS_WITH",
            Verb::GovernedBy => "GOVERNED_BY",
        }
    }

    /// Parse a domain verb. Accepts `located in`, `located-in`, `LOCATED_IN`.
    /// The structural verb is rejected.
    pub fn domain(s: &str) -> Result<Self, GraphError> {
        let wanted: String = s
            .trim()
            .chars()
            .map(|c| {
                if c == ' ' || c == '-' {
                    '_'
                } else {
                    c.to_ascii_uppercase()
                }
            })
            .collect();
        Verb::DOMAIN
            .iter()
            .find(|verb| verb.as_str() == wanted)
            .copied()
            .ok_or_else(|| GraphError::UnknownVerb(s.to_string()))
    }

    pub fn is_bidirectional(&self) -> bool {
        matches!(self, Verb::RelatesTo | Verb::ContrastsWith)
    }

    pub fn is_structural(&self) -> bool {
        matches!(self, Verb::GovernedBy)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Name as written to the graph: trimmed, inner whitespace collapsed
pub fn canonical_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Dedup key: lowercase, punctuation to space, whitespace collapsed
pub fn normalize_name(name: &str) -> String {
    let spaced: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_lowercase().next().unwrap_or(c)
            } else {
                ' '
            }
        })
        .collect();
    canonical_name(&spaced)
}
