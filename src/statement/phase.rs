use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use super::{tags, Statement, StatementBehavior};

/// Transaction stage a statement tree is bound to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Unknown,
    Preflight,
    Request,
    Response,
    LogManager,
    LogAgent,
}

impl Phase {
    /// Element tag of the phase root, empty for `Unknown`.
    pub fn tag(self) -> &'static str {
        match self {
            Phase::Unknown => "",
            Phase::Preflight => tags::PREFLIGHT_PHASE,
            Phase::Request => tags::REQUEST_PHASE,
            Phase::Response => tags::RESPONSE_PHASE,
            Phase::LogManager => tags::LOG_MANAGER_PHASE,
            Phase::LogAgent => tags::LOG_AGENT_PHASE,
        }
    }

    pub fn from_tag(tag: &str) -> Option<Phase> {
        Self::roots().find(|phase| phase.tag() == tag)
    }

    /// Every phase that has a root element.
    pub fn roots() -> impl Iterator<Item = Phase> {
        Phase::iter().filter(|phase| *phase != Phase::Unknown)
    }
}

/// Root of a phase tree. Only valid at the top of a script.
#[derive(Debug)]
pub struct PhaseStatement {
    phase: Phase,
}

impl PhaseStatement {
    pub fn new(phase: Phase) -> Self {
        Self { phase }
    }
}

impl StatementBehavior for PhaseStatement {
    fn own_phase(&self) -> Option<Phase> {
        Some(self.phase)
    }

    fn accepts_parent(&self, parent: Option<&Statement>) -> bool {
        parent.is_none()
    }
}

/// Legacy request transform container; runs its children in order.
#[derive(Debug)]
pub struct BlockStatement;

impl StatementBehavior for BlockStatement {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_phase_tags_round_trip() {
        for phase in Phase::roots() {
            assert_eq!(Phase::from_tag(phase.tag()), Some(phase));
        }
        assert_eq!(Phase::from_tag(tags::IF), None);
        assert_eq!(Phase::from_tag(""), None);
        assert_eq!(Phase::from_str("log_manager").unwrap(), Phase::LogManager);
        assert_eq!(Phase::Request.to_string(), "request");
    }
}
