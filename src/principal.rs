//! Principals: the tagged union of actors that can author or receive
//! receipts, and create or claim tasks.
//!
//! Kept as a tagged pair rather than a class hierarchy — worker-vs-agent is
//! a discriminant on one type, not a subtype relationship (see DESIGN.md).

use std::fmt;

use serde::{Deserialize, Serialize};

pub const MAX_PRINCIPAL_ID_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    Agent,
    Worker,
    System,
}

impl fmt::Display for PrincipalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PrincipalKind::Agent => "agent",
            PrincipalKind::Worker => "worker",
            PrincipalKind::System => "system",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PrincipalKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "agent" => Ok(PrincipalKind::Agent),
            "worker" => Ok(PrincipalKind::Worker),
            "system" => Ok(PrincipalKind::System),
            other => Err(format!("unknown principal kind: {other}")),
        }
    }
}

/// A tagged `(kind, id)` pair identifying the author or addressee of a
/// receipt, or the creator/claimant of a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    pub kind: PrincipalKind,
    pub id: String,
}

impl Principal {
    pub fn new(kind: PrincipalKind, id: impl Into<String>) -> Result<Self, String> {
        let id = id.into();
        if id.is_empty() || id.len() > MAX_PRINCIPAL_ID_LEN {
            return Err(format!(
                "principal id must be 1..={MAX_PRINCIPAL_ID_LEN} chars, got {}",
                id.len()
            ));
        }
        if !id.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
            return Err("principal id must be printable ASCII".to_string());
        }
        Ok(Self { kind, id })
    }

    pub fn agent(id: impl Into<String>) -> Result<Self, String> {
        Self::new(PrincipalKind::Agent, id)
    }

    pub fn worker(id: impl Into<String>) -> Result<Self, String> {
        Self::new(PrincipalKind::Worker, id)
    }

    pub fn system(id: impl Into<String>) -> Result<Self, String> {
        Self::new(PrincipalKind::System, id)
    }

    pub const SYSTEM_LEDGER: &'static str = "asyncgate.ledger";
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_id() {
        assert!(Principal::agent("").is_err());
    }

    #[test]
    fn rejects_oversized_id() {
        let id = "a".repeat(MAX_PRINCIPAL_ID_LEN + 1);
        assert!(Principal::worker(id).is_err());
    }

    #[test]
    fn accepts_max_length_id() {
        let id = "a".repeat(MAX_PRINCIPAL_ID_LEN);
        assert!(Principal::worker(id).is_ok());
    }

    #[test]
    fn display_round_trips_kind() {
        let p = Principal::agent("agent-1").unwrap();
        assert_eq!(p.to_string(), "agent:agent-1");
    }

    #[test]
    fn kind_from_str_roundtrip() {
        for kind in [
            PrincipalKind::Agent,
            PrincipalKind::Worker,
            PrincipalKind::System,
        ] {
            let parsed: PrincipalKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }
}
