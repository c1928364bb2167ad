//! Migration phases and the transitions allowed between them

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Global migration milestone of a deployment.
///
/// Ordering follows the rollout sequence, which is what backup selection during
/// rollback relies on (`phase_at_creation <= rolled_back_from`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    #[default]
    Uninitialized,
    Prepared,
    Phase1,
    Phase2,
    Phase3,
    RolledBack,
}

impl MigrationPhase {
    pub const ROLLOUT_SEQUENCE: [MigrationPhase; 4] = [
        MigrationPhase::Prepared,
        MigrationPhase::Phase1,
        MigrationPhase::Phase2,
        MigrationPhase::Phase3,
    ];

    /// The only phase a forward `transition` may target from `self`.
    pub fn successor(self) -> Option<MigrationPhase> {
        match self {
            MigrationPhase::Uninitialized | MigrationPhase::RolledBack => {
                Some(MigrationPhase::Prepared)
            }
            MigrationPhase::Prepared => Some(MigrationPhase::Phase1),
            MigrationPhase::Phase1 => Some(MigrationPhase::Phase2),
            MigrationPhase::Phase2 => Some(MigrationPhase::Phase3),
            MigrationPhase::Phase3 => None,
        }
    }

    pub fn can_transition_to(self, target: MigrationPhase) -> bool {
        match target {
            MigrationPhase::RolledBack => self.can_roll_back(),
            MigrationPhase::Uninitialized => false,
            _ => self.successor() == Some(target),
        }
    }

    pub fn can_roll_back(self) -> bool {
        self != MigrationPhase::Uninitialized
    }

    /// Position in the rollout; `RolledBack` ranks with `Uninitialized` as the
    /// pre-rollout baseline.
    pub fn rollout_rank(self) -> u8 {
        match self {
            MigrationPhase::Uninitialized | MigrationPhase::RolledBack => 0,
            MigrationPhase::Prepared => 1,
            MigrationPhase::Phase1 => 2,
            MigrationPhase::Phase2 => 3,
            MigrationPhase::Phase3 => 4,
        }
    }

    /// Phases a service may declare membership in.
    pub fn is_declarable(self) -> bool {
        Self::ROLLOUT_SEQUENCE.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MigrationPhase::Uninitialized => "uninitialized",
            MigrationPhase::Prepared => "prepared",
            MigrationPhase::Phase1 => "phase1",
            MigrationPhase::Phase2 => "phase2",
            MigrationPhase::Phase3 => "phase3",
            MigrationPhase::RolledBack => "rolled_back",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationPhase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "uninitialized" => Ok(MigrationPhase::Uninitialized),
            "prepared" => Ok(MigrationPhase::Prepared),
            "phase1" => Ok(MigrationPhase::Phase1),
            "phase2" => Ok(MigrationPhase::Phase2),
            "phase3" => Ok(MigrationPhase::Phase3),
            "rolled_back" | "rolledback" => Ok(MigrationPhase::RolledBack),
            other => Err(format!(
                "Invalid phase: {}. Valid options: prepared, phase1, phase2, phase3",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yare::parameterized;

    #[parameterized(
        uninitialized = { MigrationPhase::Uninitialized, Some(MigrationPhase::Prepared) },
        prepared = { MigrationPhase::Prepared, Some(MigrationPhase::Phase1) },
        phase1 = { MigrationPhase::Phase1, Some(MigrationPhase::Phase2) },
        phase2 = { MigrationPhase::Phase2, Some(MigrationPhase::Phase3) },
        phase3 = { MigrationPhase::Phase3, None },
        rolled_back = { MigrationPhase::RolledBack, Some(MigrationPhase::Prepared) },
    )]
    fn test_successor(from: MigrationPhase, expected: Option<MigrationPhase>) {
        assert_eq!(from.successor(), expected);
    }

    #[test]
    fn test_no_phase_skipping() {
        assert!(!MigrationPhase::Prepared.can_transition_to(MigrationPhase::Phase3));
        assert!(!MigrationPhase::Uninitialized.can_transition_to(MigrationPhase::Phase1));
        assert!(!MigrationPhase::Phase2.can_transition_to(MigrationPhase::Phase1));
        assert!(MigrationPhase::Phase1.can_transition_to(MigrationPhase::Phase2));
    }

    #[test]
    fn test_rollback_allowed_except_uninitialized() {
        assert!(!MigrationPhase::Uninitialized.can_transition_to(MigrationPhase::RolledBack));
        for phase in MigrationPhase::ROLLOUT_SEQUENCE {
            assert!(phase.can_transition_to(MigrationPhase::RolledBack));
        }
    }

    #[test]
    fn test_ordering_follows_rollout() {
        assert!(MigrationPhase::Prepared < MigrationPhase::Phase1);
        assert!(MigrationPhase::Phase1 < MigrationPhase::Phase3);
    }

    #[test]
    fn test_rolled_back_ranks_as_baseline() {
        assert_eq!(
            MigrationPhase::RolledBack.rollout_rank(),
            MigrationPhase::Uninitialized.rollout_rank()
        );
        assert!(MigrationPhase::Prepared.rollout_rank() < MigrationPhase::Phase1.rollout_rank());
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("phase2".parse::<MigrationPhase>(), Ok(MigrationPhase::Phase2));
        assert_eq!("Rolled-Back".parse::<MigrationPhase>(), Ok(MigrationPhase::RolledBack));
        assert!("phase4".parse::<MigrationPhase>().is_err());
        assert_eq!(MigrationPhase::RolledBack.to_string(), "rolled_back");
    }

    #[test]
    fn test_serde_snake_case() {
        let json = serde_json::to_string(&MigrationPhase::RolledBack).unwrap();
        assert_eq!(json, "\"rolled_back\"");
        let parsed: MigrationPhase = serde_yaml::from_str("phase1").unwrap();
        assert_eq!(parsed, MigrationPhase::Phase1);
    }
}
