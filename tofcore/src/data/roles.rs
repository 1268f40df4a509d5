use std::fmt;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Auxiliary signal roles every complete event must carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuxRole {
    /// Reference timer (microchannel plate)
    Mcp,
    X1,
    X2,
    Y1,
    Y2,
}

impl AuxRole {
    /// All auxiliary roles in classification priority order.
    pub const ALL: [AuxRole; 5] = [AuxRole::Mcp, AuxRole::X1, AuxRole::X2, AuxRole::Y1, AuxRole::Y2];

    pub fn index(&self) -> usize {
        match self {
            AuxRole::Mcp => 0,
            AuxRole::X1 => 1,
            AuxRole::X2 => 2,
            AuxRole::Y1 => 3,
            AuxRole::Y2 => 4,
        }
    }
}

impl Display for AuxRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AuxRole::Mcp => write!(f, "MCP"),
            AuxRole::X1 => write!(f, "X1"),
            AuxRole::X2 => write!(f, "X2"),
            AuxRole::Y1 => write!(f, "Y1"),
            AuxRole::Y2 => write!(f, "Y2"),
        }
    }
}

/// Semantic label of a channel inside one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    Aux(AuxRole),
    /// Detector with a 0-based index
    Detector(usize),
}

/// Channel ids carrying the auxiliary roles.
///
/// Detector roles are implicit: every channel id below the detector count that
/// is not an auxiliary channel is the detector with the same 0-based index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMap {
    pub mcp: u8,
    pub x1: u8,
    pub x2: u8,
    pub y1: u8,
    pub y2: u8,
}

impl Default for RoleMap {
    fn default() -> Self {
        RoleMap { mcp: 28, x1: 24, x2: 25, y1: 26, y2: 27 }
    }
}

impl RoleMap {
    pub fn new(mcp: u8, x1: u8, x2: u8, y1: u8, y2: u8) -> Self {
        RoleMap { mcp, x1, x2, y1, y2 }
    }

    pub fn channel(&self, role: AuxRole) -> u8 {
        match role {
            AuxRole::Mcp => self.mcp,
            AuxRole::X1 => self.x1,
            AuxRole::X2 => self.x2,
            AuxRole::Y1 => self.y1,
            AuxRole::Y2 => self.y2,
        }
    }

    /// Classifies a channel id. The first matching role wins, in the order
    /// MCP, X1, X2, Y1, Y2, detector; unknown channels yield `None`.
    pub fn classify(&self, channel_id: u8, detector_count: usize) -> Option<Role> {
        for role in AuxRole::ALL {
            if self.channel(role) == channel_id {
                return Some(Role::Aux(role));
            }
        }
        let index = channel_id as usize;
        if index < detector_count {
            Some(Role::Detector(index))
        } else {
            None
        }
    }

    /// Channel ids claimed by more than one role, with the roles that lose to
    /// the classification priority.
    pub fn collisions(&self, detector_count: usize) -> Vec<(u8, Vec<String>)> {
        let mut out: Vec<(u8, Vec<String>)> = Vec::new();
        for (i, role) in AuxRole::ALL.iter().enumerate() {
            let channel = self.channel(*role);
            if out.iter().any(|(c, _)| *c == channel) {
                continue;
            }
            let mut shadowed: Vec<String> = AuxRole::ALL[i + 1..]
                .iter()
                .filter(|other| self.channel(**other) == channel)
                .map(|other| other.to_string())
                .collect();
            if (channel as usize) < detector_count {
                shadowed.push(format!("detector {}", channel));
            }
            if !shadowed.is_empty() {
                out.push((channel, shadowed));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_priority() {
        let roles = RoleMap::new(3, 4, 5, 6, 3);
        assert_eq!(roles.classify(3, 10), Some(Role::Aux(AuxRole::Mcp)));
        assert_eq!(roles.classify(4, 10), Some(Role::Aux(AuxRole::X1)));
        assert_eq!(roles.classify(2, 10), Some(Role::Detector(2)));
        assert_eq!(roles.classify(12, 10), None);
    }

    #[test]
    fn test_collisions_reported() {
        let roles = RoleMap::new(3, 4, 5, 6, 3);
        let collisions = roles.collisions(10);
        // channel 3 claimed by MCP, Y2 and detector 3; 4,5,6 shadow detectors
        assert_eq!(collisions.len(), 4);
        assert_eq!(collisions[0].0, 3);
        assert_eq!(collisions[0].1, vec!["Y2".to_string(), "detector 3".to_string()]);
    }

    #[test]
    fn test_default_has_no_collisions_below_24() {
        let roles = RoleMap::default();
        assert!(roles.collisions(23).is_empty());
        assert_eq!(roles.collisions(25).len(), 1);
    }
}
