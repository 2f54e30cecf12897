//! Action kinds a permission can grant.
//!
//! # Risk Ordering
//!
//! ```text
//! EXECUTE            → critical
//! WRITE | DELETE     → high
//! READ | SHARE | ∅   → medium
//! ```
//!
//! See [`Actions::risk_level`].

use bastion_types::RiskLevel;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Set of actions on a resource.
    ///
    /// | Action | Grant string |
    /// |--------|--------------|
    /// | [`READ`](Self::READ) | `read:<resource>` |
    /// | [`WRITE`](Self::WRITE) | `write:<resource>` |
    /// | [`EXECUTE`](Self::EXECUTE) | `execute:<resource>` |
    /// | [`DELETE`](Self::DELETE) | `delete:<resource>` |
    /// | [`SHARE`](Self::SHARE) | `share:<resource>` |
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Actions: u8 {
        /// Read the resource.
        const READ    = 0b0000_0001;
        /// Modify the resource.
        const WRITE   = 0b0000_0010;
        /// Run code against the resource.
        const EXECUTE = 0b0000_0100;
        /// Remove the resource.
        const DELETE  = 0b0000_1000;
        /// Grant others access to the resource.
        const SHARE   = 0b0001_0000;
    }
}

impl Actions {
    /// Lowercase names of the set actions, in declaration order.
    ///
    /// # Example
    ///
    /// ```
    /// use bastion_auth::Actions;
    ///
    /// let a = Actions::READ | Actions::DELETE;
    /// assert_eq!(a.names(), vec!["read", "delete"]);
    /// ```
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        const NAMES: [(Actions, &str); 5] = [
            (Actions::READ, "read"),
            (Actions::WRITE, "write"),
            (Actions::EXECUTE, "execute"),
            (Actions::DELETE, "delete"),
            (Actions::SHARE, "share"),
        ];
        NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Parses one action name (case-insensitive).
    ///
    /// # Example
    ///
    /// ```
    /// use bastion_auth::Actions;
    ///
    /// assert_eq!(Actions::parse("Execute"), Some(Actions::EXECUTE));
    /// assert_eq!(Actions::parse("exec"), Some(Actions::EXECUTE));
    /// assert_eq!(Actions::parse("launch"), None);
    /// ```
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "read" => Some(Self::READ),
            "write" => Some(Self::WRITE),
            "execute" | "exec" => Some(Self::EXECUTE),
            "delete" => Some(Self::DELETE),
            "share" => Some(Self::SHARE),
            "all" => Some(Self::all()),
            _ => None,
        }
    }

    /// Risk implied by holding these actions.
    #[must_use]
    pub fn risk_level(self) -> RiskLevel {
        if self.contains(Self::EXECUTE) {
            RiskLevel::Critical
        } else if self.intersects(Self::WRITE | Self::DELETE) {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        }
    }
}

impl std::fmt::Display for Actions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.names();
        if names.is_empty() {
            write!(f, "(none)")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_by_strongest_action() {
        assert_eq!(Actions::empty().risk_level(), RiskLevel::Medium);
        assert_eq!(Actions::READ.risk_level(), RiskLevel::Medium);
        assert_eq!((Actions::READ | Actions::SHARE).risk_level(), RiskLevel::Medium);
        assert_eq!(Actions::WRITE.risk_level(), RiskLevel::High);
        assert_eq!(Actions::DELETE.risk_level(), RiskLevel::High);
        assert_eq!(
            (Actions::WRITE | Actions::EXECUTE).risk_level(),
            RiskLevel::Critical
        );
    }

    #[test]
    fn display() {
        assert_eq!(Actions::empty().to_string(), "(none)");
        assert_eq!((Actions::READ | Actions::WRITE).to_string(), "read|write");
    }

    #[test]
    fn parse_all() {
        assert_eq!(Actions::parse("ALL"), Some(Actions::all()));
        assert_eq!(Actions::parse(""), None);
    }
}
