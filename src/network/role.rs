// src/network/role.rs

use serde::{Deserialize, Serialize};
use std::fmt;

/// Capability bitmask negotiated during the identity handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Role(u8);

impl Role {
    pub const NONE: Role = Role(0);
    pub const POLICY_ELEMENT: Role = Role(1);
    pub const POLICY_REPOSITORY: Role = Role(2);
    pub const ENDPOINT_REGISTRY: Role = Role(4);
    pub const OBSERVER: Role = Role(8);

    const NAMED: [(Role, &'static str); 4] = [
        (Role::POLICY_ELEMENT, "policy_element"),
        (Role::POLICY_REPOSITORY, "policy_repository"),
        (Role::ENDPOINT_REGISTRY, "endpoint_registry"),
        (Role::OBSERVER, "observer"),
    ];

    pub const fn from_bits(bits: u8) -> Role {
        Role(bits & 0x0f)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn union(self, other: Role) -> Role {
        Role(self.0 | other.0)
    }

    /// True when every capability in `other` is present.
    pub const fn contains(self, other: Role) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn from_name(name: &str) -> Option<Role> {
        Self::NAMED
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(r, _)| *r)
    }

    /// Parse a list of wire role names; unknown names are an error.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Role, String> {
        names.iter().try_fold(Role::NONE, |acc, n| {
            Role::from_name(n.as_ref())
                .map(|r| acc.union(r))
                .ok_or_else(|| format!("unknown role '{}'", n.as_ref()))
        })
    }

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMED
            .iter()
            .filter(|(r, _)| self.contains(*r))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl std::ops::BitOr for Role {
    type Output = Role;

    fn bitor(self, rhs: Role) -> Role {
        self.union(rhs)
    }
}

impl TryFrom<Vec<String>> for Role {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        Role::from_names(&names)
    }
}

impl From<Role> for Vec<String> {
    fn from(role: Role) -> Self {
        role.names().into_iter().map(String::from).collect()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        write!(f, "{}", self.names().join("|"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_bitmask() {
        let role = Role::from_names(&["policy_element", "observer"]).unwrap();
        assert!(role.contains(Role::POLICY_ELEMENT));
        assert!(role.contains(Role::OBSERVER));
        assert!(!role.contains(Role::POLICY_REPOSITORY));
        assert_eq!(role.names(), vec!["policy_element", "observer"]);
    }

    #[test]
    fn unknown_role_name_is_rejected() {
        assert!(Role::from_names(&["policy_element", "janitor"]).is_err());
    }

    #[test]
    fn empty_role_contains_nothing() {
        assert!(!Role::NONE.contains(Role::NONE));
        assert!(!Role::NONE.contains(Role::OBSERVER));
        assert_eq!(Role::NONE.to_string(), "none");
    }

    #[test]
    fn serde_uses_name_lists() {
        let role = Role::POLICY_REPOSITORY | Role::ENDPOINT_REGISTRY;
        let json = serde_json::to_string(&role).unwrap();
        assert_eq!(json, r#"["policy_repository","endpoint_registry"]"#);
        let back: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(back, role);
    }
}
