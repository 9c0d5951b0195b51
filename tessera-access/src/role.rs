// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The two roles which can be granted in an access controller.
///
/// The set is closed. Unknown role names are rejected when parsing and when decoding grants
/// received from remote peers. A greater role contains all permissions of the lower one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    /// Permission to write to the governed log.
    Member,

    /// Permission to write and to grant any role to anyone.
    Moderator,
}

impl Role {
    pub const MEMBER: &'static str = "MEMBER";

    pub const MODERATOR: &'static str = "MODERATOR";

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => Self::MEMBER,
            Role::Moderator => Self::MODERATOR,
        }
    }

    /// Returns `true` if this role may grant roles.
    pub fn is_moderator(&self) -> bool {
        matches!(self, Role::Moderator)
    }

    /// Returns `true` if this role may write. Moderators are members as well.
    pub fn is_member(&self) -> bool {
        *self >= Role::Member
    }
}

impl FromStr for Role {
    type Err = RoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            Self::MEMBER => Ok(Role::Member),
            Self::MODERATOR => Ok(Role::Moderator),
            other => Err(RoleError::InvalidRole(other.to_string())),
        }
    }
}

impl TryFrom<&str> for Role {
    type Error = RoleError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Role {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Role {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoleError {
    #[error("invalid role \"{0}\", expected MODERATOR or MEMBER")]
    InvalidRole(String),
}

#[cfg(test)]
mod tests {
    use tessera_core::cbor::{decode_cbor, encode_cbor};

    use super::{Role, RoleError};

    #[test]
    fn closed_role_set() {
        assert_eq!("MODERATOR".parse::<Role>(), Ok(Role::Moderator));
        assert_eq!("MEMBER".parse::<Role>(), Ok(Role::Member));
        assert_eq!(
            "ADMIN".parse::<Role>(),
            Err(RoleError::InvalidRole("ADMIN".into()))
        );
        // Role names are case-sensitive.
        assert!("member".parse::<Role>().is_err());
    }

    #[test]
    fn moderator_contains_member() {
        assert!(Role::Moderator > Role::Member);
        assert_eq!(Role::Member.max(Role::Moderator), Role::Moderator);

        assert!(Role::Moderator.is_member());
        assert!(Role::Member.is_member());
        assert!(Role::Moderator.is_moderator());
        assert!(!Role::Member.is_moderator());
    }

    #[test]
    fn unknown_roles_fail_decoding() {
        let bytes = encode_cbor(&Role::Moderator).unwrap();
        assert_eq!(decode_cbor::<Role, _>(&bytes[..]).unwrap(), Role::Moderator);

        let bytes = encode_cbor(&"OWNER").unwrap();
        assert!(decode_cbor::<Role, _>(&bytes[..]).is_err());
    }
}
