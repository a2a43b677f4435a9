//! Newtype identifiers for every entity in the ledger.
//!
//! Each id wraps a UUID rather than a bare `String`/`Uuid` so the type
//! checker — not a code reviewer — catches a `LeaseId` passed where a
//! `TaskId` was expected.

use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(
            Debug,
            Clone,
            Copy,
            PartialEq,
            Eq,
            Hash,
            serde::Serialize,
            serde::Deserialize,
            sqlx::Type,
        )]
        #[serde(transparent)]
        #[sqlx(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

uuid_id!(TenantId);
uuid_id!(TaskId);
uuid_id!(LeaseId);
uuid_id!(ReceiptId);

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn ids_are_distinct_newtypes_over_the_same_uuid() {
        let raw = Uuid::new_v4();
        let task = TaskId::from(raw);
        let lease = LeaseId::from(raw);
        assert_eq!(task.0, lease.0);
        // The point of the newtype is that `task` and `lease` are not the
        // same Rust type even though they wrap equal UUIDs — this is a
        // compile-time property, exercised implicitly by every store
        // signature in this crate accepting one and not the other.
    }

    #[test]
    fn display_matches_uuid_display() {
        let raw = Uuid::new_v4();
        let id = TaskId::from(raw);
        assert_eq!(id.to_string(), raw.to_string());
    }

    #[test]
    fn round_trips_through_string() {
        let id = ReceiptId::new();
        let parsed = ReceiptId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
