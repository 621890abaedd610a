use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// An identity (profile) that allocates credit or receives ratings.
    IdentityId
);
string_id!(
    /// Anything that can receive an allocation: a drop or an identity.
    TargetId
);
string_id!(
    /// The enclosing context of an allocation, e.g. a wave's voting period.
    ScopeId
);
string_id!(
    /// A resolvable eligibility group.
    GroupId
);

impl From<&IdentityId> for TargetId {
    fn from(identity: &IdentityId) -> Self {
        TargetId(identity.0.clone())
    }
}
