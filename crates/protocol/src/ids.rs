//! Hash-derived identifiers

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! hash_identifier {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap an already computed identifier
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Derive the identifier by hashing the given parts
            pub fn from_parts<I>(parts: I) -> Self
            where
                I: IntoIterator,
                I::Item: AsRef<str>,
            {
                Self(crate::hash::hash(parts))
            }

            /// Borrow the encoded identifier
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

hash_identifier!(
    /// Identifier of a signed message, `Hash(data, signature)`
    MessageId
);

hash_identifier!(
    /// Identifier of a consensus instance
    InstanceId
);

hash_identifier!(
    /// Identifier of a Local Autonomous Organization
    LaoId
);
