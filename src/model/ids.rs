// src/model/ids.rs
//! Opaque identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh, time-ordered id
            pub fn generate() -> Self {
                Self(format!(concat!($prefix, "_{}"), ulid::Ulid::new().to_string().to_lowercase()))
            }

            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
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
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id!(
    /// Run identifier
    RunId,
    "run"
);
string_id!(
    /// Task identifier
    TaskId,
    "task"
);
string_id!(
    /// Profile identifier
    ProfileId,
    "profile"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_prefixed_and_unique() {
        let a = RunId::generate();
        let b = RunId::generate();
        assert!(a.as_str().starts_with("run_"));
        assert_ne!(a, b);
        assert!(TaskId::generate().as_str().starts_with("task_"));
    }

    #[test]
    fn test_transparent_serde() {
        let id = ProfileId::new("P1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"P1\"");
    }
}
