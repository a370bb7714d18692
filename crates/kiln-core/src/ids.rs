//! Strongly-typed identifiers for domain entities.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! define_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}_{}", $prefix, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                let uuid_str = s.strip_prefix(concat!($prefix, "_")).unwrap_or(s);
                Ok(Self(Uuid::parse_str(uuid_str)?))
            }
        }
    };
}

define_id!(RunId, "run");

/// Arena-style handle for a job instance: the template's declaration index
/// plus the instance's position within its matrix expansion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct InstanceId {
    pub job: usize,
    pub index: usize,
}

impl InstanceId {
    pub fn new(job: usize, index: usize) -> Self {
        Self { job, index }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst_{}.{}", self.job, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_display() {
        let id = RunId::new();
        let s = id.to_string();
        assert!(s.starts_with("run_"));
    }

    #[test]
    fn test_run_id_parse() {
        let id = RunId::new();
        let s = id.to_string();
        let parsed: RunId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_instance_id_orders_by_job_then_index() {
        let mut ids = vec![
            InstanceId::new(1, 0),
            InstanceId::new(0, 2),
            InstanceId::new(0, 1),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                InstanceId::new(0, 1),
                InstanceId::new(0, 2),
                InstanceId::new(1, 0)
            ]
        );
        assert_eq!(InstanceId::new(3, 4).to_string(), "inst_3.4");
    }
}
