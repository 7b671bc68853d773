//! Resource lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a resource.
///
/// Transitions are plugin-defined; the broker core persists whatever the
/// plugin returns and never enforces an ordering. The declaration order is
/// only meaningful for display and metric grouping.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    #[default]
    Pending,
    Booting,
    Serving,
    Deleting,
    Deleted,
    Terminating,
    Terminated,
    Unknown,
    Error,
}

impl ResourceState {
    /// All states, in display order.
    pub const ALL: [ResourceState; 9] = [
        ResourceState::Pending,
        ResourceState::Booting,
        ResourceState::Serving,
        ResourceState::Deleting,
        ResourceState::Deleted,
        ResourceState::Terminating,
        ResourceState::Terminated,
        ResourceState::Unknown,
        ResourceState::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Booting => "booting",
            Self::Serving => "serving",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_round_trip() {
        for state in ResourceState::ALL {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{state}\""));
            let parsed: ResourceState = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, state);
        }
    }

    #[test]
    fn test_default_is_pending() {
        assert_eq!(ResourceState::default(), ResourceState::Pending);
    }

    #[test]
    fn test_display_order() {
        assert!(ResourceState::Pending < ResourceState::Serving);
        assert!(ResourceState::Serving < ResourceState::Deleted);
    }
}
