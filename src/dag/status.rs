//! Per-object status conditions emitted by a build.
//!
//! The builder only collects these; writing them back to the orchestrator is
//! the status writer's job.

use crate::errors::InvalidReason;
use crate::k8s::{ObjectKind, ObjectRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

/// One condition on one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCondition {
    pub kind: ObjectKind,
    pub name: String,
    pub namespace: String,
    pub condition_type: String,
    pub status: ConditionStatus,
    pub reason: String,
    pub message: String,
    pub observed_generation: Option<i64>,
}

impl StatusCondition {
    /// The object compiled cleanly into the DAG.
    pub fn valid(kind: ObjectKind, target: &ObjectRef, generation: Option<i64>) -> Self {
        Self {
            kind,
            name: target.name.clone(),
            namespace: target.namespace.clone(),
            condition_type: "Valid".to_string(),
            status: ConditionStatus::True,
            reason: "Valid".to_string(),
            message: format!("valid {}", kind),
            observed_generation: generation,
        }
    }

    /// The object (or a part of it) was rejected.
    pub fn invalid(
        kind: ObjectKind,
        target: &ObjectRef,
        reason: InvalidReason,
        message: impl Into<String>,
        generation: Option<i64>,
    ) -> Self {
        Self {
            kind,
            name: target.name.clone(),
            namespace: target.namespace.clone(),
            condition_type: "Valid".to_string(),
            status: ConditionStatus::False,
            reason: reason.to_string(),
            message: message.into(),
            observed_generation: generation,
        }
    }

    /// A child HTTPProxy no root includes.
    pub fn orphaned(kind: ObjectKind, target: &ObjectRef, generation: Option<i64>) -> Self {
        Self {
            kind,
            name: target.name.clone(),
            namespace: target.namespace.clone(),
            condition_type: "Valid".to_string(),
            status: ConditionStatus::Unknown,
            reason: InvalidReason::OrphanedChild.to_string(),
            message: "this HTTPProxy is not included by any root".to_string(),
            observed_generation: generation,
        }
    }

    pub fn target(&self) -> ObjectRef {
        ObjectRef::new(self.namespace.clone(), self.name.clone())
    }

    pub fn is_valid(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_constructors() {
        let target = ObjectRef::new("default", "web");
        let valid = StatusCondition::valid(ObjectKind::HttpProxy, &target, Some(3));
        assert!(valid.is_valid());
        assert_eq!(valid.observed_generation, Some(3));
        assert_eq!(valid.message, "valid HTTPProxy");

        // The message names the kind it was built for, not a fixed one.
        let valid = StatusCondition::valid(ObjectKind::ExtensionService, &target, None);
        assert_eq!(valid.message, "valid ExtensionService");
        let valid = StatusCondition::valid(ObjectKind::HttpRoute, &target, None);
        assert_eq!(valid.message, "valid HTTPRoute");

        let invalid = StatusCondition::invalid(
            ObjectKind::HttpProxy,
            &target,
            InvalidReason::PrefixOutsideParent,
            "route '/other' is outside the inclusion prefix '/api'",
            Some(3),
        );
        assert!(!invalid.is_valid());
        assert_eq!(invalid.reason, "PrefixOutsideParent");
        assert_eq!(invalid.target(), target);
    }
}
