//! Authorization collaborator
//!
//! Recovery approval is agent-gated. Deciding who is an agent is outside
//! this core; services only ask [`Authorizer::is_authorized`].

use std::collections::{HashMap, HashSet};

/// Operations that require authorization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    ApproveRecovery,
    RejectRecovery,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApproveRecovery => "approve recovery",
            Self::RejectRecovery => "reject recovery",
        }
    }
}

pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, principal: &str, operation: Operation) -> bool;
}

/// Fixed principal-to-operation grants
#[derive(Debug, Clone, Default)]
pub struct StaticAuthorizer {
    grants: HashMap<String, HashSet<Operation>>,
}

impl StaticAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `operations` to `principal`
    pub fn grant(mut self, principal: impl Into<String>, operations: &[Operation]) -> Self {
        self.grants
            .entry(principal.into())
            .or_default()
            .extend(operations.iter().copied());
        self
    }

    /// Grant both approve and reject to `principal`
    pub fn agent(self, principal: impl Into<String>) -> Self {
        self.grant(
            principal,
            &[Operation::ApproveRecovery, Operation::RejectRecovery],
        )
    }
}

impl Authorizer for StaticAuthorizer {
    fn is_authorized(&self, principal: &str, operation: Operation) -> bool {
        self.grants
            .get(principal)
            .map_or(false, |ops| ops.contains(&operation))
    }
}
