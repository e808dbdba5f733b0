use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::metrics::APPROVALS_PENDING;

/// Decides whether a principal may resolve a gate restricted to some roles
pub trait Authorizer: Send + Sync {
    fn is_authorized(&self, principal: &str, roles: &[String]) -> bool;
}

/// Principal -> roles table
#[derive(Debug, Default)]
pub struct StaticRoleAuthorizer {
    grants: RwLock<HashMap<String, HashSet<String>>>,
}

impl StaticRoleAuthorizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(principals: &HashMap<String, Vec<String>>) -> Self {
        let grants = principals
            .iter()
            .map(|(principal, roles)| (principal.clone(), roles.iter().cloned().collect()))
            .collect();
        Self {
            grants: RwLock::new(grants),
        }
    }

    pub fn grant(&self, principal: impl Into<String>, role: impl Into<String>) {
        self.grants
            .write()
            .entry(principal.into())
            .or_default()
            .insert(role.into());
    }
}

impl Authorizer for StaticRoleAuthorizer {
    fn is_authorized(&self, principal: &str, roles: &[String]) -> bool {
        let grants = self.grants.read();
        grants
            .get(principal)
            .map(|held| roles.iter().any(|r| held.contains(r)))
            .unwrap_or(false)
    }
}

/// Authorizer that accepts every principal
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllAuthorizer;

impl Authorizer for AllowAllAuthorizer {
    fn is_authorized(&self, _principal: &str, _roles: &[String]) -> bool {
        true
    }
}

/// A gate waiting for a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingApproval {
    pub execution_id: Uuid,
    pub action_id: String,
    pub roles: Vec<String>,
    pub requested_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

impl PendingApproval {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.map(|d| now >= d).unwrap_or(false)
    }
}

/// Approve or reject decision submitted by a principal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub approver: String,
    #[serde(default)]
    pub reason: Option<String>,
}

impl ApprovalDecision {
    pub fn approve(approver: impl Into<String>) -> Self {
        Self {
            approved: true,
            approver: approver.into(),
            reason: None,
        }
    }

    pub fn reject(approver: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            approver: approver.into(),
            reason: Some(reason.into()),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A resolved gate
#[derive(Debug, Clone)]
pub struct ApprovalResolution {
    pub pending: PendingApproval,
    pub decision: ApprovalDecision,
    pub decided_at: DateTime<Utc>,
}

/// Registry of gates awaiting a decision, at most one per execution
pub struct ApprovalGate {
    pending: DashMap<Uuid, PendingApproval>,
    authorizer: Arc<dyn Authorizer>,
    default_timeout: Option<Duration>,
}

impl ApprovalGate {
    pub fn new(authorizer: Arc<dyn Authorizer>, default_timeout: Option<Duration>) -> Self {
        Self {
            pending: DashMap::new(),
            authorizer,
            default_timeout,
        }
    }

    /// Open a gate; `timeout` overrides the default deadline
    pub fn request_approval(
        &self,
        execution_id: Uuid,
        action_id: &str,
        roles: Vec<String>,
        timeout: Option<Duration>,
    ) -> PendingApproval {
        let requested_at = Utc::now();
        let deadline = timeout
            .or(self.default_timeout)
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .and_then(|t| requested_at.checked_add_signed(t));

        let pending = PendingApproval {
            execution_id,
            action_id: action_id.to_string(),
            roles,
            requested_at,
            deadline,
        };

        info!(
            execution_id = %execution_id,
            action_id = %action_id,
            deadline = ?deadline,
            "Approval requested"
        );

        self.pending.insert(execution_id, pending.clone());
        self.refresh_gauge();
        pending
    }

    /// Re-register a gate loaded from storage
    pub fn restore(&self, pending: PendingApproval) {
        self.pending.insert(pending.execution_id, pending);
        self.refresh_gauge();
    }

    /// Resolve the gate of an execution.
    ///
    /// Fails without consuming the gate when the principal lacks a required role. An expired gate
    /// is consumed and reported as `ApprovalTimeout`.
    pub fn resolve(&self, execution_id: Uuid, decision: &ApprovalDecision) -> Result<ApprovalResolution> {
        let now = Utc::now();
        let pending = self
            .pending
            .get(&execution_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                AppError::InvalidStateTransition(format!(
                    "execution {} has no pending approval",
                    execution_id
                ))
            })?;

        if pending.is_expired(now) {
            self.pending.remove(&execution_id);
            self.refresh_gauge();
            return Err(AppError::ApprovalTimeout(format!(
                "approval for action {} of execution {} expired",
                pending.action_id, execution_id
            )));
        }

        if !pending.roles.is_empty()
            && !self.authorizer.is_authorized(&decision.approver, &pending.roles)
        {
            warn!(
                execution_id = %execution_id,
                approver = %decision.approver,
                roles = ?pending.roles,
                "Approver lacks a required role"
            );
            return Err(AppError::Authorization(format!(
                "{} may not resolve approvals requiring roles {:?}",
                decision.approver, pending.roles
            )));
        }

        let (_, pending) = self.pending.remove(&execution_id).ok_or_else(|| {
            AppError::InvalidStateTransition(format!(
                "approval for execution {} was already resolved",
                execution_id
            ))
        })?;
        self.refresh_gauge();

        info!(
            execution_id = %execution_id,
            action_id = %pending.action_id,
            approver = %decision.approver,
            approved = decision.approved,
            "Approval resolved"
        );

        Ok(ApprovalResolution {
            pending,
            decision: decision.clone(),
            decided_at: now,
        })
    }

    /// Remove and return every gate whose deadline has passed
    pub fn take_expired(&self, now: DateTime<Utc>) -> Vec<PendingApproval> {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| *entry.key())
            .collect();

        let taken: Vec<PendingApproval> = expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|(_, p)| p))
            .collect();

        if !taken.is_empty() {
            self.refresh_gauge();
        }
        taken
    }

    /// Drop the gate of an execution (cancellation)
    pub fn withdraw(&self, execution_id: Uuid) -> Option<PendingApproval> {
        let removed = self.pending.remove(&execution_id).map(|(_, p)| p);
        if removed.is_some() {
            self.refresh_gauge();
        }
        removed
    }

    pub fn get(&self, execution_id: Uuid) -> Option<PendingApproval> {
        self.pending.get(&execution_id).map(|e| e.value().clone())
    }

    pub fn pending(&self) -> Vec<PendingApproval> {
        self.pending.iter().map(|e| e.value().clone()).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn refresh_gauge(&self) {
        APPROVALS_PENDING.set(self.pending.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> ApprovalGate {
        let authorizer = StaticRoleAuthorizer::new();
        authorizer.grant("lead", "soc_lead");
        ApprovalGate::new(Arc::new(authorizer), Some(Duration::from_secs(3600)))
    }

    #[test]
    fn test_static_authorizer() {
        let mut principals = HashMap::new();
        principals.insert("alice".to_string(), vec!["soc_lead".to_string()]);
        let authorizer = StaticRoleAuthorizer::from_map(&principals);

        assert!(authorizer.is_authorized("alice", &["soc_lead".to_string(), "ciso".to_string()]));
        assert!(!authorizer.is_authorized("alice", &["ciso".to_string()]));
        assert!(!authorizer.is_authorized("bob", &["soc_lead".to_string()]));
    }

    #[test]
    fn test_resolve_checks_roles() {
        let gate = gate();
        let id = Uuid::new_v4();
        gate.request_approval(id, "block", vec!["soc_lead".to_string()], None);

        let err = gate.resolve(id, &ApprovalDecision::approve("intern")).unwrap_err();
        assert!(matches!(err, AppError::Authorization(_)));
        assert_eq!(gate.pending_count(), 1);

        let resolution = gate.resolve(id, &ApprovalDecision::approve("lead")).unwrap();
        assert_eq!(resolution.pending.action_id, "block");
        assert!(resolution.decision.approved);
        assert_eq!(gate.pending_count(), 0);

        assert!(matches!(
            gate.resolve(id, &ApprovalDecision::approve("lead")),
            Err(AppError::InvalidStateTransition(_))
        ));
    }

    #[test]
    fn test_empty_roles_allow_anyone() {
        let gate = gate();
        let id = Uuid::new_v4();
        gate.request_approval(id, "reset", vec![], None);
        assert!(gate.resolve(id, &ApprovalDecision::reject("anyone", "false positive")).is_ok());
    }

    #[test]
    fn test_expired_gate() {
        let gate = gate();
        let id = Uuid::new_v4();
        let pending = gate.request_approval(id, "block", vec![], Some(Duration::from_secs(60)));
        assert!(pending.deadline.is_some());

        let later = Utc::now() + chrono::Duration::seconds(120);
        let expired = gate.take_expired(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].execution_id, id);
        assert!(gate.take_expired(later).is_empty());
    }

    #[test]
    fn test_resolve_after_deadline_times_out() {
        let gate = gate();
        let id = Uuid::new_v4();
        let mut pending = gate.request_approval(id, "block", vec![], None);
        pending.deadline = Some(Utc::now() - chrono::Duration::seconds(1));
        gate.restore(pending);

        let err = gate.resolve(id, &ApprovalDecision::approve("lead")).unwrap_err();
        assert!(matches!(err, AppError::ApprovalTimeout(_)));
        assert!(gate.get(id).is_none());
    }

    #[test]
    fn test_no_deadline_never_expires() {
        let gate = ApprovalGate::new(Arc::new(AllowAllAuthorizer), None);
        let id = Uuid::new_v4();
        gate.request_approval(id, "block", vec!["x".to_string()], None);
        assert!(gate
            .take_expired(Utc::now() + chrono::Duration::days(365))
            .is_empty());
        assert!(gate.withdraw(id).is_some());
    }

    #[test]
    fn test_unrepresentable_timeout_has_no_deadline() {
        let gate = gate();
        for secs in [u64::MAX, 9_000_000_000_000] {
            let id = Uuid::new_v4();
            let pending = gate.request_approval(id, "block", vec![], Some(Duration::from_secs(secs)));
            assert!(pending.deadline.is_none());
        }
    }
}
