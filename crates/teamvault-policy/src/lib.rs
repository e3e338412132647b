#![forbid(unsafe_code)]

//! Composite RBAC/ABAC/PBAC access-decision engine.
//!
//! `evaluate` resolves a request against three layers, in order: an admin
//! bypass, a legacy allow/deny policy list, and an org-scoped IAM policy
//! list (RBAC, ABAC, or PBAC documents). Follows `toka-capability-
//! delegation`'s multi-stage validation shape (several independent checks
//! accumulated into one verdict), generalized here from delegation-chain
//! validity to resource-access decisions.
//!
//! A deny anywhere in a pass short-circuits that pass; an IAM decision
//! always takes precedence over the legacy pass's verdict, mirroring the
//! IAM policy model superseding the older per-statement one. Malformed
//! policy documents are skipped with a warning and never grant access.

use serde::Deserialize;
use std::collections::HashMap;
use teamvault_repository::{error::RepositoryError, Repository};
use teamvault_types::errors::{Categorize, ErrorCategory};
use teamvault_types::{Action, Condition, Effect, IamPolicy, IamPolicyType, Policy, SubjectType};
use uuid::Uuid;

/// Errors raised while evaluating a policy request.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The repository failed to load applicable policies.
    #[error("policy backend error: {0}")]
    Backend(String),
}

impl From<RepositoryError> for PolicyError {
    fn from(err: RepositoryError) -> Self {
        PolicyError::Backend(err.to_string())
    }
}

impl Categorize for PolicyError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Backend
    }
}

/// The access decision resolved for a [`PolicyRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Access is granted, carrying a human-readable reason for audit logs.
    Allowed(String),
    /// Access is denied, carrying a human-readable reason.
    Denied(String),
}

impl Decision {
    /// `true` for [`Decision::Allowed`].
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed(_))
    }

    /// The carried reason string, regardless of variant.
    pub fn reason(&self) -> &str {
        match self {
            Decision::Allowed(r) | Decision::Denied(r) => r,
        }
    }
}

/// A request to the policy engine.
#[derive(Debug, Clone)]
pub struct PolicyRequest {
    /// Kind of principal making the request.
    pub subject_type: SubjectType,
    /// Identifier of the principal (user id or service-account id, as a string).
    pub subject_id: String,
    /// Action being attempted.
    pub action: Action,
    /// Slash-separated resource path being acted upon.
    pub resource: String,
    /// Whether the principal carries the admin bypass.
    pub is_admin: bool,
    /// The org this request is scoped to, if any. IAM policies only apply
    /// when this is present.
    pub org_id: Option<Uuid>,
    /// Free-form request attributes consulted by ABAC/PBAC conditions
    /// (`environment`, `mfa`, `ip`, `team`, `role`, ...).
    pub attributes: HashMap<String, String>,
}

/// Evaluates `request` against the legacy and (if `org_id` is set) IAM
/// policy layers, in that precedence order.
pub async fn evaluate(
    repo: &dyn Repository,
    request: &PolicyRequest,
) -> Result<Decision, PolicyError> {
    if request.is_admin {
        return Ok(Decision::Allowed("admin bypass".to_string()));
    }

    let legacy_policies = repo
        .list_legacy_policies_for_subject(request.subject_type.clone(), &request.subject_id)
        .await?;
    let (legacy_denied, legacy_allowed) = evaluate_legacy(&legacy_policies, request);

    let mut iam_denied: Option<String> = None;
    let mut iam_allowed = false;
    if let Some(org_id) = request.org_id {
        let iam_policies = repo.list_iam_policies_for_org(org_id).await?;
        for policy in &iam_policies {
            match evaluate_iam_policy(policy, request) {
                Some(Decision::Denied(reason)) => {
                    iam_denied = Some(reason);
                }
                Some(Decision::Allowed(_)) => iam_allowed = true,
                None => {}
            }
        }
    }

    if let Some(reason) = iam_denied {
        return Ok(Decision::Denied(reason));
    }
    if iam_allowed {
        return Ok(Decision::Allowed("iam policy allow".to_string()));
    }
    if legacy_denied {
        return Ok(Decision::Denied("legacy policy deny".to_string()));
    }
    if legacy_allowed {
        return Ok(Decision::Allowed("legacy policy allow".to_string()));
    }
    Ok(Decision::Denied("default deny".to_string()))
}

/// Returns `(any_deny_matched, any_allow_matched)`.
fn evaluate_legacy(policies: &[Policy], request: &PolicyRequest) -> (bool, bool) {
    let mut denied = false;
    let mut allowed = false;
    for policy in policies {
        if !action_matches(&policy.actions, request.action) {
            continue;
        }
        if !resource_matches(&policy.resource_pattern, &request.resource) {
            continue;
        }
        if !policy.conditions.is_empty() && !all_conditions_match(&policy.conditions, &request.attributes) {
            continue;
        }
        match policy.effect {
            Effect::Deny => {
                denied = true;
                break;
            }
            Effect::Allow => allowed = true,
        }
    }
    (denied, allowed)
}

/// A single rule inside an IAM policy document.
#[derive(Debug, Deserialize)]
struct IamRuleDoc {
    effect: Effect,
    path: String,
    capabilities: Vec<String>,
    #[serde(default)]
    conditions: Vec<Condition>,
}

/// The subject clause inside an IAM policy document.
#[derive(Debug, Deserialize)]
struct IamSubjectDoc {
    #[serde(rename = "type")]
    subject_type: SubjectType,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    role: Option<String>,
}

/// The full document shape: a subject clause plus one or many rules.
/// RBAC/ABAC policies conventionally carry a single `rule`; PBAC
/// conventionally carries a `rules` array. Both fields are accepted
/// regardless of `policy_type` so a document author is never penalized
/// for picking the more natural shape for a one-rule policy.
#[derive(Debug, Deserialize)]
struct IamDocument {
    subject: IamSubjectDoc,
    #[serde(default)]
    rule: Option<IamRuleDoc>,
    #[serde(default)]
    rules: Vec<IamRuleDoc>,
}

impl IamDocument {
    fn all_rules(&self) -> impl Iterator<Item = &IamRuleDoc> {
        self.rule.iter().chain(self.rules.iter())
    }
}

/// Evaluates one IAM policy against `request`, returning `None` if nothing
/// in the document matched (the policy simply does not apply) or if the
/// document is malformed (logged and skipped, never treated as a grant).
fn evaluate_iam_policy(policy: &IamPolicy, request: &PolicyRequest) -> Option<Decision> {
    let doc: IamDocument = match serde_json::from_value(policy.document.clone()) {
        Ok(doc) => doc,
        Err(err) => {
            tracing::warn!(policy = %policy.name, error = %err, "skipping malformed IAM policy document");
            return None;
        }
    };

    if doc.subject.subject_type != SubjectType::Any && doc.subject.subject_type != request.subject_type {
        return None;
    }
    if let Some(name) = &doc.subject.name {
        if request.attributes.get("name") != Some(name) {
            return None;
        }
    }
    if let Some(team) = &doc.subject.team {
        if request.attributes.get("team") != Some(team) {
            return None;
        }
    }
    if let Some(role) = &doc.subject.role {
        if request.attributes.get("role") != Some(role) {
            return None;
        }
    }

    let check_conditions = policy.policy_type != IamPolicyType::Rbac;
    let mut last_allow: Option<Decision> = None;

    for rule in doc.all_rules() {
        if !action_matches(&rule.capabilities, request.action) {
            continue;
        }
        if !resource_matches(&rule.path, &request.resource) {
            continue;
        }
        if check_conditions && !rule.conditions.is_empty() && !all_conditions_match(&rule.conditions, &request.attributes) {
            continue;
        }

        match rule.effect {
            // A matching deny overrides any allow already seen in this document.
            Effect::Deny => return Some(Decision::Denied(format!("iam policy {} denied", policy.name))),
            Effect::Allow => {
                if last_allow.is_none() {
                    last_allow = Some(Decision::Allowed(format!("iam policy {} allowed", policy.name)));
                }
            }
        }
    }

    last_allow
}

/// `true` iff `capabilities` contains `"*"` or the exact requested action.
fn action_matches(capabilities: &[String], action: Action) -> bool {
    capabilities.iter().any(|c| c == "*" || c == action.as_str())
}

/// Resource glob matching, applied in this precedence order:
/// 1. A `**` segment matches any suffix (including none) anchored at the
///    segments before it; segments before `**` may themselves use `*`.
/// 2. A pattern ending in `/*` matches its prefix followed by at least one
///    further segment.
/// 3. Otherwise, segmentwise matching: equal segment counts, each pattern
///    segment either literal or `*` (matches exactly one segment).
fn resource_matches(pattern: &str, resource: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let resource_segments: Vec<&str> = resource.split('/').collect();

    if let Some(star_pos) = pattern_segments.iter().position(|s| *s == "**") {
        let prefix = &pattern_segments[..star_pos];
        if resource_segments.len() < prefix.len() {
            return false;
        }
        return prefix
            .iter()
            .zip(resource_segments.iter())
            .all(|(p, r)| *p == "*" || *p == *r);
    }

    if let Some(prefix) = pattern.strip_suffix("/*") {
        let prefix_segments: Vec<&str> = prefix.split('/').collect();
        if resource_segments.len() <= prefix_segments.len() {
            return false;
        }
        return prefix_segments
            .iter()
            .zip(resource_segments.iter())
            .all(|(p, r)| *p == "*" || *p == *r);
    }

    if pattern_segments.len() != resource_segments.len() {
        return false;
    }
    pattern_segments
        .iter()
        .zip(resource_segments.iter())
        .all(|(p, r)| *p == "*" || *p == *r)
}

/// `true` iff every condition matches (AND). A condition referencing an
/// attribute absent from `attributes` always fails.
fn all_conditions_match(conditions: &[Condition], attributes: &HashMap<String, String>) -> bool {
    conditions.iter().all(|c| condition_matches(c, attributes))
}

fn condition_matches(condition: &Condition, attributes: &HashMap<String, String>) -> bool {
    // `ip_cidr` is the only attribute name that reads from a differently
    // named request attribute (`ip`).
    let lookup_key = if condition.attribute == "ip_cidr" { "ip" } else { condition.attribute.as_str() };
    let Some(actual) = attributes.get(lookup_key) else {
        return false;
    };

    match condition.operator.as_str() {
        "eq" | "" => actual == &condition.value,
        "neq" => actual != &condition.value,
        "in" => condition.value.split(',').any(|v| v.trim() == actual),
        "not_in" => !condition.value.split(',').any(|v| v.trim() == actual),
        "cidr_match" => match condition.value.parse::<ipnet::IpNet>() {
            Ok(net) => actual.parse::<std::net::IpAddr>().map(|ip| net.contains(&ip)).unwrap_or(false),
            Err(_) => actual == &condition.value,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teamvault_repository::memory::MemoryRepository;

    fn base_request(org_id: Option<Uuid>) -> PolicyRequest {
        PolicyRequest {
            subject_type: SubjectType::ServiceAccount,
            subject_id: "sa-1".to_string(),
            action: Action::Read,
            resource: "p1/db/url".to_string(),
            is_admin: false,
            org_id,
            attributes: HashMap::new(),
        }
    }

    #[test]
    fn glob_double_star_matches_any_suffix() {
        assert!(resource_matches("p1/**", "p1/db/url"));
        assert!(resource_matches("p1/**", "p1"));
        assert!(!resource_matches("p1/**", "p2/db/url"));
    }

    #[test]
    fn glob_trailing_single_star_requires_one_more_segment() {
        assert!(resource_matches("p1/*", "p1/db"));
        assert!(!resource_matches("p1/*", "p1"));
    }

    #[test]
    fn glob_segmentwise_requires_equal_length() {
        assert!(resource_matches("p1/*/url", "p1/db/url"));
        assert!(!resource_matches("p1/*/url", "p1/db/extra/url"));
    }

    #[test]
    fn condition_cidr_match() {
        let cond = Condition {
            attribute: "ip_cidr".to_string(),
            operator: "cidr_match".to_string(),
            value: "10.0.0.0/8".to_string(),
        };
        let mut attrs = HashMap::new();
        attrs.insert("ip".to_string(), "10.1.2.3".to_string());
        assert!(condition_matches(&cond, &attrs));

        attrs.insert("ip".to_string(), "192.168.1.1".to_string());
        assert!(!condition_matches(&cond, &attrs));
    }

    #[test]
    fn condition_missing_attribute_fails() {
        let cond = Condition {
            attribute: "environment".to_string(),
            operator: "eq".to_string(),
            value: "prod".to_string(),
        };
        assert!(!condition_matches(&cond, &HashMap::new()));
    }

    #[tokio::test]
    async fn admin_always_allowed() {
        let repo = MemoryRepository::new();
        let mut req = base_request(None);
        req.is_admin = true;
        let decision = evaluate(&repo, &req).await.unwrap();
        assert!(decision.is_allowed());
    }

    #[tokio::test]
    async fn no_matching_policy_denies_by_default() {
        let repo = MemoryRepository::new();
        let req = base_request(None);
        let decision = evaluate(&repo, &req).await.unwrap();
        assert_eq!(decision, Decision::Denied("default deny".to_string()));
    }

    #[tokio::test]
    async fn legacy_deny_short_circuits() {
        let repo = MemoryRepository::new();
        // MemoryRepository has no insert-policy method exposed directly on
        // the trait object here; exercise through the pure evaluators
        // instead for the legacy layer, and through the repo for IAM below.
        let policies = vec![Policy {
            id: Uuid::new_v4(),
            name: "deny-all".to_string(),
            effect: Effect::Deny,
            actions: vec!["*".to_string()],
            resource_pattern: "p1/**".to_string(),
            subject_type: SubjectType::Any,
            subject_id: None,
            conditions: vec![],
        }];
        let req = base_request(None);
        let (denied, allowed) = evaluate_legacy(&policies, &req);
        assert!(denied);
        assert!(!allowed);
        let _ = &repo;
    }

    #[test]
    fn iam_pbac_deny_overrides_allow_in_same_document() {
        let document = serde_json::json!({
            "subject": {"type": "service_account"},
            "rules": [
                {"effect": "allow", "path": "p1/**", "capabilities": ["read"]},
                {"effect": "deny", "path": "p1/secret/*", "capabilities": ["read"]}
            ]
        });
        let policy = IamPolicy {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: "mixed".to_string(),
            policy_type: IamPolicyType::Pbac,
            document,
            hcl_source: None,
        };
        let mut req = base_request(Some(policy.org_id));
        req.resource = "p1/secret/key".to_string();
        let decision = evaluate_iam_policy(&policy, &req);
        assert!(matches!(decision, Some(Decision::Denied(_))));
    }

    #[tokio::test]
    async fn iam_allow_overrides_legacy_no_match() {
        let repo = MemoryRepository::new();
        let org_id = Uuid::new_v4();
        repo.create_iam_policy(IamPolicy {
            id: Uuid::new_v4(),
            org_id,
            name: "allow-reads".to_string(),
            policy_type: IamPolicyType::Rbac,
            document: serde_json::json!({
                "subject": {"type": "service_account"},
                "rule": {"effect": "allow", "path": "p1/**", "capabilities": ["read"]}
            }),
            hcl_source: None,
        })
        .await
        .unwrap();

        let req = base_request(Some(org_id));
        let decision = evaluate(&repo, &req).await.unwrap();
        assert!(decision.is_allowed());
    }
}
