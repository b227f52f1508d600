//! Access-graph evaluation
//!
//! Answers "does this service account already hold these rules?" against a
//! snapshot of the cluster's Roles, ClusterRoles, and their bindings.
//!
//! Sources, in a namespace:
//! - Roles bound by RoleBindings in that namespace
//! - ClusterRoles bound by RoleBindings in that namespace
//! - ClusterRoles bound by ClusterRoleBindings
//!
//! Cluster-wide rules only come from ClusterRoleBindings. ClusterRoles with an
//! aggregation rule include the rules of every ClusterRole their selectors
//! match, transitively.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;

const WILDCARD: &str = "*";
const SERVICE_ACCOUNT_GROUP: &str = "system:serviceaccounts";

/// Point-in-time copy of the RBAC objects relevant to one namespace
#[derive(Clone, Debug, Default)]
pub struct RbacSnapshot {
    /// Roles in the namespace
    pub roles: Vec<Role>,
    /// RoleBindings in the namespace
    pub role_bindings: Vec<RoleBinding>,
    /// All ClusterRoles
    pub cluster_roles: Vec<ClusterRole>,
    /// All ClusterRoleBindings
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
}

impl RbacSnapshot {
    /// Rules the service account holds inside `namespace`
    pub fn namespaced_rules(&self, namespace: &str, service_account: &str) -> Vec<PolicyRule> {
        let mut rules = Vec::new();
        for binding in &self.role_bindings {
            if binding.namespace().as_deref() != Some(namespace)
                || !binds(binding.subjects.as_deref(), namespace, service_account)
            {
                continue;
            }
            rules.extend(self.role_ref_rules(namespace, &binding.role_ref));
        }
        rules.extend(self.cluster_rules(namespace, service_account));
        rules
    }

    /// Rules the service account holds cluster-wide
    pub fn cluster_rules(&self, namespace: &str, service_account: &str) -> Vec<PolicyRule> {
        self.cluster_role_bindings
            .iter()
            .filter(|b| binds(b.subjects.as_deref(), namespace, service_account))
            .filter(|b| b.role_ref.kind == "ClusterRole")
            .flat_map(|b| self.cluster_role_rules(&b.role_ref.name))
            .collect()
    }

    fn role_ref_rules(&self, namespace: &str, role_ref: &RoleRef) -> Vec<PolicyRule> {
        match role_ref.kind.as_str() {
            "Role" => self
                .roles
                .iter()
                .find(|r| r.name_any() == role_ref.name && r.namespace().as_deref() == Some(namespace))
                .and_then(|r| r.rules.clone())
                .unwrap_or_default(),
            "ClusterRole" => self.cluster_role_rules(&role_ref.name),
            _ => Vec::new(),
        }
    }

    /// Rules of a ClusterRole including everything it aggregates
    pub fn cluster_role_rules(&self, name: &str) -> Vec<PolicyRule> {
        let mut visited = BTreeSet::new();
        let mut rules = Vec::new();
        self.collect_cluster_role(name, &mut visited, &mut rules);
        rules
    }

    fn collect_cluster_role(
        &self,
        name: &str,
        visited: &mut BTreeSet<String>,
        rules: &mut Vec<PolicyRule>,
    ) {
        if !visited.insert(name.to_string()) {
            return;
        }
        let Some(role) = self.cluster_roles.iter().find(|r| r.name_any() == name) else {
            return;
        };
        rules.extend(role.rules.iter().flatten().cloned());

        let selectors = role
            .aggregation_rule
            .as_ref()
            .and_then(|a| a.cluster_role_selectors.as_deref())
            .unwrap_or_default();
        for selector in selectors {
            for candidate in &self.cluster_roles {
                let candidate_name = candidate.name_any();
                if candidate_name != name && selector_matches(selector, candidate.labels()) {
                    self.collect_cluster_role(&candidate_name, visited, rules);
                }
            }
        }
    }
}

fn binds(subjects: Option<&[Subject]>, namespace: &str, service_account: &str) -> bool {
    subjects
        .unwrap_or_default()
        .iter()
        .any(|s| subject_matches(s, namespace, service_account))
}

/// True when the subject names the service account directly, by its user
/// name, or by one of the service-account groups it belongs to
pub fn subject_matches(subject: &Subject, namespace: &str, service_account: &str) -> bool {
    match subject.kind.as_str() {
        "ServiceAccount" => {
            subject.name == service_account && subject.namespace.as_deref() == Some(namespace)
        }
        "User" => subject.name == format!("system:serviceaccount:{namespace}:{service_account}"),
        "Group" => {
            subject.name == SERVICE_ACCOUNT_GROUP
                || subject.name == format!("{SERVICE_ACCOUNT_GROUP}:{namespace}")
        }
        _ => false,
    }
}

/// Match a label selector against an object's labels
pub fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_ok = selector
        .match_labels
        .iter()
        .flatten()
        .all(|(k, v)| labels.get(k) == Some(v));
    let expressions_ok = selector.match_expressions.iter().flatten().all(|expr| {
        let values = expr.values.as_deref().unwrap_or_default();
        let value = labels.get(&expr.key);
        match expr.operator.as_str() {
            "In" => value.is_some_and(|v| values.contains(v)),
            "NotIn" => !value.is_some_and(|v| values.contains(v)),
            "Exists" => value.is_some(),
            "DoesNotExist" => value.is_none(),
            _ => false,
        }
    });
    labels_ok && expressions_ok
}

fn matches_any(granted: Option<&[String]>, wanted: &str) -> bool {
    granted
        .unwrap_or_default()
        .iter()
        .any(|g| g == WILDCARD || g == wanted)
}

fn resource_matches(granted: Option<&[String]>, wanted: &str) -> bool {
    granted.unwrap_or_default().iter().any(|g| {
        if g == WILDCARD || g == wanted {
            return true;
        }
        match (g.split_once('/'), wanted.split_once('/')) {
            (Some((res, "*")), Some((want_res, _))) => res == want_res,
            (Some(("*", sub)), Some((_, want_sub))) => sub == want_sub,
            _ => false,
        }
    })
}

fn url_matches(granted: Option<&[String]>, wanted: &str) -> bool {
    granted.unwrap_or_default().iter().any(|g| {
        g == WILDCARD
            || g == wanted
            || g.strip_suffix('*').is_some_and(|prefix| wanted.starts_with(prefix))
    })
}

fn names_cover(granted: Option<&[String]>, wanted: Option<&[String]>) -> bool {
    let granted = granted.unwrap_or_default();
    if granted.is_empty() {
        return true;
    }
    let wanted = wanted.unwrap_or_default();
    !wanted.is_empty() && wanted.iter().all(|w| granted.contains(w))
}

/// True when the union of `granted` allows everything `requested` asks for.
///
/// The request is expanded to individual (verb, group, resource) and
/// (verb, url) tuples; each tuple must be allowed by some granted rule. A
/// granted rule restricted to resource names never covers a request without
/// the same or narrower names.
pub fn rules_allow(granted: &[PolicyRule], requested: &PolicyRule) -> bool {
    let core = [String::new()];
    let groups = match requested.api_groups.as_deref() {
        Some(g) if !g.is_empty() => g,
        _ => &core[..],
    };
    let resources = requested.resources.as_deref().unwrap_or_default();
    let urls = requested.non_resource_urls.as_deref().unwrap_or_default();
    let wanted_names = requested.resource_names.as_deref();

    requested.verbs.iter().all(|verb| {
        let resources_ok = groups.iter().all(|group| {
            resources.iter().all(|resource| {
                granted.iter().any(|g| {
                    matches_any(Some(g.verbs.as_slice()), verb)
                        && matches_any(g.api_groups.as_deref(), group)
                        && resource_matches(g.resources.as_deref(), resource)
                        && names_cover(g.resource_names.as_deref(), wanted_names)
                })
            })
        });
        let urls_ok = urls.iter().all(|url| {
            granted.iter().any(|g| {
                matches_any(Some(g.verbs.as_slice()), verb) && url_matches(g.non_resource_urls.as_deref(), url)
            })
        });
        resources_ok && urls_ok
    })
}

/// Render a rule compactly for status messages
pub fn describe_rule(rule: &PolicyRule) -> String {
    let list = |v: Option<&[String]>| {
        v.unwrap_or_default()
            .iter()
            .map(|s| if s.is_empty() { "\"\"".to_string() } else { s.clone() })
            .collect::<Vec<_>>()
            .join(",")
    };
    let mut out = format!("verbs=[{}]", rule.verbs.join(","));
    if rule.non_resource_urls.as_ref().is_some_and(|u| !u.is_empty()) {
        out.push_str(&format!(" nonResourceURLs=[{}]", list(rule.non_resource_urls.as_deref())));
    } else {
        out.push_str(&format!(
            " apiGroups=[{}] resources=[{}]",
            list(rule.api_groups.as_deref()),
            list(rule.resources.as_deref())
        ));
    }
    if rule.resource_names.as_ref().is_some_and(|n| !n.is_empty()) {
        out.push_str(&format!(" resourceNames=[{}]", list(rule.resource_names.as_deref())));
    }
    out
}
