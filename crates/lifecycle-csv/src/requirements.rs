//! Requirement evaluation
//!
//! A CSV declares what it owns and what it needs. Each declaration becomes a
//! [`Requirement`] that evaluates to a [`RequirementStatus`] against the
//! current cluster state. Only required kinds and permissions gate install;
//! owned kinds are recorded for visibility.

use k8s_openapi::api::rbac::v1::PolicyRule;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::kube_aggregator::pkg::apis::apiregistration::v1::APIService;
use lifecycle_common::crd::{
    ApiServiceDescription, ClusterServiceVersionSpec, CrdDescription, DependentState,
    DependentStatus, RequirementState, RequirementStatus,
};
use lifecycle_common::kube_utils::{has_condition, STATUS_FALSE};

use crate::apiservice;
use crate::rbac::{describe_rule, rules_allow, RbacSnapshot};
use crate::strategy::{DeploymentStrategy, RBAC_API_GROUP};

const CRD_GROUP: &str = "apiextensions.k8s.io";
const CRD_KIND: &str = "CustomResourceDefinition";
const API_SERVICE_GROUP: &str = "apiregistration.k8s.io";
const API_SERVICE_KIND: &str = "APIService";

/// Read access to the cluster state requirements are evaluated against
pub trait RequirementLookup {
    fn crd(&self, name: &str) -> Option<&CustomResourceDefinition>;
    fn api_service(&self, name: &str) -> Option<&APIService>;
    fn service_account_exists(&self, namespace: &str, name: &str) -> bool;
    fn rbac(&self) -> &RbacSnapshot;
}

/// One declared dependency of a CSV
#[derive(Clone, Debug, PartialEq)]
pub enum Requirement<'a> {
    OwnedCrd(&'a CrdDescription),
    RequiredCrd(&'a CrdDescription),
    OwnedApiService(&'a ApiServiceDescription),
    RequiredApiService(&'a ApiServiceDescription),
    /// Rules a service account must already hold
    Permission {
        service_account: &'a str,
        namespaced: Vec<PolicyRule>,
        cluster: Vec<PolicyRule>,
    },
}

impl<'a> Requirement<'a> {
    /// Collect every requirement declared by `spec` and its strategy
    pub fn collect(spec: &'a ClusterServiceVersionSpec, strategy: &'a DeploymentStrategy) -> Vec<Self> {
        let crds = &spec.custom_resource_definitions;
        let apis = &spec.api_service_definitions;
        let mut out: Vec<Self> = crds
            .owned
            .iter()
            .map(Requirement::OwnedCrd)
            .chain(crds.required.iter().map(Requirement::RequiredCrd))
            .chain(apis.owned.iter().map(Requirement::OwnedApiService))
            .chain(apis.required.iter().map(Requirement::RequiredApiService))
            .collect();

        let mut namespaced = strategy.namespaced_rules();
        let mut cluster = strategy.cluster_rules();
        let mut accounts: Vec<&str> = namespaced.keys().chain(cluster.keys()).copied().collect();
        accounts.sort_unstable();
        accounts.dedup();
        for sa in accounts {
            out.push(Requirement::Permission {
                service_account: sa,
                namespaced: namespaced.remove(sa).unwrap_or_default(),
                cluster: cluster.remove(sa).unwrap_or_default(),
            });
        }
        out
    }

    /// Whether an unmet result keeps the CSV from installing
    pub fn gates_install(&self) -> bool {
        !matches!(self, Requirement::OwnedCrd(_) | Requirement::OwnedApiService(_))
    }

    pub fn evaluate(&self, namespace: &str, lookup: &impl RequirementLookup) -> RequirementStatus {
        match self {
            Requirement::OwnedCrd(desc) => evaluate_crd(desc, lookup, true),
            Requirement::RequiredCrd(desc) => evaluate_crd(desc, lookup, false),
            Requirement::OwnedApiService(desc) => evaluate_owned_api_service(desc, lookup),
            Requirement::RequiredApiService(desc) => evaluate_required_api_service(desc, lookup),
            Requirement::Permission {
                service_account,
                namespaced,
                cluster,
            } => evaluate_permission(namespace, service_account, namespaced, cluster, lookup),
        }
    }
}

fn crd_status(desc: &CrdDescription, status: RequirementState, message: String) -> RequirementStatus {
    RequirementStatus {
        group: CRD_GROUP.to_string(),
        version: "v1".to_string(),
        kind: CRD_KIND.to_string(),
        name: desc.name.clone(),
        status,
        message,
        dependents: vec![],
    }
}

fn evaluate_crd(desc: &CrdDescription, lookup: &impl RequirementLookup, owned: bool) -> RequirementStatus {
    let Some(crd) = lookup.crd(&desc.name) else {
        let message = if owned {
            "CRD is not present; it is expected to ship with this CSV".to_string()
        } else {
            "CRD is not present".to_string()
        };
        return crd_status(desc, RequirementState::NotPresent, message);
    };

    let served = crd
        .spec
        .versions
        .iter()
        .any(|v| v.name == desc.version && v.served);
    if !served {
        return crd_status(
            desc,
            RequirementState::PresentNotSatisfied,
            format!("CRD does not serve version {}", desc.version),
        );
    }

    let established = crd
        .status
        .as_ref()
        .is_some_and(|s| has_condition(s.conditions.as_deref(), "Established"));
    if !established {
        return crd_status(
            desc,
            RequirementState::PresentNotSatisfied,
            "CRD is not yet established".to_string(),
        );
    }

    crd_status(
        desc,
        RequirementState::Present,
        "CRD is present and established".to_string(),
    )
}

fn api_service_status(
    desc: &ApiServiceDescription,
    status: RequirementState,
    message: &str,
) -> RequirementStatus {
    RequirementStatus {
        group: API_SERVICE_GROUP.to_string(),
        version: "v1".to_string(),
        kind: API_SERVICE_KIND.to_string(),
        name: desc.api_service_name(),
        status,
        message: message.to_string(),
        dependents: vec![],
    }
}

fn evaluate_required_api_service(
    desc: &ApiServiceDescription,
    lookup: &impl RequirementLookup,
) -> RequirementStatus {
    match lookup.api_service(&desc.api_service_name()) {
        None => api_service_status(desc, RequirementState::NotPresent, "APIService is not registered"),
        Some(api) if apiservice::availability(api) == Some(STATUS_FALSE) => api_service_status(
            desc,
            RequirementState::PresentNotSatisfied,
            "APIService is registered but not available",
        ),
        Some(_) => api_service_status(desc, RequirementState::Present, "APIService is registered"),
    }
}

fn evaluate_owned_api_service(
    desc: &ApiServiceDescription,
    lookup: &impl RequirementLookup,
) -> RequirementStatus {
    match lookup.api_service(&desc.api_service_name()) {
        None => api_service_status(
            desc,
            RequirementState::NotPresent,
            "APIService will be registered by this CSV",
        ),
        Some(api) if apiservice::is_available(api) => {
            api_service_status(desc, RequirementState::Present, "APIService is available")
        }
        Some(_) => api_service_status(
            desc,
            RequirementState::PresentNotSatisfied,
            "waiting for APIService to become available",
        ),
    }
}

fn rule_dependents(
    scope: &str,
    granted: &[PolicyRule],
    requested: &[PolicyRule],
) -> Vec<DependentStatus> {
    requested
        .iter()
        .map(|rule| {
            let status = if rules_allow(granted, rule) {
                DependentState::Satisfied
            } else {
                DependentState::NotSatisfied
            };
            DependentStatus {
                group: RBAC_API_GROUP.to_string(),
                version: "v1".to_string(),
                kind: "PolicyRule".to_string(),
                status,
                message: Some(format!("{scope} rule {}", describe_rule(rule))),
            }
        })
        .collect()
}

fn evaluate_permission(
    namespace: &str,
    service_account: &str,
    namespaced: &[PolicyRule],
    cluster: &[PolicyRule],
    lookup: &impl RequirementLookup,
) -> RequirementStatus {
    let rbac = lookup.rbac();
    let mut dependents = rule_dependents(
        "namespaced",
        &rbac.namespaced_rules(namespace, service_account),
        namespaced,
    );
    dependents.extend(rule_dependents(
        "cluster",
        &rbac.cluster_rules(namespace, service_account),
        cluster,
    ));

    let missing = dependents
        .iter()
        .filter(|d| d.status == DependentState::NotSatisfied)
        .count();
    let exists = lookup.service_account_exists(namespace, service_account);
    let (status, message) = match (missing, exists) {
        (0, true) => (RequirementState::Present, "all rules are granted".to_string()),
        (0, false) => (
            RequirementState::Present,
            "all rules are granted; service account will be created".to_string(),
        ),
        (n, true) => (
            RequirementState::PresentNotSatisfied,
            format!("{n} rule(s) not granted"),
        ),
        (n, false) => (
            RequirementState::NotPresent,
            format!("service account does not exist and {n} rule(s) are not granted"),
        ),
    };

    RequirementStatus {
        group: String::new(),
        version: "v1".to_string(),
        kind: "ServiceAccount".to_string(),
        name: service_account.to_string(),
        status,
        message,
        dependents,
    }
}

/// Outcome of evaluating every requirement of a CSV
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Evaluation {
    /// Every requirement's status, sorted by kind, group, version, name
    pub statuses: Vec<RequirementStatus>,
    /// One line per gating requirement that is not met
    pub unmet: Vec<String>,
}

impl Evaluation {
    pub fn all_met(&self) -> bool {
        self.unmet.is_empty()
    }

    /// Status message listing every unmet requirement
    pub fn message(&self) -> String {
        if self.all_met() {
            "all requirements found, attempting install".to_string()
        } else {
            format!("requirements not met: {}", self.unmet.join("; "))
        }
    }
}

fn describe_unmet(status: &RequirementStatus) -> String {
    let missing: Vec<&str> = status
        .dependents
        .iter()
        .filter(|d| d.status == DependentState::NotSatisfied)
        .filter_map(|d| d.message.as_deref())
        .collect();
    if missing.is_empty() {
        format!("{} {}: {}", status.kind, status.name, status.message)
    } else {
        format!("{} {}: missing {}", status.kind, status.name, missing.join(", "))
    }
}

/// Evaluate every requirement of `spec` against `lookup`
pub fn evaluate(
    spec: &ClusterServiceVersionSpec,
    namespace: &str,
    strategy: &DeploymentStrategy,
    lookup: &impl RequirementLookup,
) -> Evaluation {
    let mut evaluated: Vec<(bool, RequirementStatus)> = Requirement::collect(spec, strategy)
        .iter()
        .map(|r| (r.gates_install(), r.evaluate(namespace, lookup)))
        .collect();
    evaluated.sort_by(|(_, a), (_, b)| {
        (&a.kind, &a.group, &a.version, &a.name).cmp(&(&b.kind, &b.group, &b.version, &b.name))
    });

    let unmet = evaluated
        .iter()
        .filter(|(gates, status)| *gates && !status.is_met())
        .map(|(_, status)| describe_unmet(status))
        .collect();

    Evaluation {
        statuses: evaluated.into_iter().map(|(_, s)| s).collect(),
        unmet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::ClusterState;
    use crate::testing::{
        api_service, crd, csv_spec, decoded_strategy, namespaced_grant, packages_api, pod_rule,
        service_account, NAMESPACE,
    };

    fn required_crd(name: &str) -> CrdDescription {
        CrdDescription {
            name: name.to_string(),
            version: "v1alpha1".to_string(),
            kind: "NotInCluster".to_string(),
            ..Default::default()
        }
    }

    fn run(spec: &ClusterServiceVersionSpec, state: &ClusterState) -> Evaluation {
        evaluate(spec, NAMESPACE, &decoded_strategy(spec), state)
    }

    fn grant_pods(state: &mut ClusterState, sa: &str, verbs: &[&str]) {
        let (role, binding) = namespaced_grant("pods", sa, vec![pod_rule(verbs)]);
        state.rbac.roles.push(role);
        state.rbac.role_bindings.push(binding);
    }

    mod crds {
        use super::*;

        /// Story: a CSV that needs a kind nobody installed waits and says why
        #[test]
        fn missing_required_crd_is_unmet_and_named() {
            let mut spec = csv_spec("dep", &[], &[]);
            spec.custom_resource_definitions.required = vec![required_crd("not.in.cluster.com")];
            let eval = run(&spec, &ClusterState::default());

            assert!(!eval.all_met());
            assert_eq!(eval.statuses.len(), 1);
            assert_eq!(eval.statuses[0].status, RequirementState::NotPresent);
            assert!(eval.message().contains("not.in.cluster.com"));
        }

        #[test]
        fn crd_must_serve_the_version_and_be_established() {
            let mut spec = csv_spec("dep", &[], &[]);
            spec.custom_resource_definitions.required = vec![required_crd("widgets.example.com")];
            let mut state = ClusterState::default();

            state.crds.insert("widgets.example.com".to_string(), crd("widgets.example.com", "v1", true));
            let eval = run(&spec, &state);
            assert_eq!(eval.statuses[0].status, RequirementState::PresentNotSatisfied);

            state.crds.insert("widgets.example.com".to_string(), crd("widgets.example.com", "v1alpha1", false));
            let eval = run(&spec, &state);
            assert_eq!(eval.statuses[0].message, "CRD is not yet established");

            state.crds.insert("widgets.example.com".to_string(), crd("widgets.example.com", "v1alpha1", true));
            assert!(run(&spec, &state).all_met());
        }

        /// Story: owned kinds are recorded but never block install
        #[test]
        fn owned_crds_are_informational() {
            let mut spec = csv_spec("dep", &[], &[]);
            spec.custom_resource_definitions.owned = vec![required_crd("mine.example.com")];
            let eval = run(&spec, &ClusterState::default());
            assert!(eval.all_met());
            assert_eq!(eval.statuses[0].status, RequirementState::NotPresent);
        }
    }

    mod api_services {
        use super::*;

        #[test]
        fn required_apiservice_must_be_registered_and_not_unavailable() {
            let mut spec = csv_spec("dep", &[], &[]);
            spec.api_service_definitions.required = vec![packages_api("dep")];
            let mut state = ClusterState::default();
            let eval = run(&spec, &state);
            assert!(!eval.all_met());
            assert!(eval.message().contains("v1alpha1.packages.apps.redhat.com"));

            state.insert(api_service("v1alpha1.packages.apps.redhat.com", Some("False")));
            let eval = run(&spec, &state);
            assert_eq!(eval.statuses[0].status, RequirementState::PresentNotSatisfied);

            state.insert(api_service("v1alpha1.packages.apps.redhat.com", None));
            assert!(run(&spec, &state).all_met());
        }

        #[test]
        fn owned_apiservice_does_not_gate() {
            let mut spec = csv_spec("dep", &[], &[]);
            spec.api_service_definitions.owned = vec![packages_api("dep")];
            let eval = run(&spec, &ClusterState::default());
            assert!(eval.all_met());
            assert_eq!(eval.statuses[0].kind, "APIService");
        }
    }

    mod permissions {
        use super::*;

        /// Story: the gate checks rules already granted, not rules we would create
        #[test]
        fn ungranted_rules_block_install_and_are_listed() {
            let spec = csv_spec("dep", &[("dep-sa", pod_rule(&["get", "create"]))], &[]);
            let mut state = ClusterState::default();
            grant_pods(&mut state, "dep-sa", &["get"]);
            state.insert(service_account(NAMESPACE, "dep-sa"));

            let eval = run(&spec, &state);
            assert!(!eval.all_met());
            let status = &eval.statuses[0];
            assert_eq!(status.kind, "ServiceAccount");
            assert_eq!(status.status, RequirementState::PresentNotSatisfied);
            assert_eq!(status.dependents.len(), 1);
            assert_eq!(status.dependents[0].status, DependentState::NotSatisfied);
            assert!(eval.message().contains("dep-sa"));
        }

        #[test]
        fn granted_rules_pass_even_without_the_service_account() {
            let spec = csv_spec("dep", &[("dep-sa", pod_rule(&["get"]))], &[]);
            let mut state = ClusterState::default();
            grant_pods(&mut state, "dep-sa", &["*"]);

            let eval = run(&spec, &state);
            assert!(eval.all_met());
            assert!(eval.statuses[0].message.contains("will be created"));
        }

        #[test]
        fn namespaced_grants_do_not_satisfy_cluster_rules() {
            let spec = csv_spec("dep", &[], &[("dep-sa", pod_rule(&["get"]))]);
            let mut state = ClusterState::default();
            grant_pods(&mut state, "dep-sa", &["get"]);

            let eval = run(&spec, &state);
            assert!(!eval.all_met());
            assert_eq!(eval.statuses[0].status, RequirementState::NotPresent);
        }
    }

    #[test]
    fn statuses_are_sorted_for_stable_output() {
        let mut spec = csv_spec("dep", &[("a-sa", pod_rule(&["get"]))], &[]);
        spec.custom_resource_definitions.required =
            vec![required_crd("zz.example.com"), required_crd("aa.example.com")];
        let eval = run(&spec, &ClusterState::default());
        let names: Vec<&str> = eval.statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["aa.example.com", "zz.example.com", "a-sa"]);
    }
}
