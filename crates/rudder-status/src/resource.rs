//! Resource model and per-kind status evaluation
//!
//! Snapshots come back from kubectl as JSON. Well-known workload kinds are
//! deserialized into their k8s-openapi types to decide readiness; any other
//! kind counts as successful as soon as it exists.

use std::fmt;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerStatus, PersistentVolumeClaim, Pod, Service};
use serde::de::DeserializeOwned;
use serde_json::Value;

use rudder_common::Error;

/// Container waiting reasons that will not resolve without intervention
const FATAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

/// Retries a Job gets when `spec.backoffLimit` is unset
const DEFAULT_JOB_BACKOFF_LIMIT: i32 = 6;

/// Identifies one trackable Kubernetes object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceIdentifier {
    /// Resource kind as written in the manifest (e.g. "Deployment")
    pub kind: String,
    /// metadata.name
    pub name: String,
    /// metadata.namespace
    pub namespace: String,
}

impl ResourceIdentifier {
    /// Create an identifier
    pub fn new(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Read kind, name and namespace from a document.
    ///
    /// Returns `None` when kind or name is missing. Documents without a
    /// namespace fall back to `default_namespace`.
    pub fn from_value(value: &Value, default_namespace: &str) -> Option<Self> {
        let kind = value.get("kind")?.as_str()?;
        let metadata = value.get("metadata")?;
        let name = metadata.get("name")?.as_str()?;
        let namespace = metadata
            .get("namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace);
        if kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(kind, name, namespace))
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

/// Deployment status of one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    /// Not observed yet
    Pending,
    /// Observed but not ready
    InProgress,
    /// Ready
    Successful,
    /// Failed, or gone after being observed
    Failed,
}

impl ResourceStatus {
    /// Token used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceStatus::Pending => "Pending",
            ResourceStatus::InProgress => "InProgress",
            ResourceStatus::Successful => "Successful",
            ResourceStatus::Failed => "Failed",
        }
    }

    /// `Successful` and `Failed` are terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceStatus::Successful | ResourceStatus::Failed)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState {
    /// Which resource
    pub identifier: ResourceIdentifier,
    /// Evaluated status
    pub status: ResourceStatus,
    /// Document as returned by the cluster
    pub raw: Value,
    /// metadata.uid
    pub uid: Option<String>,
    /// metadata.ownerReferences[].uid
    pub owner_uids: Vec<String>,
}

impl ResourceState {
    /// Build a state from a live document, evaluating its status.
    pub fn from_value(raw: Value, default_namespace: &str) -> Result<Self, Error> {
        let identifier = ResourceIdentifier::from_value(&raw, default_namespace).ok_or_else(|| {
            Error::serialization("resource document is missing kind or metadata.name")
        })?;
        let status = evaluate_status(&identifier.kind, &raw)?;
        let metadata = raw.get("metadata");
        let uid = metadata
            .and_then(|m| m.get("uid"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let owner_uids = metadata
            .and_then(|m| m.get("ownerReferences"))
            .and_then(Value::as_array)
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| r.get("uid").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            identifier,
            status,
            raw,
            uid,
            owner_uids,
        })
    }

    /// Whether this resource lists `uid` among its owners
    pub fn is_owned_by(&self, uid: &str) -> bool {
        self.owner_uids.iter().any(|o| o == uid)
    }
}

fn typed<T: DeserializeOwned>(kind: &str, value: &Value) -> Result<T, Error> {
    serde_json::from_value(value.clone())
        .map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

fn at_least(actual: Option<i32>, desired: i32) -> bool {
    actual.unwrap_or(0) >= desired
}

/// Evaluate the status of a live resource document.
pub fn evaluate_status(kind: &str, value: &Value) -> Result<ResourceStatus, Error> {
    let status = match kind {
        "Deployment" => deployment_status(&typed(kind, value)?),
        "ReplicaSet" => replica_set_status(&typed(kind, value)?),
        "StatefulSet" => stateful_set_status(&typed(kind, value)?),
        "DaemonSet" => daemon_set_status(&typed(kind, value)?),
        "Pod" => pod_status(&typed(kind, value)?),
        "Job" => job_status(&typed(kind, value)?),
        "PersistentVolumeClaim" => pvc_status(&typed(kind, value)?),
        "Service" => service_status(&typed(kind, value)?),
        _ => ResourceStatus::Successful,
    };
    Ok(status)
}

fn deployment_status(deployment: &Deployment) -> ResourceStatus {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return ResourceStatus::InProgress;
    };

    let deadline_exceeded = status.conditions.as_ref().is_some_and(|conds| {
        conds.iter().any(|c| {
            c.type_ == "Progressing"
                && c.status == "False"
                && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
        })
    });
    if deadline_exceeded {
        return ResourceStatus::Failed;
    }

    if at_least(status.updated_replicas, desired)
        && at_least(status.ready_replicas, desired)
        && at_least(status.available_replicas, desired)
        && status.replicas.unwrap_or(0) == desired
    {
        ResourceStatus::Successful
    } else {
        ResourceStatus::InProgress
    }
}

fn replica_set_status(rs: &ReplicaSet) -> ResourceStatus {
    let desired = rs.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    match rs.status.as_ref() {
        Some(status)
            if at_least(status.ready_replicas, desired)
                && at_least(status.available_replicas, desired) =>
        {
            ResourceStatus::Successful
        }
        _ => ResourceStatus::InProgress,
    }
}

fn stateful_set_status(sts: &StatefulSet) -> ResourceStatus {
    let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    match sts.status.as_ref() {
        Some(status)
            if at_least(status.ready_replicas, desired)
                && at_least(status.updated_replicas, desired) =>
        {
            ResourceStatus::Successful
        }
        _ => ResourceStatus::InProgress,
    }
}

fn daemon_set_status(ds: &DaemonSet) -> ResourceStatus {
    match ds.status.as_ref() {
        Some(status)
            if status.number_ready == status.desired_number_scheduled
                && status.updated_number_scheduled.unwrap_or(0)
                    == status.desired_number_scheduled
                && status.number_unavailable.unwrap_or(0) == 0 =>
        {
            ResourceStatus::Successful
        }
        _ => ResourceStatus::InProgress,
    }
}

fn waiting_on_fatal_reason(statuses: Option<&Vec<ContainerStatus>>) -> bool {
    statuses.is_some_and(|cs| {
        cs.iter().any(|c| {
            c.state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.as_deref())
                .is_some_and(|reason| FATAL_WAITING_REASONS.contains(&reason))
        })
    })
}

fn pod_status(pod: &Pod) -> ResourceStatus {
    let Some(status) = pod.status.as_ref() else {
        return ResourceStatus::InProgress;
    };

    if waiting_on_fatal_reason(status.init_container_statuses.as_ref())
        || waiting_on_fatal_reason(status.container_statuses.as_ref())
    {
        return ResourceStatus::Failed;
    }

    match status.phase.as_deref() {
        Some("Succeeded") => ResourceStatus::Successful,
        Some("Failed") => ResourceStatus::Failed,
        Some("Running") => {
            let all_ready = status
                .container_statuses
                .as_ref()
                .is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready));
            if all_ready {
                ResourceStatus::Successful
            } else {
                ResourceStatus::InProgress
            }
        }
        _ => ResourceStatus::InProgress,
    }
}

fn job_status(job: &Job) -> ResourceStatus {
    let conditions = job.status.as_ref().and_then(|s| s.conditions.as_ref());
    let has = |type_: &str| {
        conditions.is_some_and(|conds| conds.iter().any(|c| c.type_ == type_ && c.status == "True"))
    };
    let backoff_limit = job
        .spec
        .as_ref()
        .and_then(|s| s.backoff_limit)
        .unwrap_or(DEFAULT_JOB_BACKOFF_LIMIT);
    let failed_pods = job.status.as_ref().and_then(|s| s.failed).unwrap_or(0);
    if has("Failed") || failed_pods > backoff_limit {
        ResourceStatus::Failed
    } else if has("Complete") {
        ResourceStatus::Successful
    } else {
        ResourceStatus::InProgress
    }
}

fn pvc_status(pvc: &PersistentVolumeClaim) -> ResourceStatus {
    match pvc.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Bound") => ResourceStatus::Successful,
        Some("Lost") => ResourceStatus::Failed,
        _ => ResourceStatus::InProgress,
    }
}

fn service_status(service: &Service) -> ResourceStatus {
    let is_load_balancer = service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        == Some("LoadBalancer");
    if !is_load_balancer {
        return ResourceStatus::Successful;
    }
    let has_ingress = service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .is_some_and(|ingress| !ingress.is_empty());
    if has_ingress {
        ResourceStatus::Successful
    } else {
        ResourceStatus::InProgress
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn identifier_reads_metadata_and_defaults_namespace() {
        let doc = json!({"kind": "Deployment", "metadata": {"name": "nginx"}});
        let id = ResourceIdentifier::from_value(&doc, "apps").unwrap();
        assert_eq!(id, ResourceIdentifier::new("Deployment", "nginx", "apps"));
        assert_eq!(id.to_string(), "Deployment/nginx");

        let doc = json!({"kind": "Deployment", "metadata": {"name": "nginx", "namespace": "web"}});
        assert_eq!(ResourceIdentifier::from_value(&doc, "apps").unwrap().namespace, "web");

        assert!(ResourceIdentifier::from_value(&json!({"kind": "Deployment"}), "x").is_none());
        assert!(ResourceIdentifier::from_value(&json!({"metadata": {"name": "a"}}), "x").is_none());
    }

    #[test]
    fn identifiers_order_by_kind_then_name() {
        let a = ResourceIdentifier::new("ConfigMap", "z", "default");
        let b = ResourceIdentifier::new("Deployment", "a", "default");
        assert!(a < b);
    }

    #[test]
    fn deployment_progresses_to_successful() {
        let ready = deployment("nginx", "d1", 3, 3);
        assert_eq!(evaluate_status("Deployment", &ready).unwrap(), ResourceStatus::Successful);

        let partial = deployment("nginx", "d1", 3, 1);
        assert_eq!(evaluate_status("Deployment", &partial).unwrap(), ResourceStatus::InProgress);

        let mut no_status = deployment("nginx", "d1", 3, 3);
        no_status.as_object_mut().unwrap().remove("status");
        assert_eq!(evaluate_status("Deployment", &no_status).unwrap(), ResourceStatus::InProgress);
    }

    #[test]
    fn deployment_with_surplus_old_replicas_is_still_rolling() {
        let mut rolling = deployment("nginx", "d1", 3, 3);
        rolling["status"]["replicas"] = json!(4);
        assert_eq!(evaluate_status("Deployment", &rolling).unwrap(), ResourceStatus::InProgress);
    }

    #[test]
    fn deployment_past_progress_deadline_fails() {
        let mut stuck = deployment("nginx", "d1", 3, 1);
        stuck["status"]["conditions"] = json!([{
            "type": "Progressing",
            "status": "False",
            "reason": "ProgressDeadlineExceeded"
        }]);
        assert_eq!(evaluate_status("Deployment", &stuck).unwrap(), ResourceStatus::Failed);
    }

    #[test]
    fn replica_set_needs_ready_and_available() {
        let rs = replica_set("nginx-abc", "r1", "d1", 3, 3);
        assert_eq!(evaluate_status("ReplicaSet", &rs).unwrap(), ResourceStatus::Successful);
        let rs = replica_set("nginx-abc", "r1", "d1", 3, 2);
        assert_eq!(evaluate_status("ReplicaSet", &rs).unwrap(), ResourceStatus::InProgress);
    }

    #[test]
    fn stateful_set_and_daemon_set_readiness() {
        let sts = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {"name": "db", "namespace": "default"},
            "spec": {
                "replicas": 2,
                "serviceName": "db",
                "selector": {"matchLabels": {"app": "db"}},
                "template": {"spec": {"containers": [{"name": "db", "image": "postgres"}]}}
            },
            "status": {"replicas": 2, "readyReplicas": 2, "updatedReplicas": 1}
        });
        assert_eq!(evaluate_status("StatefulSet", &sts).unwrap(), ResourceStatus::InProgress);

        let ds = json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": {"name": "agent", "namespace": "default"},
            "spec": {
                "selector": {"matchLabels": {"app": "agent"}},
                "template": {"spec": {"containers": [{"name": "agent", "image": "agent"}]}}
            },
            "status": {
                "currentNumberScheduled": 3,
                "desiredNumberScheduled": 3,
                "numberMisscheduled": 0,
                "numberReady": 3,
                "updatedNumberScheduled": 3
            }
        });
        assert_eq!(evaluate_status("DaemonSet", &ds).unwrap(), ResourceStatus::Successful);
    }

    #[test]
    fn pod_phases_and_waiting_reasons() {
        assert_eq!(
            evaluate_status("Pod", &pod("p", "r1", "Running", true)).unwrap(),
            ResourceStatus::Successful
        );
        assert_eq!(
            evaluate_status("Pod", &pod("p", "r1", "Running", false)).unwrap(),
            ResourceStatus::InProgress
        );
        assert_eq!(
            evaluate_status("Pod", &pod("p", "r1", "Succeeded", false)).unwrap(),
            ResourceStatus::Successful
        );
        assert_eq!(
            evaluate_status("Pod", &pod("p", "r1", "Failed", false)).unwrap(),
            ResourceStatus::Failed
        );
        assert_eq!(
            evaluate_status("Pod", &waiting_pod("p", "ImagePullBackOff")).unwrap(),
            ResourceStatus::Failed
        );
        assert_eq!(
            evaluate_status("Pod", &waiting_pod("p", "ContainerCreating")).unwrap(),
            ResourceStatus::InProgress
        );
    }

    #[test]
    fn job_conditions_decide_outcome() {
        let job = |cond: &str| {
            json!({
                "apiVersion": "batch/v1",
                "kind": "Job",
                "metadata": {"name": "migrate", "namespace": "default"},
                "spec": {"template": {"spec": {"containers": [{"name": "m", "image": "m"}]}}},
                "status": {"conditions": [{"type": cond, "status": "True"}]}
            })
        };
        assert_eq!(evaluate_status("Job", &job("Complete")).unwrap(), ResourceStatus::Successful);
        assert_eq!(evaluate_status("Job", &job("Failed")).unwrap(), ResourceStatus::Failed);
        assert_eq!(evaluate_status("Job", &job("Suspended")).unwrap(), ResourceStatus::InProgress);
    }

    #[test]
    fn daemon_set_with_unavailable_pods_is_in_progress() {
        assert_eq!(
            evaluate_status("DaemonSet", &daemon_set("agent", "ds1", 3, 1)).unwrap(),
            ResourceStatus::InProgress
        );
        assert_eq!(
            evaluate_status("DaemonSet", &daemon_set("agent", "ds1", 3, 0)).unwrap(),
            ResourceStatus::Successful
        );
    }

    #[test]
    fn job_past_backoff_limit_fails_without_condition() {
        let retrying = job("migrate", "j1", 2, 2, json!([]));
        assert_eq!(evaluate_status("Job", &retrying).unwrap(), ResourceStatus::InProgress);

        let exhausted = job("migrate", "j1", 2, 3, json!([]));
        assert_eq!(evaluate_status("Job", &exhausted).unwrap(), ResourceStatus::Failed);

        // backoffLimit unset falls back to the Kubernetes default of 6
        let mut unset = job("migrate", "j1", 0, 6, json!([]));
        unset["spec"].as_object_mut().unwrap().remove("backoffLimit");
        assert_eq!(evaluate_status("Job", &unset).unwrap(), ResourceStatus::InProgress);
        unset["status"]["failed"] = json!(7);
        assert_eq!(evaluate_status("Job", &unset).unwrap(), ResourceStatus::Failed);
    }

    #[test]
    fn pvc_and_service_readiness() {
        let pvc = |phase: &str| {
            json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": {"name": "data", "namespace": "default"},
                "status": {"phase": phase}
            })
        };
        assert_eq!(evaluate_status("PersistentVolumeClaim", &pvc("Bound")).unwrap(), ResourceStatus::Successful);
        assert_eq!(evaluate_status("PersistentVolumeClaim", &pvc("Lost")).unwrap(), ResourceStatus::Failed);
        assert_eq!(evaluate_status("PersistentVolumeClaim", &pvc("Pending")).unwrap(), ResourceStatus::InProgress);

        let svc = |type_: &str, ingress: Value| {
            json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "web", "namespace": "default"},
                "spec": {"type": type_},
                "status": {"loadBalancer": {"ingress": ingress}}
            })
        };
        assert_eq!(evaluate_status("Service", &svc("ClusterIP", json!([]))).unwrap(), ResourceStatus::Successful);
        assert_eq!(evaluate_status("Service", &svc("LoadBalancer", json!([]))).unwrap(), ResourceStatus::InProgress);
        assert_eq!(
            evaluate_status("Service", &svc("LoadBalancer", json!([{"hostname": "lb.example.com"}]))).unwrap(),
            ResourceStatus::Successful
        );
    }

    #[test]
    fn unknown_kinds_succeed_once_present() {
        assert_eq!(evaluate_status("ConfigMap", &config_map("cfg")).unwrap(), ResourceStatus::Successful);
        assert_eq!(
            evaluate_status("Certificate", &json!({"kind": "Certificate"})).unwrap(),
            ResourceStatus::Successful
        );
    }

    #[test]
    fn mismatched_document_is_serialization_error() {
        let err = evaluate_status("Deployment", &config_map("cfg")).unwrap_err();
        assert!(matches!(err, Error::Serialization { kind: Some(ref k), .. } if k == "Deployment"));
    }

    #[test]
    fn state_captures_uid_and_owners() {
        let state = ResourceState::from_value(pod("nginx-1", "rs-uid", "Running", true), "default").unwrap();
        assert_eq!(state.identifier, ResourceIdentifier::new("Pod", "nginx-1", "default"));
        assert_eq!(state.status, ResourceStatus::Successful);
        assert_eq!(state.uid.as_deref(), Some("nginx-1-uid"));
        assert!(state.is_owned_by("rs-uid"));
        assert!(!state.is_owned_by("other"));
    }

    #[test]
    fn terminal_statuses() {
        assert!(ResourceStatus::Successful.is_terminal());
        assert!(ResourceStatus::Failed.is_terminal());
        assert!(!ResourceStatus::Pending.is_terminal());
        assert!(!ResourceStatus::InProgress.is_terminal());
        assert_eq!(ResourceStatus::InProgress.to_string(), "InProgress");
    }
}
