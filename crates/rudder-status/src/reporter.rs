//! Resource Update Reporter
//!
//! Compares two snapshots of the session's resources and publishes one
//! `k8s-status` service message per resource that appeared, changed or
//! disappeared. The deployment server renders these as the live object
//! status view.

use std::collections::BTreeMap;

use rudder_common::log::{DeploymentLog, ServiceMessage};
use rudder_common::variables::{flag_token, names, VariableSet};

use crate::resource::{ResourceIdentifier, ResourceState};
use crate::scrub::scrub_volatile;

/// Service message type for resource status updates
pub const STATUS_MESSAGE_NAME: &str = "k8s-status";

/// Snapshot of the session's resources keyed by identifier
pub type ResourceMap = BTreeMap<ResourceIdentifier, ResourceState>;

/// Deployment identifiers stamped on every status event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusEventContext {
    /// Action id
    pub action_id: String,
    /// Step name
    pub step_name: String,
    /// Server task id
    pub task_id: String,
    /// Deployment target id
    pub target_id: String,
    /// Space id
    pub space_id: String,
}

impl StatusEventContext {
    /// Read the identifiers from deployment variables; absent values are empty.
    pub fn from_variables(variables: &VariableSet) -> Self {
        let get = |name: &str| variables.get_or(name, "").to_string();
        Self {
            action_id: get(names::ACTION_ID),
            step_name: get(names::STEP_NAME),
            task_id: get(names::TASK_ID),
            target_id: get(names::MACHINE_ID),
            space_id: get(names::SPACE_ID),
        }
    }
}

/// Publishes per-resource status events.
pub struct ResourceUpdateReporter<'a> {
    context: StatusEventContext,
    log: &'a dyn DeploymentLog,
}

impl<'a> ResourceUpdateReporter<'a> {
    /// Create a reporter writing to `log`
    pub fn new(context: StatusEventContext, log: &'a dyn DeploymentLog) -> Self {
        Self { context, log }
    }

    /// Publish events for everything that differs between two snapshots.
    pub fn report(&self, previous: &ResourceMap, current: &ResourceMap, check_count: u32) {
        for (id, state) in current {
            match previous.get(id) {
                None => {
                    self.log.info(&format!("{} created", id));
                    self.publish(state, false, check_count);
                }
                Some(before) if has_changed(before, state) => {
                    self.log.verbose(&format!(
                        "{} in namespace {} is {}",
                        id, id.namespace, state.status
                    ));
                    self.publish(state, false, check_count);
                }
                Some(_) => {}
            }
        }

        for (id, state) in previous {
            if !current.contains_key(id) {
                self.log.verbose(&format!("{} in namespace {} was removed", id, id.namespace));
                self.publish(state, true, check_count);
            }
        }
    }

    fn publish(&self, state: &ResourceState, removed: bool, check_count: u32) {
        let id = &state.identifier;
        let message = ServiceMessage::new(STATUS_MESSAGE_NAME)
            .with("actionId", &self.context.action_id)
            .with("stepName", &self.context.step_name)
            .with("taskId", &self.context.task_id)
            .with("targetId", &self.context.target_id)
            .with("spaceId", &self.context.space_id)
            .with("uuid", state.uid.clone().unwrap_or_default())
            .with("kind", &id.kind)
            .with("name", &id.name)
            .with("namespace", &id.namespace)
            .with("status", state.status.as_str())
            .with("data", state.raw.to_string())
            .with("removed", flag_token(removed))
            .with("checkCount", check_count.to_string());
        self.log.service_message(&message);
    }
}

/// A change is meaningful when the status moved or the scrubbed document differs
fn has_changed(before: &ResourceState, after: &ResourceState) -> bool {
    before.status != after.status || scrub_volatile(&before.raw) != scrub_volatile(&after.raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::fixtures::*;
    use crate::resource::ResourceStatus;
    use rudder_common::log::{InMemoryLog, LogLevel};

    fn state(raw: serde_json::Value) -> ResourceState {
        ResourceState::from_value(raw, "default").unwrap()
    }

    fn map(states: Vec<ResourceState>) -> ResourceMap {
        states.into_iter().map(|s| (s.identifier.clone(), s)).collect()
    }

    fn context() -> StatusEventContext {
        let vars: VariableSet = [
            (names::ACTION_ID, "Actions-1"),
            (names::STEP_NAME, "Deploy nginx"),
            (names::TASK_ID, "ServerTasks-7"),
            (names::MACHINE_ID, "Machines-3"),
            (names::SPACE_ID, "Spaces-1"),
        ]
        .into_iter()
        .collect();
        StatusEventContext::from_variables(&vars)
    }

    #[test]
    fn new_resource_emits_event_and_created_line() {
        let log = InMemoryLog::new();
        let reporter = ResourceUpdateReporter::new(context(), &log);

        let current = map(vec![state(deployment("nginx-deployment", "d1", 3, 1))]);
        reporter.report(&ResourceMap::new(), &current, 1);

        assert_eq!(
            log.messages_at(LogLevel::Info),
            vec!["Deployment/nginx-deployment created".to_string()]
        );
        let events = log.service_messages_named(STATUS_MESSAGE_NAME);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].keys(),
            vec![
                "actionId", "stepName", "taskId", "targetId", "spaceId", "uuid", "kind", "name",
                "namespace", "status", "data", "removed", "checkCount"
            ]
        );
        assert_eq!(events[0].get("actionId"), Some("Actions-1"));
        assert_eq!(events[0].get("targetId"), Some("Machines-3"));
        assert_eq!(events[0].get("uuid"), Some("d1"));
        assert_eq!(events[0].get("status"), Some("InProgress"));
        assert_eq!(events[0].get("removed"), Some("False"));
        assert_eq!(events[0].get("checkCount"), Some("1"));
    }

    #[test]
    fn unchanged_or_volatile_only_changes_are_silent() {
        let log = InMemoryLog::new();
        let reporter = ResourceUpdateReporter::new(context(), &log);

        let before = map(vec![state(deployment("nginx", "d1", 3, 3))]);
        let mut touched = deployment("nginx", "d1", 3, 3);
        touched["metadata"]["resourceVersion"] = serde_json::json!("2002");
        let after = map(vec![state(touched)]);

        reporter.report(&before, &after, 2);
        assert!(log.service_messages().is_empty());
        assert!(log.lines().is_empty());
    }

    #[test]
    fn status_change_emits_verbose_line() {
        let log = InMemoryLog::new();
        let reporter = ResourceUpdateReporter::new(context(), &log);

        let before = map(vec![state(deployment("nginx", "d1", 3, 1))]);
        let after = map(vec![state(deployment("nginx", "d1", 3, 3))]);
        reporter.report(&before, &after, 2);

        let events = log.service_messages();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("status"), Some("Successful"));
        assert_eq!(
            log.messages_at(LogLevel::Verbose),
            vec!["Deployment/nginx in namespace default is Successful".to_string()]
        );
    }

    #[test]
    fn removed_resource_is_flagged() {
        let log = InMemoryLog::new();
        let reporter = ResourceUpdateReporter::new(StatusEventContext::default(), &log);

        let gone = state(pod("nginx-a", "r1", "Running", true));
        assert_eq!(gone.status, ResourceStatus::Successful);
        reporter.report(&map(vec![gone]), &ResourceMap::new(), 5);

        let events = log.service_messages();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].get("removed"), Some("True"));
        assert_eq!(events[0].get("kind"), Some("Pod"));
        assert_eq!(events[0].get("actionId"), Some(""));
    }
}
