//! Resource Status Checker
//!
//! Polls the resources a deployment applied until they are all ready, one
//! of them fails for good, or the deployment timeout runs out.
//!
//! # Phases
//!
//! ```text
//! NotStarted → Polling ⇄ Stabilizing → Completed(Successful | Failed | TimedOut)
//! ```
//!
//! `Stabilizing` is entered when every resource has reached a terminal status
//! but at least one of them failed. A failure only becomes the verdict once it
//! has persisted for the stabilization timeout; a resource going back to a
//! non-terminal status returns the session to `Polling`.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info};

use rudder_common::log::DeploymentLog;
use rudder_common::variables::{names, VariableSet};
use rudder_common::Error;

use crate::reporter::{ResourceMap, ResourceUpdateReporter};
use crate::resource::{ResourceIdentifier, ResourceState, ResourceStatus};
use crate::retriever::{ResourceRetriever, ResourceTree};

/// Default hard ceiling on a session, in seconds
pub const DEFAULT_DEPLOYMENT_TIMEOUT_SECS: u64 = 180;
/// Default time a resource may stay unready, in seconds
pub const DEFAULT_STABILIZATION_TIMEOUT_SECS: u64 = 10;
/// Delay between polling ticks
pub const POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Upper bound on a single resource retrieval
pub const RETRIEVAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Summary written when every resource is ready
pub const SUCCESS_SUMMARY: &str =
    "Resource status check completed successfully because all resources are deployed successfully";
/// Summary written when a resource failed
pub const FAILED_SUMMARY: &str =
    "Resource status check terminated because one or more resources failed to deploy";
/// Summary written when the deployment timeout ran out
pub const TIMED_OUT_SUMMARY: &str = "Resource status check terminated because the timeout has been reached but some resources are still in progress";

/// Timing of a status-check session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCheckConfig {
    /// Hard ceiling on the whole session
    pub deployment_timeout: Duration,
    /// How long a resource may stay unobserved, or a failure may persist
    pub stabilization_timeout: Duration,
    /// Delay between ticks
    pub poll_interval: Duration,
    /// Upper bound on one retrieval
    pub retrieval_timeout: Duration,
}

impl Default for StatusCheckConfig {
    fn default() -> Self {
        Self {
            deployment_timeout: Duration::from_secs(DEFAULT_DEPLOYMENT_TIMEOUT_SECS),
            stabilization_timeout: Duration::from_secs(DEFAULT_STABILIZATION_TIMEOUT_SECS),
            poll_interval: POLL_INTERVAL,
            retrieval_timeout: RETRIEVAL_TIMEOUT,
        }
    }
}

impl StatusCheckConfig {
    /// Read both timeouts from deployment variables.
    pub fn from_variables(variables: &VariableSet) -> Result<Self, Error> {
        Ok(Self {
            deployment_timeout: Duration::from_secs(
                variables.get_u64(names::DEPLOYMENT_TIMEOUT, DEFAULT_DEPLOYMENT_TIMEOUT_SECS)?,
            ),
            stabilization_timeout: Duration::from_secs(variables.get_u64(
                names::STABILIZATION_TIMEOUT,
                DEFAULT_STABILIZATION_TIMEOUT_SECS,
            )?),
            ..Default::default()
        })
    }
}

/// Final verdict of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Every resource is ready
    Successful,
    /// A resource failed and stayed failed
    Failed,
    /// The deployment timeout ran out first
    TimedOut,
}

impl CheckOutcome {
    /// Only `Successful` counts as success
    pub fn is_success(&self) -> bool {
        matches!(self, CheckOutcome::Successful)
    }

    /// The one summary line written for this outcome
    pub fn summary(&self) -> &'static str {
        match self {
            CheckOutcome::Successful => SUCCESS_SUMMARY,
            CheckOutcome::Failed => FAILED_SUMMARY,
            CheckOutcome::TimedOut => TIMED_OUT_SUMMARY,
        }
    }
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckPhase {
    /// Created, no tick yet
    NotStarted,
    /// At least one resource is still moving
    Polling,
    /// Everything settled with a failure, waiting to see if it sticks
    Stabilizing {
        /// When the failure settled
        since: Instant,
    },
    /// Done
    Completed(CheckOutcome),
}

/// State of one status-check run.
#[derive(Debug)]
pub struct StatusCheckSession {
    config: StatusCheckConfig,
    started_at: Instant,
    tracked: Vec<ResourceIdentifier>,
    /// Latest state of every observed resource, tracked and children
    resources: ResourceMap,
    /// Map keys making up each tracked resource's tree, root first
    trees: BTreeMap<ResourceIdentifier, Vec<ResourceIdentifier>>,
    tracked_status: BTreeMap<ResourceIdentifier, ResourceStatus>,
    last_seen: BTreeMap<ResourceIdentifier, Instant>,
    phase: CheckPhase,
}

impl StatusCheckSession {
    /// Start a session for the given top-level resources
    pub fn new(config: StatusCheckConfig, tracked: Vec<ResourceIdentifier>, now: Instant) -> Self {
        Self {
            config,
            started_at: now,
            tracked,
            resources: ResourceMap::new(),
            trees: BTreeMap::new(),
            tracked_status: BTreeMap::new(),
            last_seen: BTreeMap::new(),
            phase: CheckPhase::NotStarted,
        }
    }

    /// Current phase
    pub fn phase(&self) -> CheckPhase {
        self.phase
    }

    /// Latest state of every observed resource
    pub fn resources(&self) -> &ResourceMap {
        &self.resources
    }

    /// Top-level resources being tracked
    pub fn tracked(&self) -> &[ResourceIdentifier] {
        &self.tracked
    }

    /// Status of a tracked resource (`Pending` until first evaluated)
    pub fn tracked_status(&self, id: &ResourceIdentifier) -> ResourceStatus {
        self.tracked_status
            .get(id)
            .copied()
            .unwrap_or(ResourceStatus::Pending)
    }

    /// Last observed state of a tracked resource's root document
    pub fn root_state(&self, id: &ResourceIdentifier) -> Option<&ResourceState> {
        self.trees
            .get(id)
            .and_then(|keys| keys.first())
            .and_then(|key| self.resources.get(key))
    }

    fn replace_tree(&mut self, id: &ResourceIdentifier, tree: Option<ResourceTree>) {
        if let Some(old) = self.trees.remove(id) {
            for key in old {
                self.resources.remove(&key);
            }
        }
        if let Some(tree) = tree {
            let keys: Vec<_> = tree.iter().map(|s| s.identifier.clone()).collect();
            for state in std::iter::once(tree.root).chain(tree.children) {
                self.resources.insert(state.identifier.clone(), state);
            }
            self.trees.insert(id.clone(), keys);
        }
    }

    /// Fold one retrieval result into the session.
    pub fn apply(
        &mut self,
        id: &ResourceIdentifier,
        result: Result<Option<ResourceTree>, Error>,
        now: Instant,
        log: &dyn DeploymentLog,
    ) {
        match result {
            Ok(Some(tree)) => {
                self.last_seen.insert(id.clone(), now);
                self.tracked_status.insert(id.clone(), tree.root.status);
                self.replace_tree(id, Some(tree));
            }
            Ok(None) => {
                let previous = self.tracked_status(id);
                let status = if self.last_seen.contains_key(id) {
                    ResourceStatus::Failed
                } else if now.duration_since(self.started_at) > self.config.stabilization_timeout {
                    ResourceStatus::Failed
                } else {
                    ResourceStatus::Pending
                };
                if status == ResourceStatus::Failed && previous != ResourceStatus::Failed {
                    if self.last_seen.contains_key(id) {
                        log.verbose(&format!("{} in namespace {} no longer exists", id, id.namespace));
                    } else {
                        log.verbose(&format!(
                            "{} in namespace {} was not found within {}s",
                            id,
                            id.namespace,
                            self.config.stabilization_timeout.as_secs()
                        ));
                    }
                }
                self.tracked_status.insert(id.clone(), status);
                self.replace_tree(id, None);
            }
            Err(e) => {
                log.verbose(&format!(
                    "Unable to retrieve {} in namespace {}, retrying on the next check: {}",
                    id, id.namespace, e
                ));
            }
        }
    }

    /// Statuses counted towards the verdict: tracked resources plus current children
    fn statuses(&self) -> Vec<ResourceStatus> {
        let mut statuses = Vec::new();
        for id in &self.tracked {
            statuses.push(self.tracked_status(id));
            if let Some(keys) = self.trees.get(id) {
                statuses.extend(
                    keys.iter()
                        .skip(1)
                        .filter_map(|k| self.resources.get(k))
                        .map(|s| s.status),
                );
            }
        }
        statuses
    }

    /// Move the phase forward after a tick; returns the outcome once decided.
    pub fn advance(&mut self, now: Instant) -> Option<CheckOutcome> {
        let statuses = self.statuses();
        let all_successful = statuses.iter().all(|s| *s == ResourceStatus::Successful);
        let all_terminal = statuses.iter().all(ResourceStatus::is_terminal);

        self.phase = if all_successful {
            CheckPhase::Completed(CheckOutcome::Successful)
        } else if all_terminal {
            let since = match self.phase {
                CheckPhase::Stabilizing { since } => since,
                _ => {
                    debug!("All resources settled with failures, stabilizing");
                    now
                }
            };
            if now.duration_since(since) >= self.config.stabilization_timeout {
                CheckPhase::Completed(CheckOutcome::Failed)
            } else {
                CheckPhase::Stabilizing { since }
            }
        } else {
            CheckPhase::Polling
        };

        match self.phase {
            CheckPhase::Completed(outcome) => Some(outcome),
            _ => None,
        }
    }

    fn time_out(&mut self) -> CheckOutcome {
        self.phase = CheckPhase::Completed(CheckOutcome::TimedOut);
        CheckOutcome::TimedOut
    }
}

/// Result of a finished session
#[derive(Debug)]
pub struct StatusCheckReport {
    /// Verdict
    pub outcome: CheckOutcome,
    /// Number of polling ticks run
    pub check_count: u32,
    session: Option<StatusCheckSession>,
}

impl StatusCheckReport {
    /// Last observed document of a tracked resource
    pub fn last_state(&self, id: &ResourceIdentifier) -> Option<&ResourceState> {
        self.session.as_ref().and_then(|s| s.root_state(id))
    }

    /// Final state of every observed resource
    pub fn resources(&self) -> Option<&ResourceMap> {
        self.session.as_ref().map(StatusCheckSession::resources)
    }
}

/// Drives a [`StatusCheckSession`] against the cluster.
pub struct ResourceStatusChecker<'a> {
    retriever: ResourceRetriever,
    reporter: ResourceUpdateReporter<'a>,
    log: &'a dyn DeploymentLog,
    config: StatusCheckConfig,
}

impl<'a> ResourceStatusChecker<'a> {
    /// Create a checker
    pub fn new(
        retriever: ResourceRetriever,
        reporter: ResourceUpdateReporter<'a>,
        log: &'a dyn DeploymentLog,
        config: StatusCheckConfig,
    ) -> Self {
        Self {
            retriever,
            reporter,
            log,
            config,
        }
    }

    /// Poll `identifiers` until a verdict is reached and write the summary.
    pub async fn check(&self, identifiers: Vec<ResourceIdentifier>) -> StatusCheckReport {
        if identifiers.is_empty() {
            self.log
                .verbose("No resources were found to check, skipping the resource status check");
            return StatusCheckReport {
                outcome: CheckOutcome::Successful,
                check_count: 0,
                session: None,
            };
        }

        self.log
            .info("Performing resource status checks on the following resources:");
        for id in &identifiers {
            self.log
                .info(&format!(" - {} in namespace {}", id, id.namespace));
        }

        let started_at = Instant::now();
        let deadline = started_at + self.config.deployment_timeout;
        let mut session = StatusCheckSession::new(self.config.clone(), identifiers.clone(), started_at);
        let mut check_count = 0u32;

        info!(
            resources = identifiers.len(),
            timeout_secs = self.config.deployment_timeout.as_secs(),
            "Starting resource status check"
        );

        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break session.time_out();
            }

            check_count += 1;
            let per_call = self.config.retrieval_timeout.min(remaining);
            let results = join_all(identifiers.iter().map(|id| async move {
                match tokio::time::timeout(per_call, self.retriever.get_tree(id)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::query(
                        id.to_string(),
                        format!("no response within {}s", per_call.as_secs()),
                    )),
                }
            }))
            .await;

            let now = Instant::now();
            let previous = session.resources().clone();
            for (id, result) in identifiers.iter().zip(results) {
                session.apply(id, result, now, self.log);
            }
            self.reporter
                .report(&previous, session.resources(), check_count);

            if let Some(outcome) = session.advance(now) {
                break outcome;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        };

        match outcome {
            CheckOutcome::Successful => self.log.info(outcome.summary()),
            _ => self.log.error(outcome.summary()),
        }
        info!(?outcome, check_count, "Resource status check finished");

        StatusCheckReport {
            outcome,
            check_count,
            session: Some(session),
        }
    }
}
