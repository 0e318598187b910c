//! Resource trees
//!
//! A tracked workload is only ready when the objects it owns are. The
//! retriever fetches a tracked resource and walks ownership down to pods:
//! Deployment → ReplicaSet → Pod, and StatefulSet/DaemonSet/Job → Pod.

use std::sync::Arc;

use serde_json::Value;

use rudder_common::Error;

use crate::kubectl::ResourceQuery;
use crate::resource::{ResourceIdentifier, ResourceState};

/// A tracked resource and everything it (transitively) owns.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTree {
    /// The tracked resource
    pub root: ResourceState,
    /// Owned resources, parents before children
    pub children: Vec<ResourceState>,
}

impl ResourceTree {
    /// Root followed by children
    pub fn iter(&self) -> impl Iterator<Item = &ResourceState> {
        std::iter::once(&self.root).chain(self.children.iter())
    }
}

/// Child kinds owned by a kind, outermost first
fn child_kinds(kind: &str) -> &'static [&'static str] {
    match kind {
        "Deployment" => &["ReplicaSet", "Pod"],
        "StatefulSet" | "DaemonSet" | "Job" => &["Pod"],
        _ => &[],
    }
}

/// Builds [`ResourceTree`]s from a [`ResourceQuery`].
#[derive(Clone)]
pub struct ResourceRetriever {
    query: Arc<dyn ResourceQuery>,
}

impl ResourceRetriever {
    /// Create a retriever over the given query primitive
    pub fn new(query: Arc<dyn ResourceQuery>) -> Self {
        Self { query }
    }

    /// Fetch `id` and the resources it owns.
    ///
    /// `Ok(None)` when the tracked resource does not exist. Any failed query,
    /// including a child listing, fails the whole retrieval so the caller
    /// keeps its previous view.
    pub async fn get_tree(&self, id: &ResourceIdentifier) -> Result<Option<ResourceTree>, Error> {
        let Some(raw) = self.query.get(id).await? else {
            return Ok(None);
        };
        let root = ResourceState::from_value(raw, &id.namespace)?;

        let mut children = Vec::new();
        let mut owner_uids: Vec<String> = root.uid.iter().cloned().collect();
        for kind in child_kinds(&id.kind) {
            if owner_uids.is_empty() {
                break;
            }
            let listed = self.query.list(kind, &id.namespace).await?;
            let owned = owned_states(listed, &owner_uids, &id.namespace)?;
            owner_uids = owned.iter().filter_map(|s| s.uid.clone()).collect();
            children.extend(owned);
        }

        Ok(Some(ResourceTree { root, children }))
    }
}

fn owned_states(
    listed: Vec<Value>,
    owner_uids: &[String],
    namespace: &str,
) -> Result<Vec<ResourceState>, Error> {
    let mut owned = Vec::new();
    for raw in listed {
        let state = ResourceState::from_value(raw, namespace)?;
        if owner_uids.iter().any(|uid| state.is_owned_by(uid)) {
            owned.push(state);
        }
    }
    owned.sort_by(|a, b| a.identifier.cmp(&b.identifier));
    Ok(owned)
}
