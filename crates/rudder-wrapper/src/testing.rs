//! Fakes shared by this crate's unit tests

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use rudder_aws::{AwsIdentity, ClusterCatalog, EksCluster};
use rudder_common::Error;

/// Untagged cluster with a predictable ARN and endpoint
pub(crate) fn cluster(name: &str) -> EksCluster {
    EksCluster {
        name: name.to_string(),
        arn: format!("arn:aws:eks:us-east-1:123456789012:cluster/{}", name),
        endpoint: Some(format!("https://{}.eks.amazonaws.com", name)),
        tags: BTreeMap::new(),
    }
}

/// Catalog returning the same clusters for every region
#[derive(Default)]
pub(crate) struct StaticCatalog {
    clusters: Vec<EksCluster>,
    regions: Mutex<Vec<String>>,
}

impl StaticCatalog {
    pub(crate) fn with_clusters(clusters: Vec<EksCluster>) -> Self {
        Self {
            clusters,
            regions: Mutex::default(),
        }
    }

    /// Regions asked for so far
    pub(crate) fn regions(&self) -> Vec<String> {
        self.regions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClusterCatalog for StaticCatalog {
    async fn list_clusters(
        &self,
        _identity: &AwsIdentity,
        region: &str,
    ) -> Result<Vec<EksCluster>, Error> {
        self.regions.lock().unwrap().push(region.to_string());
        Ok(self.clusters.clone())
    }
}
