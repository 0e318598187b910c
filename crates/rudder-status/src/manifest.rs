//! Resource identifiers from deployment manifests
//!
//! The status check tracks whatever the deployment applied. Manifests are
//! multi-document YAML files; every document with a kind and a name becomes
//! one identifier. `List` documents contribute their items.

use std::collections::BTreeSet;
use std::path::Path;

use serde_json::Value;
use tracing::debug;

use rudder_common::{yaml, Error};

use crate::resource::ResourceIdentifier;

/// Split a manifest path variable on newlines and `;`.
pub fn split_manifest_paths(raw: &str) -> Vec<String> {
    raw.split(['\n', ';'])
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Identifiers for the given documents, deduplicated in first-seen order.
pub fn identifiers_from_documents(
    documents: &[Value],
    default_namespace: &str,
) -> Vec<ResourceIdentifier> {
    let mut seen = BTreeSet::new();
    let mut identifiers = Vec::new();
    let mut push = |id: ResourceIdentifier| {
        if seen.insert(id.clone()) {
            identifiers.push(id);
        }
    };

    for doc in documents {
        if doc.get("kind").and_then(Value::as_str) == Some("List") {
            let items = doc.get("items").and_then(Value::as_array);
            for item in items.into_iter().flatten() {
                if let Some(id) = ResourceIdentifier::from_value(item, default_namespace) {
                    push(id);
                }
            }
            continue;
        }
        match ResourceIdentifier::from_value(doc, default_namespace) {
            Some(id) => push(id),
            None => debug!("Skipping manifest document without kind or name"),
        }
    }
    identifiers
}

/// Identifiers in one YAML manifest string.
pub fn identifiers_from_manifest(
    manifest: &str,
    default_namespace: &str,
) -> Result<Vec<ResourceIdentifier>, Error> {
    let documents = yaml::parse_documents(manifest)?;
    Ok(identifiers_from_documents(&documents, default_namespace))
}

/// Identifiers across several manifest files, deduplicated.
///
/// Relative paths resolve against `base_dir`. A missing or unparsable file
/// is an error naming the file.
pub fn identifiers_from_files(
    base_dir: &Path,
    paths: &[String],
    default_namespace: &str,
) -> Result<Vec<ResourceIdentifier>, Error> {
    let mut documents = Vec::new();
    for path in paths {
        let full = base_dir.join(path);
        let contents = std::fs::read_to_string(&full).map_err(|e| {
            Error::internal_with_context(
                "manifest",
                format!("failed to read manifest {}: {}", full.display(), e),
            )
        })?;
        let docs = yaml::parse_documents(&contents).map_err(|e| {
            Error::serialization(format!("manifest {} is not valid YAML: {}", full.display(), e))
        })?;
        debug!(path = %full.display(), documents = docs.len(), "Parsed manifest");
        documents.extend(docs);
    }
    Ok(identifiers_from_documents(&documents, default_namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MANIFEST: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: nginx-deployment
spec:
  replicas: 3
---
apiVersion: v1
kind: Service
metadata:
  name: nginx
  namespace: web
---
# empty section
---
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: settings
  - apiVersion: apps/v1
    kind: Deployment
    metadata:
      name: nginx-deployment
"#;

    #[test]
    fn extracts_identifiers_with_default_namespace() {
        let ids = identifiers_from_manifest(MANIFEST, "apps").unwrap();
        assert_eq!(
            ids,
            vec![
                ResourceIdentifier::new("Deployment", "nginx-deployment", "apps"),
                ResourceIdentifier::new("Service", "nginx", "web"),
                ResourceIdentifier::new("ConfigMap", "settings", "apps"),
            ]
        );
    }

    #[test]
    fn documents_without_kind_or_name_are_skipped() {
        let ids = identifiers_from_manifest("foo: bar\n---\nkind: Secret\n", "default").unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn splits_paths_on_newlines_and_semicolons() {
        assert_eq!(
            split_manifest_paths("a.yaml;b.yaml\n c.yaml \n\n;"),
            vec!["a.yaml", "b.yaml", "c.yaml"]
        );
        assert!(split_manifest_paths("  ").is_empty());
    }

    #[test]
    fn reads_files_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = std::fs::File::create(dir.path().join("deploy.yaml")).unwrap();
        writeln!(first, "{}", MANIFEST).unwrap();
        std::fs::write(
            dir.path().join("extra.yaml"),
            "kind: Job\nmetadata:\n  name: migrate\n",
        )
        .unwrap();

        let ids = identifiers_from_files(
            dir.path(),
            &["deploy.yaml".to_string(), "extra.yaml".to_string()],
            "default",
        )
        .unwrap();
        assert_eq!(ids.len(), 4);
        assert_eq!(ids[3], ResourceIdentifier::new("Job", "migrate", "default"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = identifiers_from_files(dir.path(), &["nope.yaml".to_string()], "default")
            .unwrap_err();
        assert!(err.to_string().contains("nope.yaml"));
    }
}
