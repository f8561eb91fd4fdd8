//! Structured patching of Kubernetes manifests.
//!
//! Manifests are parsed into YAML values, patched in place, and
//! re-serialized. Only container `image:` references that point at the
//! managed image are rewritten; every other field survives the round
//! trip. Deployment metadata gains `capstan.io/*` annotations identifying
//! the run that produced it.

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::{AdapterError, AdapterResult};

/// Annotations stamped onto a patched release manifest.
#[derive(Debug, Clone)]
pub struct DeployAnnotations {
    pub deployment_id: String,
    pub commit: String,
    pub branch: String,
    /// RFC 3339 timestamp of the patch.
    pub timestamp: String,
}

impl DeployAnnotations {
    fn entries(&self) -> [(&'static str, &str); 4] {
        [
            ("capstan.io/deployment-id", &self.deployment_id),
            ("capstan.io/commit", &self.commit),
            ("capstan.io/branch", &self.branch),
            ("capstan.io/deployed-at", &self.timestamp),
        ]
    }
}

/// Rewrite every reference to `image` (bare or tagged) to `image_tag` and
/// stamp deploy annotations on each document that was rewritten.
///
/// Fails if no document references the managed image — that points at a
/// misconfigured manifest, not a patchable one.
pub fn patch_release_manifest(
    content: &str,
    image: &str,
    image_tag: &str,
    annotations: &DeployAnnotations,
) -> AdapterResult<String> {
    let mut docs = parse_documents(content)?;

    let mut total_rewrites = 0;
    for doc in &mut docs {
        let rewrites = rewrite_image_refs(doc, image, image_tag);
        if rewrites > 0 {
            annotate_metadata(doc, annotations);
            total_rewrites += rewrites;
        }
    }

    if total_rewrites == 0 {
        return Err(AdapterError::Manifest(format!(
            "no container references image `{image}`"
        )));
    }

    serialize_documents(&docs)
}

/// Upsert deployment info into a ConfigMap manifest's `data` section.
pub fn patch_config_manifest(
    content: &str,
    annotations: &DeployAnnotations,
    image_tag: &str,
) -> AdapterResult<String> {
    let mut docs = parse_documents(content)?;

    for doc in &mut docs {
        let Value::Mapping(map) = doc else { continue };
        let data = map
            .entry(Value::from("data"))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        let Value::Mapping(data) = data else {
            return Err(AdapterError::Manifest(
                "config manifest `data` is not a mapping".to_string(),
            ));
        };
        for (key, value) in [
            ("DEPLOYMENT_ID", annotations.deployment_id.as_str()),
            ("COMMIT_HASH", annotations.commit.as_str()),
            ("BRANCH", annotations.branch.as_str()),
            ("DEPLOYED_AT", annotations.timestamp.as_str()),
            ("IMAGE_TAG", image_tag),
        ] {
            data.insert(Value::from(key), Value::from(value));
        }
    }

    serialize_documents(&docs)
}

fn parse_documents(content: &str) -> AdapterResult<Vec<Value>> {
    let mut docs = Vec::new();
    for de in serde_yaml::Deserializer::from_str(content) {
        let value = Value::deserialize(de)
            .map_err(|e| AdapterError::Manifest(format!("invalid YAML: {e}")))?;
        if !matches!(value, Value::Null) {
            docs.push(value);
        }
    }
    if docs.is_empty() {
        return Err(AdapterError::Manifest("manifest is empty".to_string()));
    }
    Ok(docs)
}

fn serialize_documents(docs: &[Value]) -> AdapterResult<String> {
    let mut rendered = Vec::with_capacity(docs.len());
    for doc in docs {
        rendered.push(
            serde_yaml::to_string(doc)
                .map_err(|e| AdapterError::Manifest(format!("serialize: {e}")))?,
        );
    }
    Ok(rendered.join("---\n"))
}

/// Recursively rewrite `image:` values that reference the managed image.
/// Returns the number of rewrites.
fn rewrite_image_refs(value: &mut Value, image: &str, image_tag: &str) -> usize {
    let tagged_prefix = format!("{image}:");
    match value {
        Value::Mapping(map) => {
            let mut count = 0;
            for (key, val) in map.iter_mut() {
                if key.as_str() == Some("image") {
                    if let Some(current) = val.as_str()
                        && (current == image || current.starts_with(&tagged_prefix))
                    {
                        *val = Value::from(image_tag);
                        count += 1;
                        continue;
                    }
                }
                count += rewrite_image_refs(val, image, image_tag);
            }
            count
        }
        Value::Sequence(seq) => seq
            .iter_mut()
            .map(|v| rewrite_image_refs(v, image, image_tag))
            .sum(),
        _ => 0,
    }
}

/// Upsert `capstan.io/*` annotations under the document's top-level
/// `metadata.annotations`, creating either mapping if missing.
fn annotate_metadata(doc: &mut Value, annotations: &DeployAnnotations) {
    let Value::Mapping(map) = doc else { return };
    let metadata = map
        .entry(Value::from("metadata"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let Value::Mapping(metadata) = metadata else { return };
    let anns = metadata
        .entry(Value::from("annotations"))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    let Value::Mapping(anns) = anns else { return };
    for (key, value) in annotations.entries() {
        anns.insert(Value::from(key), Value::from(value));
    }
}
