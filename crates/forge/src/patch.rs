//! Configuration patch engine.
//!
//! Produces the final machine-configuration patch for one node: discovers
//! the per-role patch files, deep-merges them in order, renders the result
//! against the node's runtime values, and converts it to the JSON form the
//! configuration-apply interface accepts.
//!
//! Given identical input files and node context the output is byte-for-byte
//! reproducible, which keeps redeployments idempotent.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use handlebars::Handlebars;
use serde::Serialize;
use serde_yaml::Value as Yaml;

use crate::error::DeployError;
use crate::node::{Node, Role};

/// Node-scoped values exposed to patch templates.
///
/// Templates reference these as `{{name}}`, `{{address}}` and `{{role}}`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeContext {
    pub name: String,
    pub address: String,
    pub role: String,
}

impl NodeContext {
    #[must_use]
    pub fn new(node: &Node, address: &str) -> Self {
        Self {
            name: node.name().to_string(),
            address: address.to_string(),
            role: node.role().to_string(),
        }
    }
}

/// List the patch files for a role.
///
/// Looks at the directory named after the role under `base_dir`,
/// non-recursively, and keeps regular files whose name contains `yaml`.
/// Results are sorted by file name so the merge order is stable.
///
/// # Errors
///
/// Returns [`DeployError::Discovery`] if the directory cannot be read or
/// yields zero patch files; a role without patches is a configuration
/// error, not something to skip silently.
pub fn discover_patch_files(base_dir: &Path, role: Role) -> Result<Vec<PathBuf>, DeployError> {
    let dir = base_dir.join(role.as_str());
    let entries = std::fs::read_dir(&dir).map_err(|e| {
        DeployError::Discovery(format!("cannot read patch directory {}: {e}", dir.display()))
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| DeployError::io(&dir, e))?;
        let file_type = entry.file_type().map_err(|e| DeployError::io(entry.path(), e))?;
        if file_type.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().contains("yaml") {
            files.push(entry.path());
        }
    }
    files.sort();

    if files.is_empty() {
        return Err(DeployError::Discovery(format!(
            "no patch files for role {role} in {}",
            dir.display()
        )));
    }
    Ok(files)
}

/// Read each file in the given order and deep-merge it into an accumulator.
///
/// Maps merge key-by-key; two non-map values at the same key are replaced by
/// the later file (arrays are replaced, never concatenated).
///
/// # Errors
///
/// Returns an I/O error if a file is unreadable and [`DeployError::Merge`]
/// if two files are structurally incompatible (a map in one, a scalar in
/// the other, at the same path).
pub fn merge_documents(paths: &[PathBuf]) -> Result<String, DeployError> {
    let mut acc: Option<Yaml> = None;
    for path in paths {
        let text = std::fs::read_to_string(path).map_err(|e| DeployError::io(path, e))?;
        let doc: Yaml = serde_yaml::from_str(&text)?;
        acc = Some(match acc {
            None => doc,
            Some(existing) => deep_merge(existing, doc, "")?,
        });
    }
    let merged = acc.unwrap_or(Yaml::Null);
    Ok(serde_yaml::to_string(&merged)?)
}

fn deep_merge(base: Yaml, overlay: Yaml, path: &str) -> Result<Yaml, DeployError> {
    match (base, overlay) {
        (Yaml::Mapping(mut base), Yaml::Mapping(overlay)) => {
            for (key, value) in overlay {
                let key_path = format!("{path}/{}", key_to_string(&key).unwrap_or_default());
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value, &key_path)?,
                    None => value,
                };
                base.insert(key, merged);
            }
            Ok(Yaml::Mapping(base))
        }
        (Yaml::Mapping(_), _) => Err(DeployError::Merge {
            path: path.to_string(),
            detail: "a later file replaces a map with a non-map value".to_string(),
        }),
        (base, Yaml::Mapping(_)) if !matches!(base, Yaml::Null) => Err(DeployError::Merge {
            path: path.to_string(),
            detail: "a later file replaces a non-map value with a map".to_string(),
        }),
        (_, overlay) => Ok(overlay),
    }
}

/// Render the merged patch text against a node's runtime values.
///
/// Uses strict substitution: an unresolved reference is an error, not an
/// empty string.
///
/// # Errors
///
/// Returns [`DeployError::Template`] on syntax errors or unresolved
/// references.
pub fn render_template(merged: &str, ctx: &NodeContext) -> Result<String, DeployError> {
    let mut registry = Handlebars::new();
    registry.set_strict_mode(true);
    Ok(registry.render_template(merged, ctx)?)
}

/// Convert rendered YAML to the JSON encoding the configuration-apply
/// interface accepts.
///
/// All mapping keys are normalized to strings first; generic YAML allows
/// non-string keys, JSON does not.
///
/// # Errors
///
/// Returns a YAML parse error, or [`DeployError::JsonIncompatible`] for
/// values JSON cannot represent (non-scalar keys, non-finite floats).
pub fn yaml_to_json(yaml: &str) -> Result<String, DeployError> {
    let value: Yaml = serde_yaml::from_str(yaml)?;
    let json = to_json_value(value)?;
    Ok(serde_json::to_string(&json)?)
}

fn to_json_value(value: Yaml) -> Result<serde_json::Value, DeployError> {
    use serde_json::Value as Json;
    match value {
        Yaml::Null => Ok(Json::Null),
        Yaml::Bool(b) => Ok(Json::Bool(b)),
        Yaml::Number(n) => {
            let number = if let Some(i) = n.as_i64() {
                serde_json::Number::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Number::from(u)
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                serde_json::Number::from_f64(f)
                    .ok_or_else(|| DeployError::JsonIncompatible(format!("number {n:?}")))?
            };
            Ok(Json::Number(number))
        }
        Yaml::String(s) => Ok(Json::String(s)),
        Yaml::Sequence(seq) => Ok(Json::Array(
            seq.into_iter().map(to_json_value).collect::<Result<_, _>>()?,
        )),
        Yaml::Mapping(map) => {
            let mut object = serde_json::Map::new();
            for (key, value) in map {
                let key = key_to_string(&key)
                    .ok_or_else(|| DeployError::JsonIncompatible(format!("map key {key:?}")))?;
                object.insert(key, to_json_value(value)?);
            }
            Ok(Json::Object(object))
        }
        Yaml::Tagged(tagged) => to_json_value(tagged.value),
    }
}

fn key_to_string(key: &Yaml) -> Option<String> {
    match key {
        Yaml::String(s) => Some(s.clone()),
        Yaml::Bool(b) => Some(b.to_string()),
        Yaml::Number(n) => Some(n.to_string()),
        Yaml::Null => Some("null".to_string()),
        _ => None,
    }
}

/// The synthetic disk-install patch applied before any role patch.
///
/// # Errors
///
/// Returns a JSON serialization error.
pub fn install_disk_patch(disk: &str) -> Result<String, DeployError> {
    let patch = serde_json::json!({
        "machine": {
            "install": {
                "disk": disk,
            }
        }
    });
    Ok(serde_json::to_string(&patch)?)
}

#[derive(Serialize)]
struct KubeletPatch<T: Serialize> {
    machine: KubeletMachine<T>,
}

#[derive(Serialize)]
struct KubeletMachine<T: Serialize> {
    kubelet: T,
}

#[derive(Serialize)]
struct ExtraArgs {
    #[serde(rename = "extraArgs")]
    extra_args: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct ExtraConfig {
    #[serde(rename = "extraConfig")]
    extra_config: BTreeMap<String, String>,
}

/// YAML patch setting extra kubelet arguments.
///
/// # Errors
///
/// Returns a YAML serialization error.
pub fn kubelet_extra_args_patch(args: BTreeMap<String, String>) -> Result<String, DeployError> {
    let patch = KubeletPatch {
        machine: KubeletMachine {
            kubelet: ExtraArgs { extra_args: args },
        },
    };
    Ok(serde_yaml::to_string(&patch)?)
}

/// YAML patch setting extra kubelet configuration.
///
/// # Errors
///
/// Returns a YAML serialization error.
pub fn kubelet_extra_config_patch(
    config: BTreeMap<String, String>,
) -> Result<String, DeployError> {
    let patch = KubeletPatch {
        machine: KubeletMachine {
            kubelet: ExtraConfig {
                extra_config: config,
            },
        },
    };
    Ok(serde_yaml::to_string(&patch)?)
}

/// YAML patch binding the shared VIP to interfaces matched by driver.
///
/// # Errors
///
/// Returns a YAML serialization error.
pub fn vip_patch(driver: &str, ip: &str) -> Result<String, DeployError> {
    let patch = serde_json::json!({
        "machine": {
            "network": {
                "interfaces": [{
                    "deviceSelector": { "driver": driver },
                    "vip": { "ip": ip },
                }]
            }
        }
    });
    Ok(serde_yaml::to_string(&patch)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(label: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("forge-patch-{label}-{nanos}"));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    fn ctx(name: &str, address: &str, role: &str) -> NodeContext {
        NodeContext {
            name: name.to_string(),
            address: address.to_string(),
            role: role.to_string(),
        }
    }

    #[test]
    fn discovery_lists_yaml_files_sorted() {
        let base = temp_dir("discover");
        let dir = base.join("controlplane");
        fs::create_dir_all(&dir).unwrap();
        write(&dir, "b.yaml", "b: 1");
        write(&dir, "a.yaml.tmpl", "a: 1");
        write(&dir, "notes.txt", "ignored");
        fs::create_dir_all(dir.join("sub.yaml")).unwrap();

        let files = discover_patch_files(&base, Role::ControlPlane).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.yaml.tmpl", "b.yaml"]);
    }

    #[test]
    fn discovery_fails_on_empty_role_directory() {
        let base = temp_dir("empty");
        fs::create_dir_all(base.join("worker")).unwrap();
        let err = discover_patch_files(&base, Role::Worker).unwrap_err();
        assert!(matches!(err, DeployError::Discovery(_)));
    }

    #[test]
    fn merge_deep_merges_maps_and_replaces_scalars() {
        let dir = temp_dir("merge");
        let a = write(&dir, "a.yaml", "machine:\n  kubelet:\n    image: a\n  token: one\n");
        let b = write(&dir, "b.yaml", "machine:\n  token: two\n");

        let merged = merge_documents(&[a, b]).unwrap();
        let value: Yaml = serde_yaml::from_str(&merged).unwrap();
        assert_eq!(value["machine"]["token"], Yaml::from("two"));
        assert_eq!(value["machine"]["kubelet"]["image"], Yaml::from("a"));
    }

    #[test]
    fn merge_replaces_arrays_wholesale() {
        let dir = temp_dir("arrays");
        let a = write(&dir, "a.yaml", "nets:\n  - one\n  - two\n");
        let b = write(&dir, "b.yaml", "nets:\n  - three\n");

        let merged = merge_documents(&[a, b]).unwrap();
        let value: Yaml = serde_yaml::from_str(&merged).unwrap();
        assert_eq!(value["nets"].as_sequence().unwrap().len(), 1);
    }

    #[test]
    fn merge_is_associative_in_order() {
        let dir = temp_dir("assoc");
        let a = write(&dir, "a.yaml", "m:\n  x: 1\n  y: 1\n");
        let b = write(&dir, "b.yaml", "m:\n  y: 2\n  z: 2\n");
        let c = write(&dir, "c.yaml", "m:\n  z: 3\n");

        let all = merge_documents(&[a.clone(), b.clone(), c.clone()]).unwrap();

        let ab = merge_documents(&[a, b]).unwrap();
        let ab_file = write(&dir, "ab.yaml", &ab);
        let stepped = merge_documents(&[ab_file, c]).unwrap();

        assert_eq!(all, stepped);
    }

    #[test]
    fn merge_rejects_map_over_scalar() {
        let dir = temp_dir("conflict");
        let a = write(&dir, "a.yaml", "machine:\n  install: /dev/vda\n");
        let b = write(&dir, "b.yaml", "machine:\n  install:\n    disk: /dev/vdb\n");

        let err = merge_documents(&[a, b]).unwrap_err();
        match err {
            DeployError::Merge { path, .. } => assert!(path.contains("install")),
            other => panic!("expected merge error, got {other}"),
        }
    }

    #[test]
    fn template_substitutes_node_fields() {
        let rendered = render_template(
            "machine:\n  network:\n    hostname: {{name}}\n  address: {{address}}\n",
            &ctx("talos-controlplane-0", "10.0.0.5", "controlplane"),
        )
        .unwrap();
        assert!(rendered.contains("hostname: talos-controlplane-0"));
        assert!(rendered.contains("address: 10.0.0.5"));
    }

    #[test]
    fn template_fails_on_unresolved_reference() {
        let err = render_template("value: {{missing}}", &ctx("n", "a", "worker")).unwrap_err();
        assert!(matches!(err, DeployError::Template(_)));
    }

    #[test]
    fn yaml_to_json_normalizes_non_string_keys() {
        let json = yaml_to_json("1: one\ntrue: 2\nname: talos\n").unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["1"], "one");
        assert_eq!(value["true"], 2);
        assert_eq!(value["name"], "talos");
    }

    #[test]
    fn yaml_to_json_is_idempotent_on_its_own_output() {
        let first = yaml_to_json("machine:\n  install:\n    disk: /dev/vda\n  3: three\n").unwrap();
        // JSON is valid YAML; a second pass must yield identical bytes.
        let second = yaml_to_json(&first).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn scalar_leaves_round_trip() {
        let json = yaml_to_json("a: text\nb: 42\nc: true\nd: 1.5\n").unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["a"], "text");
        assert_eq!(value["b"], 42);
        assert_eq!(value["c"], true);
        assert_eq!(value["d"], 1.5);
    }

    #[test]
    fn install_disk_patch_shape() {
        let patch = install_disk_patch("/dev/vda").unwrap();
        let value: serde_json::Value = serde_json::from_str(&patch).unwrap();
        assert_eq!(value["machine"]["install"]["disk"], "/dev/vda");
    }

    #[test]
    fn kubelet_patch_shapes() {
        let mut args = BTreeMap::new();
        args.insert("max-pods".to_string(), "200".to_string());
        let patch = kubelet_extra_args_patch(args).unwrap();
        let value: Yaml = serde_yaml::from_str(&patch).unwrap();
        assert_eq!(
            value["machine"]["kubelet"]["extraArgs"]["max-pods"],
            Yaml::from("200")
        );

        let mut config = BTreeMap::new();
        config.insert("serializeImagePulls".to_string(), "false".to_string());
        let patch = kubelet_extra_config_patch(config).unwrap();
        let value: Yaml = serde_yaml::from_str(&patch).unwrap();
        assert_eq!(
            value["machine"]["kubelet"]["extraConfig"]["serializeImagePulls"],
            Yaml::from("false")
        );
    }

    #[test]
    fn vip_patch_shape() {
        let patch = vip_patch("virtio_net", "192.168.4.9").unwrap();
        let value: Yaml = serde_yaml::from_str(&patch).unwrap();
        let interfaces = value["machine"]["network"]["interfaces"]
            .as_sequence()
            .unwrap();
        assert_eq!(interfaces[0]["vip"]["ip"], Yaml::from("192.168.4.9"));
        assert_eq!(
            interfaces[0]["deviceSelector"]["driver"],
            Yaml::from("virtio_net")
        );
    }
}
