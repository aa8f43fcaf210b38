//! Ordered schema migrations over the raw JSON descriptor.
//!
//! Each step upgrades a descriptor by exactly one version. Descriptors newer
//! than this build understands are returned untouched.

use std::path::Path;

use kubebox_shared::constants::CONFIG_VERSION;
use kubebox_shared::errors::{KubeboxError, KubeboxResult};
use serde_json::{Map, Value};

type Migration = fn(Value) -> KubeboxResult<Value>;

/// `(from_version, step)`; each step yields `from_version + 1`.
const MIGRATIONS: &[(u32, Migration)] = &[(1, v1_to_v2), (2, v2_to_v3), (3, v3_to_v4)];

/// Schema version recorded in a raw descriptor. Missing means the oldest.
pub fn config_version(value: &Value) -> u32 {
    value
        .get("config_version")
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(1)
        .max(1)
}

/// Apply every migration from the descriptor's version up to the current one.
pub fn migrate_to_current(mut value: Value) -> KubeboxResult<Value> {
    let mut version = config_version(&value);
    for (from, step) in MIGRATIONS {
        if *from < version {
            continue;
        }
        tracing::info!(from = *from, to = *from + 1, "Migrating machine descriptor");
        value = step(value)?;
        version = *from + 1;
        set_version(&mut value, version)?;
    }
    if version != CONFIG_VERSION {
        return Err(KubeboxError::Internal(format!(
            "migration chain ended at version {} instead of {}",
            version, CONFIG_VERSION
        )));
    }
    Ok(value)
}

fn set_version(value: &mut Value, version: u32) -> KubeboxResult<()> {
    root_object(value)?.insert("config_version".to_string(), Value::from(version));
    Ok(())
}

fn root_object(value: &mut Value) -> KubeboxResult<&mut Map<String, Value>> {
    value
        .as_object_mut()
        .ok_or_else(|| KubeboxError::Config("machine descriptor is not a JSON object".to_string()))
}

fn object_field<'a>(
    parent: &'a mut Map<String, Value>,
    key: &str,
) -> Option<&'a mut Map<String, Value>> {
    parent.get_mut(key).and_then(Value::as_object_mut)
}

// v1 called the runtime settings "engine_options" and didn't record a
// certificate directory.
fn v1_to_v2(mut value: Value) -> KubeboxResult<Value> {
    let root = root_object(&mut value)?;
    if let Some(options) = object_field(root, "machine_options") {
        if let Some(engine) = options.remove("engine_options")
            && !options.contains_key("runtime_options")
        {
            options.insert("runtime_options".to_string(), engine);
        }

        if let Some(auth) = object_field(options, "auth_options") {
            let missing = auth
                .get("cert_dir")
                .and_then(Value::as_str)
                .is_none_or(str::is_empty);
            let derived = auth
                .get("ca_cert_path")
                .and_then(Value::as_str)
                .and_then(|p| Path::new(p).parent())
                .map(|p| p.to_string_lossy().into_owned());
            if missing && let Some(dir) = derived {
                auth.insert("cert_dir".to_string(), Value::from(dir));
            }
        }
    }
    Ok(value)
}

// v2 stored a single insecure registry and registry mirror as scalars.
fn v2_to_v3(mut value: Value) -> KubeboxResult<Value> {
    let root = root_object(&mut value)?;
    if let Some(options) = object_field(root, "machine_options")
        && let Some(runtime) = object_field(options, "runtime_options")
    {
        fold_scalar_into_list(runtime, "insecure_registry", "insecure_registry_list");
        fold_scalar_into_list(runtime, "registry_mirror", "registry_mirror_list");
    }
    Ok(value)
}

/// Driver configuration that v1 to v3 descriptors embedded as a JSON tree
/// under `driver`, serialized back to bytes.
pub fn embedded_driver_config(value: &Value) -> KubeboxResult<Option<Vec<u8>>> {
    match value.get("driver") {
        None | Some(Value::Null) => Ok(None),
        Some(driver) => Ok(Some(serde_json::to_vec(driver)?)),
    }
}

// v4 keeps the driver's bytes beside the descriptor, so the embedded tree is
// dropped once the store has taken it with `embedded_driver_config`.
fn v3_to_v4(mut value: Value) -> KubeboxResult<Value> {
    root_object(&mut value)?.remove("driver");
    Ok(value)
}

fn fold_scalar_into_list(map: &mut Map<String, Value>, scalar: &str, list: &str) {
    let Some(old) = map.remove(scalar) else {
        return;
    };
    let entries = map
        .entry(list.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(entries) = entries.as_array_mut() else {
        return;
    };

    let values = match old {
        Value::String(s) if !s.is_empty() => vec![Value::String(s)],
        Value::Array(items) => items,
        _ => Vec::new(),
    };
    for v in values {
        if !entries.contains(&v) {
            entries.push(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_detection() {
        assert_eq!(config_version(&json!({"config_version": 2})), 2);
        assert_eq!(config_version(&json!({})), 1);
        assert_eq!(config_version(&json!({"config_version": 0})), 1);
    }

    #[test]
    fn test_v1_full_chain() {
        let v1 = json!({
            "config_version": 1,
            "name": "old",
            "machine_options": {
                "driver": "none",
                "auth_options": {"ca_cert_path": "/home/u/.kubebox/certs/ca.pem"},
                "engine_options": {
                    "storage_driver": "aufs",
                    "insecure_registry": "10.0.0.0/24",
                    "registry_mirror": ["https://mirror.local"]
                }
            },
            "driver": {"machine_name": "old"}
        });

        assert_eq!(
            embedded_driver_config(&v1).unwrap().unwrap(),
            br#"{"machine_name":"old"}"#.to_vec()
        );

        let current = migrate_to_current(v1).unwrap();
        assert_eq!(current["config_version"], json!(CONFIG_VERSION));
        assert!(current.get("driver").is_none());

        let opts = &current["machine_options"];
        assert!(opts.get("engine_options").is_none());
        assert_eq!(opts["auth_options"]["cert_dir"], json!("/home/u/.kubebox/certs"));

        let runtime = &opts["runtime_options"];
        assert_eq!(runtime["storage_driver"], json!("aufs"));
        assert_eq!(runtime["insecure_registry_list"], json!(["10.0.0.0/24"]));
        assert_eq!(runtime["registry_mirror_list"], json!(["https://mirror.local"]));
        assert!(runtime.get("insecure_registry").is_none());
    }

    #[test]
    fn test_v2_merges_without_duplicates() {
        let v2 = json!({
            "config_version": 2,
            "machine_options": {
                "runtime_options": {
                    "insecure_registry": "reg.local",
                    "insecure_registry_list": ["reg.local", "other.local"]
                }
            }
        });
        let v3 = migrate_to_current(v2).unwrap();
        assert_eq!(
            v3["machine_options"]["runtime_options"]["insecure_registry_list"],
            json!(["reg.local", "other.local"])
        );
    }

    #[test]
    fn test_existing_cert_dir_kept() {
        let v1 = json!({
            "config_version": 1,
            "machine_options": {
                "auth_options": {"cert_dir": "/custom", "ca_cert_path": "/elsewhere/ca.pem"}
            }
        });
        let v3 = migrate_to_current(v1).unwrap();
        assert_eq!(v3["machine_options"]["auth_options"]["cert_dir"], json!("/custom"));
    }

    #[test]
    fn test_v3_without_driver() {
        let v3 = json!({"config_version": 3, "name": "bare", "driver": null});
        assert!(embedded_driver_config(&v3).unwrap().is_none());
        let v4 = migrate_to_current(v3).unwrap();
        assert_eq!(v4["config_version"], json!(4));
        assert!(v4.get("driver").is_none());
    }

    #[test]
    fn test_current_is_untouched() {
        let current = json!({"config_version": CONFIG_VERSION, "name": "x"});
        assert_eq!(migrate_to_current(current.clone()).unwrap(), current);
    }

    #[test]
    fn test_non_object_rejected() {
        assert!(migrate_to_current(json!([1, 2, 3])).is_err());
    }
}
