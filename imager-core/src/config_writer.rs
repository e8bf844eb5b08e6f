//! Forwarding of the recipe's opaque `offspot`/`write_config` blobs onto the
//! populated data partition (ambient addition, §3 of the expanded spec).
//!
//! The core treats these blobs as opaque JSON; it does not know or care
//! what consumes them on first boot. A [`ConfigWriter`] only needs to know
//! how to serialise a [`serde_json::Value`] to a destination path.

use std::path::Path;

/// Writes an opaque configuration blob, named `name` (e.g. `"offspot"`), to
/// a mount point.
pub trait ConfigWriter {
    /// The error type this writer can fail with.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Writes `value` under `mount_root`, skipping `Value::Null`.
    fn write(&self, mount_root: &Path, name: &str, value: &serde_json::Value) -> Result<(), Self::Error>;
}

/// Writes each blob as a YAML file under `<mount_root>/boot/<name>.yaml`,
/// skipping `serde_json::Value::Null` (an absent blob in the recipe).
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlConfigWriter;

impl ConfigWriter for YamlConfigWriter {
    type Error = Error;

    fn write(&self, mount_root: &Path, name: &str, value: &serde_json::Value) -> Result<(), Error> {
        self.write_named(mount_root, name, value)
    }
}

/// Errors raised while writing a config blob.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Filesystem I/O failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The blob could not be re-serialised as YAML.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl YamlConfigWriter {
    /// Writes `value` (skipping `Null`) to `<mount_root>/boot/<name>.yaml`.
    pub fn write_named(
        &self,
        mount_root: &Path,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), Error> {
        if value.is_null() {
            return Ok(());
        }
        let dir = mount_root.join("boot");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{name}.yaml"));
        let yaml = serde_yaml::to_string(value)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_blob_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let writer = YamlConfigWriter;
        writer
            .write_named(dir.path(), "offspot", &serde_json::Value::Null)
            .unwrap();
        assert!(!dir.path().join("boot").exists());
    }

    #[test]
    fn writes_yaml_file_for_non_null_blob() {
        let dir = tempfile::tempdir().unwrap();
        let writer = YamlConfigWriter;
        let value = serde_json::json!({"hostname": "hotspot"});
        writer.write_named(dir.path(), "offspot", &value).unwrap();
        let content = std::fs::read_to_string(dir.path().join("boot/offspot.yaml")).unwrap();
        assert!(content.contains("hostname"));
    }
}
