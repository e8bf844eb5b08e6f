//! Typed recipe record consumed by the core (component data model, §3).
//!
//! Deserializing and fully schema-validating the recipe YAML (unknown-key
//! diagnostics, line/column reporting) is an external concern; this module
//! only defines the shapes the core operates on and the invariants whose
//! violation would corrupt a build.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// How a downloaded `file` entry should be unpacked once fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Via {
    /// Write the payload as-is.
    Direct,
    /// Extract as an uncompressed tarball.
    Tar,
    /// Extract as a gzip-compressed tarball.
    Gztar,
    /// Extract as a bzip2-compressed tarball.
    Bztar,
    /// Extract as an xz-compressed tarball.
    Xztar,
    /// Extract as a zip archive.
    Zip,
}

/// A checksum constraint on a downloaded artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checksum {
    /// Digest algorithm name (e.g. `"sha256"`).
    pub algo: String,
    /// Lowercase hex digest.
    pub hex: String,
}

/// The base image to start from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Base {
    /// A version string (resolved externally to a URL) or a direct URL.
    pub source: String,
    /// Size in bytes the root partition should occupy once expanded.
    pub root_size: u64,
}

/// Where and how large the produced image should be.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    /// Destination path for the final image.
    pub path: std::path::PathBuf,
    /// Target size in bytes, or `None` for `auto` (sized to the base image).
    pub size: Option<u64>,
    /// Whether to shrink-to-fit after population.
    #[serde(default)]
    pub shrink: bool,
}

/// One OCI image to bundle into the image's Docker storage area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciImage {
    /// Logical identifier used for `keep_identified_versions` matching.
    pub ident: String,
    /// URL of the exported OCI tarball, if not resolved by identifier alone.
    #[serde(default)]
    pub url: Option<String>,
    /// Compressed (on-the-wire) size in bytes.
    pub filesize: u64,
    /// Uncompressed size in bytes once extracted.
    pub fullsize: u64,
}

/// Content payload for a `files[]` entry: either a URL or inline content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    /// Destination path; must be a descendant of `/data`.
    pub to: std::path::PathBuf,
    /// Source URL (mutually exclusive with `content`).
    #[serde(default)]
    pub url: Option<String>,
    /// Inline content, plain text or `base64:`-tagged (mutually exclusive with `url`).
    #[serde(default)]
    pub content: Option<String>,
    /// How to unpack the fetched payload.
    #[serde(default = "default_via")]
    pub via: Via,
    /// Declared size in bytes; for archive `via`, this is the expanded size.
    #[serde(default)]
    pub size: Option<u64>,
    /// Expected checksum of the downloaded payload, if known.
    #[serde(default)]
    pub checksum: Option<Checksum>,
}

const fn default_via() -> Via {
    Via::Direct
}

/// The full typed recipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    /// Base image selection.
    pub base: Base,
    /// Output image parameters.
    pub output: Output,
    /// OCI images to bundle, in order.
    #[serde(default)]
    pub oci_images: Vec<OciImage>,
    /// Files to place on the data partition, in order.
    #[serde(default)]
    pub files: Vec<FileEntry>,
    /// Opaque blob forwarded to the config writer.
    #[serde(default)]
    pub offspot: serde_json::Value,
    /// Opaque blob forwarded to the config writer.
    #[serde(default)]
    pub write_config: serde_json::Value,
}

/// Errors raised by [`Recipe::validate`].
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ValidationError {
    /// `base.source` was empty.
    #[error("base.source must not be empty")]
    EmptyBaseSource,
    /// A file entry specified both or neither of `url`/`content`.
    #[error("files[{0}] ({1}): exactly one of url/content must be set")]
    AmbiguousFileSource(usize, std::path::PathBuf),
    /// A file's `to` path escapes `/data`.
    #[error("files[{0}] ({1}): `to` must be a descendant of /data")]
    PathEscapesData(usize, std::path::PathBuf),
    /// An archive file declared a size smaller than required.
    #[error("files[{0}] ({1}): archive `via` requires a declared `size`")]
    MissingArchiveSize(usize, std::path::PathBuf),
    /// The sum of declared content sizes exceeds the data partition.
    #[error("declared content totals {total} bytes, exceeding data partition capacity {capacity} bytes")]
    CapacityExceeded {
        /// Sum of all declared (expanded) sizes.
        total: u64,
        /// Capacity of the final data partition.
        capacity: u64,
    },
}

impl Recipe {
    /// Checks the invariants from §3 that gate correctness of the core's own
    /// operations. Full schema validation (unknown keys, required-key
    /// enforcement against the YAML grammar) is the CLI/YAML layer's job.
    pub fn validate(&self, data_capacity: u64) -> Result<(), ValidationError> {
        if self.base.source.trim().is_empty() {
            return Err(ValidationError::EmptyBaseSource);
        }

        let mut total: u64 = 0;
        for (i, f) in self.files.iter().enumerate() {
            if f.url.is_some() == f.content.is_some() {
                return Err(ValidationError::AmbiguousFileSource(i, f.to.clone()));
            }
            if !is_descendant_of_data(&f.to) {
                return Err(ValidationError::PathEscapesData(i, f.to.clone()));
            }
            if f.via != Via::Direct && f.size.is_none() {
                return Err(ValidationError::MissingArchiveSize(i, f.to.clone()));
            }
            total += f.size.unwrap_or(0);
        }
        for oci in &self.oci_images {
            total += oci.fullsize;
        }

        if total > data_capacity {
            return Err(ValidationError::CapacityExceeded {
                total,
                capacity: data_capacity,
            });
        }

        Ok(())
    }
}

fn is_descendant_of_data(path: &Path) -> bool {
    let mut components = path.components();
    matches!(components.next(), Some(std::path::Component::RootDir))
        && matches!(
            components.next(),
            Some(std::path::Component::Normal(name)) if name == "data"
        )
        && !path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_recipe() -> Recipe {
        Recipe {
            base: Base {
                source: "2024.1".into(),
                root_size: 1_000_000,
            },
            output: Output {
                path: "/tmp/out.img".into(),
                size: None,
                shrink: false,
            },
            oci_images: vec![],
            files: vec![],
            offspot: serde_json::Value::Null,
            write_config: serde_json::Value::Null,
        }
    }

    #[test]
    fn empty_base_source_rejected() {
        let mut r = base_recipe();
        r.base.source = String::new();
        assert!(matches!(
            r.validate(u64::MAX),
            Err(ValidationError::EmptyBaseSource)
        ));
    }

    #[test]
    fn path_must_descend_from_data() {
        let mut r = base_recipe();
        r.files.push(FileEntry {
            to: "/etc/passwd".into(),
            url: Some("http://x/y".into()),
            content: None,
            via: Via::Direct,
            size: None,
            checksum: None,
        });
        assert!(matches!(
            r.validate(u64::MAX),
            Err(ValidationError::PathEscapesData(0, _))
        ));
    }

    #[test]
    fn capacity_enforced() {
        let mut r = base_recipe();
        r.files.push(FileEntry {
            to: "/data/big.bin".into(),
            url: Some("http://x/y".into()),
            content: None,
            via: Via::Direct,
            size: Some(1000),
            checksum: None,
        });
        assert!(r.validate(500).is_err());
        assert!(r.validate(1000).is_ok());
    }

    #[test]
    fn exactly_one_of_url_or_content() {
        let mut r = base_recipe();
        r.files.push(FileEntry {
            to: "/data/x.txt".into(),
            url: Some("http://x/y".into()),
            content: Some("hi".into()),
            via: Via::Direct,
            size: None,
            checksum: None,
        });
        assert!(matches!(
            r.validate(u64::MAX),
            Err(ValidationError::AmbiguousFileSource(0, _))
        ));
    }
}
