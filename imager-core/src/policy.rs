//! Cache policy model: a three-level tree (global, class, filter) with
//! first-match-wins filter resolution (component B, §4.B).
//!
//! The `max_size`/`max_age` raw fields are plain strings in `policy.yaml`
//! (`"10GiB"`, `"30d"`) and parsed through [`crate::units`] at resolution
//! time, not at deserialization time — this keeps `serde_yaml` decoupled
//! from our size/duration grammar.

use serde::Deserialize;

use crate::units;

/// Which top-level class a cache entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Class {
    /// Exported OCI image tarballs.
    OciImages,
    /// Plain downloaded files.
    Files,
}

impl Class {
    /// The directory-safe name used in cache paths and log output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OciImages => "oci_images",
            Self::Files => "files",
        }
    }
}

/// Eviction ordering strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Eviction {
    /// Evict entries with the oldest `added_on` first.
    Oldest,
    /// Evict entries with the newest `added_on` first.
    Newest,
    /// Evict the largest entries first.
    Largest,
    /// Evict the smallest entries first.
    Smallest,
    /// Evict the least-recently-used entries first.
    #[default]
    Lru,
}

/// Raw per-level options as they appear in `policy.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawLevel {
    /// Whether caching is enabled at this level.
    pub enabled: Option<bool>,
    /// Maximum total size, as a size string (`"10GiB"`); `"0"` disables.
    pub max_size: Option<String>,
    /// Maximum age, as a duration string (`"30d"`).
    pub max_age: Option<String>,
    /// Maximum entry count; `0` disables.
    pub max_num: Option<u64>,
    /// Eviction strategy.
    pub eviction: Option<Eviction>,
    /// Evict lower-`version` entries sharing an `identifier` unconditionally.
    pub keep_identified_versions: Option<bool>,
}

/// A single filter entry within a class.
#[derive(Debug, Clone, Deserialize)]
pub struct RawFilter {
    /// Regular expression matched against the entry's `source`.
    pub pattern: String,
    /// Whether a match means "never cache" regardless of other options.
    #[serde(default)]
    pub ignore: bool,
    /// Per-filter option overrides.
    #[serde(flatten)]
    pub options: RawLevel,
}

/// Raw class-level policy (`oci_images` or `files`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawClass {
    /// Class-level option overrides.
    #[serde(flatten)]
    pub options: RawLevel,
    /// Ordered filters, first match wins.
    #[serde(default)]
    pub filters: Vec<RawFilter>,
}

/// The full, raw `policy.yaml` document.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicyFile {
    /// Global-level option overrides.
    #[serde(flatten)]
    pub global: RawLevel,
    /// OCI image class policy.
    #[serde(default)]
    pub oci_images: RawClass,
    /// Plain file class policy.
    #[serde(default)]
    pub files: RawClass,
}

impl Default for PolicyFile {
    fn default() -> Self {
        Self {
            global: RawLevel {
                enabled: Some(true),
                max_size: Some("10GiB".to_owned()),
                eviction: Some(Eviction::Lru),
                ..RawLevel::default()
            },
            oci_images: RawClass {
                options: RawLevel {
                    enabled: Some(true),
                    eviction: Some(Eviction::Lru),
                    ..RawLevel::default()
                },
                filters: vec![],
            },
            files: RawClass {
                options: RawLevel {
                    enabled: Some(true),
                    eviction: Some(Eviction::Lru),
                    ..RawLevel::default()
                },
                filters: vec![],
            },
        }
    }
}

/// A fully resolved policy for one entry (§4.B Resolution).
#[derive(Debug, Clone)]
pub struct EffectivePolicy {
    /// Conjunction of `enabled` across global/class/filter levels.
    pub enabled: bool,
    /// Max total size in bytes; `Some(0)` means "disabled entirely".
    pub max_size: Option<u64>,
    /// Max age in seconds.
    pub max_age: Option<i64>,
    /// Max entry count; `Some(0)` means "disabled entirely".
    pub max_num: Option<u64>,
    /// Eviction strategy.
    pub eviction: Eviction,
    /// Evict lower-version same-identifier entries unconditionally.
    pub keep_identified_versions: bool,
    /// Whether the matching filter (if any) marked this source as `ignore`.
    pub ignored_by_filter: bool,
}

impl EffectivePolicy {
    /// `true` if caching is disabled for this entry at any level, including
    /// via an explicit `max_size: 0`.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        !self.enabled || self.ignored_by_filter || self.max_size == Some(0)
    }
}

/// Errors raised while resolving or parsing the policy tree.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A `max_size`/`max_age` string failed to parse.
    #[error("invalid policy value: {0}")]
    InvalidValue(#[from] units::Error),
    /// A filter's `pattern` was not a valid regular expression.
    #[error("invalid filter pattern {0:?}: {1}")]
    InvalidPattern(String, regex::Error),
}

impl PolicyFile {
    /// Resolves the effective policy for an entry of `class` whose `source`
    /// is matched against the class's filters in order (first match wins).
    pub fn resolve(&self, class: Class, source: &str) -> Result<EffectivePolicy, Error> {
        let class_raw = match class {
            Class::OciImages => &self.oci_images,
            Class::Files => &self.files,
        };

        let mut matched_filter: Option<&RawFilter> = None;
        for filter in &class_raw.filters {
            let re = regex::Regex::new(&filter.pattern)
                .map_err(|e| Error::InvalidPattern(filter.pattern.clone(), e))?;
            if re.is_match(source) {
                matched_filter = Some(filter);
                break;
            }
        }

        let levels: [&RawLevel; 3] = [
            &self.global,
            &class_raw.options,
            matched_filter.map_or(&EMPTY_LEVEL, |f| &f.options),
        ];

        let enabled = levels.iter().all(|l| l.enabled.unwrap_or(true));

        let max_size = first_some(levels.iter().rev().map(|l| l.max_size.as_deref()))
            .map(units::parse_size)
            .transpose()?
            .flatten();
        let max_age = first_some(levels.iter().rev().map(|l| l.max_age.as_deref()))
            .map(units::parse_duration)
            .transpose()?
            .flatten();
        let max_num = levels.iter().rev().find_map(|l| l.max_num);
        let eviction = levels
            .iter()
            .rev()
            .find_map(|l| l.eviction)
            .unwrap_or_default();
        let keep_identified_versions = levels
            .iter()
            .rev()
            .find_map(|l| l.keep_identified_versions)
            .unwrap_or(false);

        Ok(EffectivePolicy {
            enabled,
            max_size,
            max_age,
            max_num,
            eviction,
            keep_identified_versions,
            ignored_by_filter: matched_filter.is_some_and(|f| f.ignore),
        })
    }
}

static EMPTY_LEVEL: RawLevel = RawLevel {
    enabled: None,
    max_size: None,
    max_age: None,
    max_num: None,
    eviction: None,
    keep_identified_versions: None,
};

/// Returns the first `Some` string in (filter, class, global) order, i.e.
/// the most specific level that actually specified a value. `levels` here
/// is iterated in reverse (global, class, filter) so `.rev()` at call sites
/// walks filter-first.
fn first_some<'a>(mut it: impl Iterator<Item = Option<&'a str>>) -> Option<&'a str> {
    it.find_map(|v| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_documented_defaults() {
        let p = PolicyFile::default();
        let eff = p.resolve(Class::Files, "https://example.com/x.zip").unwrap();
        assert!(eff.enabled);
        assert_eq!(eff.max_size, Some(10 * 1024u64.pow(3)));
        assert_eq!(eff.eviction, Eviction::Lru);
    }

    #[test]
    fn max_size_zero_disables_class() {
        let mut p = PolicyFile::default();
        p.files.options.max_size = Some("0".to_owned());
        let eff = p.resolve(Class::Files, "https://example.com/x.zip").unwrap();
        assert!(eff.is_disabled());
    }

    #[test]
    fn first_match_wins() {
        let mut p = PolicyFile::default();
        p.files.filters.push(RawFilter {
            pattern: "zim$".to_owned(),
            ignore: false,
            options: RawLevel {
                max_age: Some("7d".to_owned()),
                ..RawLevel::default()
            },
        });
        p.files.filters.push(RawFilter {
            pattern: ".*".to_owned(),
            ignore: false,
            options: RawLevel {
                max_age: Some("1d".to_owned()),
                ..RawLevel::default()
            },
        });
        let eff = p.resolve(Class::Files, "http://x/archive.zim").unwrap();
        assert_eq!(eff.max_age, Some(7 * 86400));
    }

    #[test]
    fn disabled_global_propagates() {
        let mut p = PolicyFile::default();
        p.global.enabled = Some(false);
        let eff = p.resolve(Class::OciImages, "any").unwrap();
        assert!(eff.is_disabled());
    }

    #[test]
    fn ignore_filter_disables_without_touching_max_size() {
        let mut p = PolicyFile::default();
        p.files.filters.push(RawFilter {
            pattern: "\\.tmp$".to_owned(),
            ignore: true,
            options: RawLevel::default(),
        });
        let eff = p.resolve(Class::Files, "http://x/y.tmp").unwrap();
        assert!(eff.is_disabled());
        assert_ne!(eff.max_size, Some(0));
    }
}
