//! Cache key canonicalisation and blob path sharding (§4.C Key).

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

/// Canonicalises a source (URL or OCI reference) into a stable cache key.
///
/// For URLs this lowercases scheme and host, drops a default port, and
/// leaves path/query untouched (query strings are part of the resource
/// identity). An OCI reference is normalised by trimming whitespace only —
/// the registry is expected to hand us an already-resolved tag or digest.
#[must_use]
pub fn canonicalize(source: &str) -> String {
    match url::Url::parse(source) {
        Ok(u) => {
            let scheme = u.scheme().to_ascii_lowercase();
            let host = u.host_str().unwrap_or_default().to_ascii_lowercase();
            let port = u.port().map_or(String::new(), |p| format!(":{p}"));
            let path = u.path();
            let query = u.query().map_or(String::new(), |q| format!("?{q}"));
            format!("{scheme}://{host}{port}{path}{query}")
        }
        Err(_) => source.trim().to_owned(),
    }
}

/// Derives the fixed-length digest used as the on-disk key from a
/// canonicalised source string.
#[must_use]
pub fn digest(canonical: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// The sharded blob path for `key` under `cache_root`: `blobs/<aa>/<bb>/<key>`.
#[must_use]
pub fn blob_path(cache_root: &Path, key: &str) -> PathBuf {
    let aa = &key[0..2.min(key.len())];
    let bb = &key[2..4.min(key.len())];
    cache_root.join("blobs").join(aa).join(bb).join(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_lowercases_scheme_and_host() {
        let a = canonicalize("HTTP://Example.com/path?x=1");
        let b = canonicalize("http://example.com/path?x=1");
        assert_eq!(a, b);
    }

    #[test]
    fn digest_is_stable() {
        let k = canonicalize("https://example.com/a.zim");
        assert_eq!(digest(&k), digest(&k));
        assert_eq!(digest(&k).len(), 64);
    }

    #[test]
    fn blob_path_shards_by_prefix() {
        let root = Path::new("/cache");
        let p = blob_path(root, "abcdef0123");
        assert_eq!(p, root.join("blobs/ab/cd/abcdef0123"));
    }
}
