//! Eviction engine (§4.C Eviction).
//!
//! Candidate selection runs in three passes: hard caps (`max_age`,
//! `max_num`) evict unconditionally; a policy-ordered sweep then evicts
//! until the requested space fits; `keep_identified_versions` runs
//! independently of both and ignores class-level caps entirely.

use super::entry::CacheEntry;
use crate::policy::{EffectivePolicy, Eviction};

/// Natural-sort comparison of two version strings: numeric runs compare
/// as integers, everything else compares as text.
fn natural_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();
    loop {
        match (ai.peek(), bi.peek()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let na: String = std::iter::from_fn(|| ai.next_if(char::is_ascii_digit)).collect();
                let nb: String = std::iter::from_fn(|| bi.next_if(char::is_ascii_digit)).collect();
                let va: u64 = na.parse().unwrap_or(0);
                let vb: u64 = nb.parse().unwrap_or(0);
                match va.cmp(&vb) {
                    std::cmp::Ordering::Equal => continue,
                    ord => return ord,
                }
            }
            (Some(x), Some(y)) => match x.cmp(y) {
                std::cmp::Ordering::Equal => {
                    ai.next();
                    bi.next();
                }
                ord => return ord,
            },
        }
    }
}

/// Keys to evict before admission pressure is even considered: entries past
/// `max_age`, then (if still over `max_num`) the oldest `added_on` first.
#[must_use]
pub fn hard_cap_victims(candidates: &[CacheEntry], policy: &EffectivePolicy) -> Vec<String> {
    let mut victims = Vec::new();
    let now = chrono::Utc::now();

    if let Some(max_age) = policy.max_age {
        for c in candidates {
            let age = (now - c.added_on).num_seconds();
            if age > max_age {
                victims.push(c.key.clone());
            }
        }
    }

    if let Some(max_num) = policy.max_num {
        let remaining: Vec<&CacheEntry> = candidates
            .iter()
            .filter(|c| !victims.contains(&c.key))
            .collect();
        if (remaining.len() as u64) > max_num {
            let mut sorted = remaining;
            sorted.sort_by_key(|c| c.added_on);
            let overflow = sorted.len() - max_num as usize;
            victims.extend(sorted.into_iter().take(overflow).map(|c| c.key.clone()));
        }
    }

    victims
}

/// Sorts candidates by the policy's eviction strategy, most-evictable first.
pub fn order_by_strategy(candidates: &mut [&CacheEntry], strategy: Eviction) {
    match strategy {
        Eviction::Oldest => candidates.sort_by_key(|c| c.added_on),
        Eviction::Newest => candidates.sort_by_key(|c| std::cmp::Reverse(c.added_on)),
        Eviction::Largest => candidates.sort_by_key(|c| std::cmp::Reverse(c.size)),
        Eviction::Smallest => candidates.sort_by_key(|c| c.size),
        Eviction::Lru => candidates.sort_by_key(|c| c.last_used),
    }
}

/// Selects additional victims (beyond `already_evicted`) from `candidates`
/// until `needed_free` bytes would be available, given `total_size` already
/// occupied by the class. Returns `None` if the pool is exhausted first
/// (the caller should report `Rejected(NoRoom)`).
#[must_use]
pub fn capacity_victims(
    candidates: &[CacheEntry],
    already_evicted: &[String],
    policy: &EffectivePolicy,
    total_size: u64,
    needed_free: u64,
) -> Option<Vec<String>> {
    let Some(max_size) = policy.max_size else {
        return Some(Vec::new());
    };

    let mut occupied = total_size;
    let mut pool: Vec<&CacheEntry> = candidates
        .iter()
        .filter(|c| !already_evicted.contains(&c.key))
        .collect();
    order_by_strategy(&mut pool, policy.eviction);

    let mut victims = Vec::new();
    for c in pool {
        if occupied + needed_free <= max_size {
            break;
        }
        victims.push(c.key.clone());
        occupied = occupied.saturating_sub(c.size);
    }

    if occupied + needed_free <= max_size {
        Some(victims)
    } else {
        None
    }
}

/// `keep_identified_versions`: entries sharing `identifier` and the same
/// host as `source`, with a strictly lower natural-sort `version`, are
/// evicted unconditionally, regardless of class-level caps.
#[must_use]
pub fn identified_version_victims(
    candidates: &[CacheEntry],
    identifier: &str,
    source_host: &str,
    version: &str,
) -> Vec<String> {
    candidates
        .iter()
        .filter(|c| {
            c.identifier.as_deref() == Some(identifier)
                && host_of(&c.source) == source_host
                && c.version
                    .as_deref()
                    .is_some_and(|v| natural_cmp(v, version) == std::cmp::Ordering::Less)
        })
        .map(|c| c.key.clone())
        .collect()
}

fn host_of(source: &str) -> String {
    url::Url::parse(source)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Class;

    fn entry(key: &str, size: u64, age_days: i64) -> CacheEntry {
        let now = chrono::Utc::now();
        CacheEntry {
            key: key.to_owned(),
            class: Class::Files,
            source: "https://example.com/x".to_owned(),
            identifier: None,
            version: None,
            size,
            checksum: None,
            added_on: now - chrono::Duration::days(age_days),
            last_used: now - chrono::Duration::days(age_days),
            checked_on: now,
        }
    }

    #[test]
    fn natural_sort_compares_numeric_runs() {
        assert_eq!(natural_cmp("2", "10"), std::cmp::Ordering::Less);
        assert_eq!(natural_cmp("v2", "v10"), std::cmp::Ordering::Less);
        assert_eq!(natural_cmp("1.9", "1.10"), std::cmp::Ordering::Less);
    }

    #[test]
    fn hard_cap_evicts_entries_past_max_age() {
        let candidates = vec![entry("old", 10, 40), entry("new", 10, 1)];
        let policy = EffectivePolicy {
            enabled: true,
            max_size: None,
            max_age: Some(30 * 86400),
            max_num: None,
            eviction: Eviction::Lru,
            keep_identified_versions: false,
            ignored_by_filter: false,
        };
        let victims = hard_cap_victims(&candidates, &policy);
        assert_eq!(victims, vec!["old".to_owned()]);
    }

    #[test]
    fn capacity_victims_evicts_until_fit() {
        let candidates = vec![entry("a", 100, 5), entry("b", 100, 1)];
        let policy = EffectivePolicy {
            enabled: true,
            max_size: Some(150),
            max_age: None,
            max_num: None,
            eviction: Eviction::Oldest,
            keep_identified_versions: false,
            ignored_by_filter: false,
        };
        let victims = capacity_victims(&candidates, &[], &policy, 200, 0).unwrap();
        assert_eq!(victims, vec!["a".to_owned()]);
    }

    #[test]
    fn identified_version_victims_ignore_caps() {
        let mut older = entry("v1", 10, 10);
        older.identifier = Some("zimfarm/wikipedia".to_owned());
        older.version = Some("2.1".to_owned());
        older.source = "https://example.com/wikipedia_2.1.zim".to_owned();
        let victims = identified_version_victims(
            &[older],
            "zimfarm/wikipedia",
            "example.com",
            "2.10",
        );
        assert_eq!(victims, vec!["v1".to_owned()]);
    }
}
