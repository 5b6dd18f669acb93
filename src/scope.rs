use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SCOPE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Topic and client-id namespace owned by one scenario run.
#[derive(Clone, Debug)]
pub struct ScenarioScope {
    pub run_id: String,
    pub topic_prefix: String,
    pub client_prefix: String,
}

impl ScenarioScope {
    pub fn new(namespace: &str, endpoint: &str) -> Self {
        let run_id = unique_suffix();
        let namespace = namespace.trim_end_matches('/');
        Self {
            topic_prefix: format!("{namespace}/{run_id}"),
            client_prefix: endpoint.to_string(),
            run_id,
        }
    }

    /// The scenario's own topic, e.g. `cp7/test/qos1/<suffix>`.
    pub fn topic(&self) -> String {
        self.topic_prefix.clone()
    }

    pub fn topic_at(&self, leaf: &str) -> String {
        format!("{}/{}", self.topic_prefix, leaf.trim_start_matches('/'))
    }

    /// Same construction as [`topic_at`](Self::topic_at); kept separate so
    /// call sites read as filters.
    pub fn filter_at(&self, pattern: &str) -> String {
        self.topic_at(pattern)
    }

    pub fn client_id(&self, role: &str) -> String {
        format!("{}_{}_{}", self.client_prefix, role, self.run_id)
    }

    /// `$share/<group>_<suffix>/<topic>`; the group is scoped too so share
    /// groups of concurrent scenarios never merge.
    pub fn share_filter(&self, group: &str, topic: &str) -> String {
        format!("$share/{}_{}/{}", group, self.run_id, topic)
    }
}

pub fn unique_suffix() -> String {
    let random = uuid::Uuid::new_v4();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let seq = SCOPE_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut suffix = String::with_capacity(32);
    for byte in &random.as_bytes()[..4] {
        suffix.push_str(&format!("{byte:02x}"));
    }
    suffix.push_str(&base36(nanos));
    suffix.push_str(&base36(seq as u128));
    suffix
}

fn base36(mut n: u128) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    #[test]
    fn test_base36() {
        assert_eq!(base36(0), "0");
        assert_eq!(base36(35), "z");
        assert_eq!(base36(36), "10");
    }

    #[test]
    fn test_scope_derivations() {
        let scope = ScenarioScope::new("cp7/test/qos1/", "tcp");
        assert_eq!(scope.topic(), format!("cp7/test/qos1/{}", scope.run_id));
        assert_eq!(scope.topic_at("a/b"), format!("cp7/test/qos1/{}/a/b", scope.run_id));
        assert_eq!(scope.client_id("sub"), format!("tcp_sub_{}", scope.run_id));
        assert_eq!(
            scope.share_filter("g", &scope.topic()),
            format!("$share/g_{}/{}", scope.run_id, scope.topic())
        );
    }

    #[test]
    fn test_suffix_is_topic_safe() {
        let suffix = unique_suffix();
        assert!(suffix.len() >= 10);
        assert!(suffix.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_parallel_scopes_are_disjoint() {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                std::thread::spawn(|| {
                    (0..500)
                        .map(|_| ScenarioScope::new("ns", "tcp").topic())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for topic in handle.join().unwrap() {
                assert!(seen.insert(topic), "duplicate scope");
            }
        }
        assert_eq!(seen.len(), 4000);
    }
}
