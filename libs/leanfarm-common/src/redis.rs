/// Redis queue layout - defines only key names, not runtime logic
/// Keeps the worker, the CLI and the Lua scripts agreeing on one layout
///
/// **Keys** (`{ns}` defaults to `leanfarm`):
/// - `{ns}:job:{id}` job record as JSON
/// - `{ns}:lease:{id}` token of the current lease
/// - `{ns}:queue:pending` ZSET scored by ready-at (ms)
/// - `{ns}:queue:leased` ZSET scored by lease expiry (ms)
/// - `{ns}:queue:dead` ZSET scored by dead-letter time (ms)

pub const DEFAULT_NAMESPACE: &str = "leanfarm";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub job_prefix: String,
    pub lease_prefix: String,
    pub pending: String,
    pub leased: String,
    pub dead_letter: String,
}

impl QueueKeys {
    pub fn new(namespace: &str) -> Self {
        Self {
            job_prefix: format!("{}:job", namespace),
            lease_prefix: format!("{}:lease", namespace),
            pending: format!("{}:queue:pending", namespace),
            leased: format!("{}:queue:leased", namespace),
            dead_letter: format!("{}:queue:dead", namespace),
        }
    }

    /// Generate record key for a job
    pub fn job(&self, job_id: &uuid::Uuid) -> String {
        format!("{}:{}", self.job_prefix, job_id)
    }

    /// Generate lease key for a job
    pub fn lease(&self, job_id: &uuid::Uuid) -> String {
        format!("{}:{}", self.lease_prefix, job_id)
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_job_key_deterministic() {
        let keys = QueueKeys::default();
        let id = Uuid::new_v4();
        assert_eq!(keys.job(&id), keys.job(&id));
        assert!(keys.job(&id).starts_with("leanfarm:job:"));
    }

    #[test]
    fn test_lease_key_format() {
        let id = Uuid::new_v4();
        let key = QueueKeys::default().lease(&id);
        assert!(key.starts_with("leanfarm:lease:"));
        assert!(key.contains(&id.to_string()));
    }

    #[test]
    fn test_queue_keys_distinct() {
        let keys = QueueKeys::default();
        assert_ne!(keys.pending, keys.leased);
        assert_ne!(keys.leased, keys.dead_letter);
    }

    #[test]
    fn test_namespace_isolates_every_key() {
        let keys = QueueKeys::new("farm-b");
        let id = Uuid::new_v4();
        for key in [keys.job(&id), keys.lease(&id), keys.pending, keys.leased, keys.dead_letter] {
            assert!(key.starts_with("farm-b:"), "{}", key);
        }
    }
}
