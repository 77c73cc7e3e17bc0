/// Key layout for a single named queue, as described in SPEC_FULL.md §3.
///
/// Everything here is a plain owned `String` computed once at construction
/// time so that hot-path script invocations never format a key.
#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    prefix: String,
    pub waiting: String,
    pub delayed: String,
    pub active: String,
    pub notify: String,
    pub stats: String,
    pub job_prefix: String,
    pub rate_limit_bucket: String,
    pub rate_limit_window: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue_name: &str) -> Self {
        QueueKeys {
            prefix: prefix.to_string(),
            waiting: format!("{}:queue:{}:waiting", prefix, queue_name),
            delayed: format!("{}:queue:{}:delayed", prefix, queue_name),
            active: format!("{}:queue:{}:active", prefix, queue_name),
            notify: format!("{}:queue:{}:notify", prefix, queue_name),
            stats: format!("{}:queue:{}:stats", prefix, queue_name),
            job_prefix: format!("{}:jobs:", prefix),
            rate_limit_bucket: format!("{}:ratelimit:{}", prefix, queue_name),
            rate_limit_window: format!("{}:ratelimit:{}:sliding", prefix, queue_name),
        }
    }

    pub fn job_key(&self, id: &str) -> String {
        format!("{}{}", self.job_prefix, id)
    }

    pub fn delay_timer_key(&self, id: &str) -> String {
        format!("{}:delayed:timer:{}", self.prefix, id)
    }
}
