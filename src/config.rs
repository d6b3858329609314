use std::time::Duration;

pub const DEFAULT_BASE_TOPIC: &str = "homie";
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Settings shared by every entity of a mirrored device tree.
#[derive(Debug, Clone)]
pub struct TreeConfig {
    pub base_topic: String,
    /// How long attribute discovery waits for the mandatory attributes of one entity.
    pub discovery_timeout: Duration,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_TOPIC)
    }
}

impl TreeConfig {
    pub fn new(base_topic: impl Into<String>) -> Self {
        Self {
            base_topic: base_topic.into(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }

    pub fn base_topic(mut self, base_topic: impl Into<String>) -> Self {
        self.base_topic = base_topic.into();
        self
    }

    pub fn discovery_timeout(mut self, discovery_timeout: Duration) -> Self {
        self.discovery_timeout = discovery_timeout;
        self
    }
}
