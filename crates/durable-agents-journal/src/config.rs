//! Runner configuration.

use std::{fmt, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Default journal file name.
pub const DEFAULT_EVENT_LOG: &str = "agent_runner.log";

const ENV_ENDPOINT: &str = "DURABLE_AGENTS_ENDPOINT";
const ENV_API_KEY: &str = "DURABLE_AGENTS_API_KEY";
const ENV_EVENT_LOG: &str = "DURABLE_AGENTS_EVENT_LOG";
const ENV_RESUME: &str = "DURABLE_AGENTS_RESUME";
const ENV_WAIT: &str = "DURABLE_AGENTS_WAIT";

/// Configuration for a [`Runner`](crate::Runner).
#[derive(Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Websocket endpoint of the execution backend.
    pub endpoint: String,

    /// Opaque credential passed at connect time.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,

    /// Journal file.
    pub event_log: PathBuf,

    /// Replay the journal instead of starting fresh.
    pub resume: bool,

    /// Wait for the backend to confirm each finished turn.
    pub wait_for_durability: bool,

    /// Upper bound for restoring one stream on resume.
    #[serde(with = "opt_secs")]
    pub read_timeout: Option<Duration>,
}

impl fmt::Debug for RunnerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConfig")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("event_log", &self.event_log)
            .field("resume", &self.resume)
            .field("wait_for_durability", &self.wait_for_durability)
            .field("read_timeout", &self.read_timeout)
            .finish()
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            event_log: PathBuf::from(DEFAULT_EVENT_LOG),
            resume: false,
            wait_for_durability: false,
            read_timeout: None,
        }
    }
}

impl RunnerConfig {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Self::default()
        }
    }

    /// Load from `DURABLE_AGENTS_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(endpoint) = lookup(ENV_ENDPOINT) {
            config.endpoint = endpoint;
        }
        config.api_key = lookup(ENV_API_KEY).filter(|k| !k.is_empty());
        if let Some(path) = lookup(ENV_EVENT_LOG).filter(|p| !p.is_empty()) {
            config.event_log = PathBuf::from(path);
        }
        if let Some(resume) = lookup(ENV_RESUME) {
            config.resume = parse_flag(&resume);
        }
        if let Some(wait) = lookup(ENV_WAIT) {
            config.wait_for_durability = parse_flag(&wait);
        }
        config
    }

    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_log = path.into();
        self
    }

    #[must_use]
    pub const fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    #[must_use]
    pub const fn with_wait_for_durability(mut self, wait: bool) -> Self {
        self.wait_for_durability = wait;
        self
    }

    #[must_use]
    pub const fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

mod opt_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(d)?;
        secs.map(|s| Duration::try_from_secs_f64(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::from_lookup(lookup(&[]));
        assert_eq!(config.event_log, PathBuf::from("agent_runner.log"));
        assert!(!config.resume);
        assert!(!config.wait_for_durability);
        assert!(config.api_key.is_none());
        assert!(config.endpoint.is_empty());
    }

    #[test]
    fn test_env_overrides() {
        let config = RunnerConfig::from_lookup(lookup(&[
            ("DURABLE_AGENTS_ENDPOINT", "wss://backend.example/ws"),
            ("DURABLE_AGENTS_API_KEY", "secret"),
            ("DURABLE_AGENTS_EVENT_LOG", "/tmp/journal.log"),
            ("DURABLE_AGENTS_RESUME", "true"),
            ("DURABLE_AGENTS_WAIT", "1"),
        ]));
        assert_eq!(config.endpoint, "wss://backend.example/ws");
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(config.event_log, PathBuf::from("/tmp/journal.log"));
        assert!(config.resume);
        assert!(config.wait_for_durability);
        assert!(!format!("{config:?}").contains("secret"));

        let off = RunnerConfig::from_lookup(lookup(&[("DURABLE_AGENTS_RESUME", "no")]));
        assert!(!off.resume);
    }

    #[test]
    fn test_serde_round_trip_skips_key() {
        let config = RunnerConfig::new("ws://localhost:8080/ws")
            .with_api_key("secret")
            .with_read_timeout(Duration::from_secs(5));
        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("apiKey").is_none());
        assert_eq!(json["readTimeout"], 5.0);

        let back: RunnerConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.endpoint, "ws://localhost:8080/ws");
        assert_eq!(back.read_timeout, Some(Duration::from_secs(5)));
        assert!(back.api_key.is_none());
    }
}
