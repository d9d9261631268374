//! Configuration for the query cache
//!
//! Applied once when the API is built; every toggle here is process-wide.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::error::{QueryCacheError, Result};

/// Prefix of the environment variables read by [`ApiConfig::from_env`]
pub const ENV_PREFIX: &str = "QUERY_CACHE_";

/// When a subscriber arriving at an existing entry should trigger a refetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalenessPolicy {
    /// Reuse whatever is cached
    #[default]
    Never,
    /// Refetch on every subscribe
    Always,
    /// Refetch when the last fulfillment is older than the given age
    OlderThan(Duration),
}

impl StalenessPolicy {
    /// Decide whether data fulfilled `age` ago must be refetched
    pub fn is_stale(&self, age: Duration) -> bool {
        match self {
            StalenessPolicy::Never => false,
            StalenessPolicy::Always => true,
            StalenessPolicy::OlderThan(max_age) => age >= *max_age,
        }
    }
}

/// Configuration for the query cache API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Name of the cache slice inside a host state tree
    pub reducer_path: String,

    /// How long an entry without subscribers survives before eviction
    pub keep_unused_data_for: Duration,

    /// Subscribe-time refetch policy for existing entries
    pub refetch_on_mount: StalenessPolicy,

    /// Force a refetch when a subscriber moves to a new argument set
    pub refetch_on_arg_change: bool,

    /// Refetch subscribed entries when the host regains focus
    pub refetch_on_focus: bool,

    /// Refetch subscribed entries when connectivity is restored
    pub refetch_on_reconnect: bool,

    /// Declared tag types; tags outside this list are reported.
    /// Empty disables the check.
    pub tag_types: Vec<String>,

    /// Capacity of the change notification channel
    pub notification_capacity: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            reducer_path: "api".to_string(),
            // 60 seconds, matching the usual "keep unused data" window
            keep_unused_data_for: Duration::from_secs(60),
            refetch_on_mount: StalenessPolicy::Never,
            refetch_on_arg_change: false,
            refetch_on_focus: false,
            refetch_on_reconnect: false,
            tag_types: Vec::new(),
            notification_capacity: 256,
        }
    }
}

impl ApiConfig {
    /// Create a new builder for the API configuration
    pub fn builder() -> ApiConfigBuilder {
        ApiConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.reducer_path.trim().is_empty() {
            return Err(QueryCacheError::ConfigError(
                "reducer_path must not be empty".to_string(),
            ));
        }

        if self.notification_capacity == 0 {
            return Err(QueryCacheError::ConfigError(
                "notification_capacity must be greater than 0".to_string(),
            ));
        }

        if let StalenessPolicy::OlderThan(max_age) = self.refetch_on_mount {
            if max_age.is_zero() {
                return Err(QueryCacheError::ConfigError(
                    "refetch_on_mount age must be greater than 0, use Always instead".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Whether a tag type has been declared (always true when none are)
    pub fn is_known_tag_type(&self, tag_type: &str) -> bool {
        self.tag_types.is_empty() || self.tag_types.iter().any(|t| t == tag_type)
    }

    /// Load configuration from `QUERY_CACHE_*` environment variables,
    /// reading a `.env` file first when one exists.
    ///
    /// Durations are given in seconds; `QUERY_CACHE_REFETCH_ON_MOUNT` accepts
    /// `never`, `always` or a number of seconds.
    pub fn from_env() -> Result<Self> {
        if dotenv::dotenv().is_ok() {
            debug!("Loaded .env file for query cache configuration");
        }

        let mut builder = ApiConfig::builder();

        if let Some(path) = env_var("REDUCER_PATH") {
            builder = builder.reducer_path(path);
        }
        if let Some(secs) = env_var("KEEP_UNUSED_DATA_FOR") {
            builder = builder.keep_unused_data_for(Duration::from_secs(parse_env("KEEP_UNUSED_DATA_FOR", &secs)?));
        }
        if let Some(policy) = env_var("REFETCH_ON_MOUNT") {
            builder = builder.refetch_on_mount(parse_policy(&policy)?);
        }
        if let Some(flag) = env_var("REFETCH_ON_ARG_CHANGE") {
            builder = builder.refetch_on_arg_change(parse_env("REFETCH_ON_ARG_CHANGE", &flag)?);
        }
        if let Some(flag) = env_var("REFETCH_ON_FOCUS") {
            builder = builder.refetch_on_focus(parse_env("REFETCH_ON_FOCUS", &flag)?);
        }
        if let Some(flag) = env_var("REFETCH_ON_RECONNECT") {
            builder = builder.refetch_on_reconnect(parse_env("REFETCH_ON_RECONNECT", &flag)?);
        }
        if let Some(types) = env_var("TAG_TYPES") {
            builder = builder.tag_types(
                types
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }

        let config = builder.build();
        config.validate()?;
        Ok(config)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{name}")).ok()
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim().parse().map_err(|_| {
        QueryCacheError::ConfigError(format!("invalid value for {ENV_PREFIX}{name}: '{raw}'"))
    })
}

fn parse_policy(raw: &str) -> Result<StalenessPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "never" | "false" => Ok(StalenessPolicy::Never),
        "always" | "true" => Ok(StalenessPolicy::Always),
        secs => Ok(StalenessPolicy::OlderThan(Duration::from_secs(parse_env(
            "REFETCH_ON_MOUNT",
            secs,
        )?))),
    }
}

/// Builder for the API configuration
#[derive(Debug, Default)]
pub struct ApiConfigBuilder {
    reducer_path: Option<String>,
    keep_unused_data_for: Option<Duration>,
    refetch_on_mount: Option<StalenessPolicy>,
    refetch_on_arg_change: Option<bool>,
    refetch_on_focus: Option<bool>,
    refetch_on_reconnect: Option<bool>,
    tag_types: Option<Vec<String>>,
    notification_capacity: Option<usize>,
}

impl ApiConfigBuilder {
    /// Set the name of the cache slice
    pub fn reducer_path(mut self, path: impl Into<String>) -> Self {
        self.reducer_path = Some(path.into());
        self
    }

    /// Set how long unused entries are kept
    pub fn keep_unused_data_for(mut self, duration: Duration) -> Self {
        self.keep_unused_data_for = Some(duration);
        self
    }

    /// Set the subscribe-time refetch policy
    pub fn refetch_on_mount(mut self, policy: StalenessPolicy) -> Self {
        self.refetch_on_mount = Some(policy);
        self
    }

    /// Enable or disable refetching when a subscriber changes arguments
    pub fn refetch_on_arg_change(mut self, enable: bool) -> Self {
        self.refetch_on_arg_change = Some(enable);
        self
    }

    /// Enable or disable refetching on focus
    pub fn refetch_on_focus(mut self, enable: bool) -> Self {
        self.refetch_on_focus = Some(enable);
        self
    }

    /// Enable or disable refetching on reconnect
    pub fn refetch_on_reconnect(mut self, enable: bool) -> Self {
        self.refetch_on_reconnect = Some(enable);
        self
    }

    /// Declare the tag types endpoints may provide or invalidate
    pub fn tag_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tag_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Set the notification channel capacity
    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = Some(capacity);
        self
    }

    /// Build the configuration
    pub fn build(self) -> ApiConfig {
        let defaults = ApiConfig::default();

        ApiConfig {
            reducer_path: self.reducer_path.unwrap_or(defaults.reducer_path),
            keep_unused_data_for: self
                .keep_unused_data_for
                .unwrap_or(defaults.keep_unused_data_for),
            refetch_on_mount: self.refetch_on_mount.unwrap_or(defaults.refetch_on_mount),
            refetch_on_arg_change: self
                .refetch_on_arg_change
                .unwrap_or(defaults.refetch_on_arg_change),
            refetch_on_focus: self.refetch_on_focus.unwrap_or(defaults.refetch_on_focus),
            refetch_on_reconnect: self
                .refetch_on_reconnect
                .unwrap_or(defaults.refetch_on_reconnect),
            tag_types: self.tag_types.unwrap_or(defaults.tag_types),
            notification_capacity: self
                .notification_capacity
                .unwrap_or(defaults.notification_capacity),
        }
    }
}

/// Preset configurations for common use cases
impl ApiConfig {
    /// Rapidly changing data: short retention, refetch whenever the host wakes up
    pub fn realtime() -> Self {
        Self {
            keep_unused_data_for: Duration::from_secs(5),
            refetch_on_mount: StalenessPolicy::OlderThan(Duration::from_secs(10)),
            refetch_on_arg_change: true,
            refetch_on_focus: true,
            refetch_on_reconnect: true,
            ..Default::default()
        }
    }

    /// Reference data that rarely changes
    pub fn long_lived() -> Self {
        Self {
            keep_unused_data_for: Duration::from_secs(30 * 60),
            refetch_on_mount: StalenessPolicy::Never,
            refetch_on_reconnect: true,
            ..Default::default()
        }
    }
}
