//! Semaphore configuration and store-key derivation.
//!
//! [`SemaphoreConfig`] enumerates everything a caller chooses: the logical
//! task name, this caller's identity, the capacity, the key namespace, and
//! the poll delay reserved for backoff tuning. [`SemaphoreKeys`] is the
//! explicit value type for the semaphore's store-resident identity; every
//! cooperating caller that derives the same keys contends for the same
//! slots.

use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

/// Configuration error from [`SemaphoreConfig::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    /// The task name is empty.
    EmptyTaskName,
    /// The caller identity is empty.
    EmptyIdentity,
    /// The capacity is zero; a semaphore needs at least one slot.
    ZeroCapacity,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyTaskName => write!(f, "task name must not be empty"),
            Self::EmptyIdentity => write!(f, "caller identity must not be empty"),
            Self::ZeroCapacity => write!(f, "capacity must be at least 1"),
        }
    }
}

impl StdError for ConfigError {}

/// Configuration for one caller of a distributed semaphore.
///
/// `task_name` and `identity` are required; the rest default to a capacity
/// of 1, the `"semaphore"` namespace, and a 100ms poll delay.
///
/// `identity` must be unique per concurrent acquirer: the protocol matches
/// waiter-list entries by identity and cannot tell two callers sharing one
/// apart. Uniqueness is a precondition, not enforced here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreConfig {
    /// Logical name of the guarded task or resource.
    pub task_name: String,
    /// Unique token identifying this acquirer.
    pub identity: String,
    /// Number of slots; callers beyond this bound queue.
    pub capacity: u32,
    /// Prefix for every store key this semaphore touches.
    pub namespace: String,
    /// Reserved for store-level backoff tuning.
    pub poll_delay: Duration,
}

impl SemaphoreConfig {
    /// Creates a configuration with the given task name and caller
    /// identity, and defaults for everything else.
    pub fn new(task_name: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            identity: identity.into(),
            capacity: 1,
            namespace: "semaphore".to_string(),
            poll_delay: Duration::from_millis(100),
        }
    }

    /// Sets the capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Sets the key namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the poll delay.
    #[must_use]
    pub fn with_poll_delay(mut self, poll_delay: Duration) -> Self {
        self.poll_delay = poll_delay;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.task_name.is_empty() {
            return Err(ConfigError::EmptyTaskName);
        }
        if self.identity.is_empty() {
            return Err(ConfigError::EmptyIdentity);
        }
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// The four store keys a semaphore lives under.
///
/// Derived deterministically from `(namespace, task_name)`; two callers
/// sharing a derivation share the semaphore.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SemaphoreKeys {
    /// Integer key holding the free-slot count.
    pub counter: String,
    /// Mutual-exclusion lock guarding counter and waiter-list access.
    pub lock: String,
    /// FIFO list of waiting caller identities.
    pub waiters: String,
    /// Pub/sub channel carrying release notifications.
    pub channel: String,
}

impl SemaphoreKeys {
    /// Derives the key set for `(namespace, task_name)`.
    #[must_use]
    pub fn derive(namespace: &str, task_name: &str) -> Self {
        let base = format!("{namespace}:{task_name}");
        Self {
            lock: format!("{base}:lock"),
            waiters: format!("{base}:waiters"),
            channel: format!("{base}:channel"),
            counter: base,
        }
    }
}

impl fmt::Display for SemaphoreKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = SemaphoreConfig::new("job", "worker-1");
        assert_eq!(config.capacity, 1);
        assert_eq!(config.namespace, "semaphore");
        assert_eq!(config.poll_delay, Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builders_override_defaults() {
        let config = SemaphoreConfig::new("job", "worker-1")
            .with_capacity(8)
            .with_namespace("jobs")
            .with_poll_delay(Duration::from_millis(25));
        assert_eq!(config.capacity, 8);
        assert_eq!(config.namespace, "jobs");
        assert_eq!(config.poll_delay, Duration::from_millis(25));
    }

    #[test]
    fn validation_rejects_bad_configs() {
        assert_eq!(
            SemaphoreConfig::new("", "id").validate(),
            Err(ConfigError::EmptyTaskName)
        );
        assert_eq!(
            SemaphoreConfig::new("job", "").validate(),
            Err(ConfigError::EmptyIdentity)
        );
        assert_eq!(
            SemaphoreConfig::new("job", "id").with_capacity(0).validate(),
            Err(ConfigError::ZeroCapacity)
        );
    }

    #[test]
    fn keys_derive_from_namespace_and_task() {
        let keys = SemaphoreKeys::derive("semaphore", "job");
        assert_eq!(keys.counter, "semaphore:job");
        assert_eq!(keys.lock, "semaphore:job:lock");
        assert_eq!(keys.waiters, "semaphore:job:waiters");
        assert_eq!(keys.channel, "semaphore:job:channel");
        assert_eq!(keys.to_string(), "semaphore:job");
    }

    #[test]
    fn same_derivation_names_the_same_semaphore() {
        assert_eq!(
            SemaphoreKeys::derive("ns", "task"),
            SemaphoreKeys::derive("ns", "task")
        );
        assert_ne!(
            SemaphoreKeys::derive("ns", "task"),
            SemaphoreKeys::derive("other", "task")
        );
    }
}
