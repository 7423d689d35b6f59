//! # Allocator Configuration
//!
//! Tunables for block sizing and pooled-versus-private routing. Every field
//! has a default, so a configuration file only needs to name what it changes:
//!
//! ```json
//! { "large_heap_block_size": 134217728, "oversize_policy": "Reject" }
//! ```

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

const MIB: u64 = 1024 * 1024;

/// What to do with a pooled request larger than the preferred block size.
///
/// Such requests only reach the pool when private allocations are disabled.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OversizePolicy {
    /// Create a block sized to the request.
    #[default]
    GrowBlock,
    /// Fail the request as a configuration error.
    Reject,
}

/// Allocator tunables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorConfig {
    /// Heaps at or below this size are treated as small heaps
    pub small_heap_max_size: u64,
    /// Preferred block size for memory types on small heaps
    pub small_heap_block_size: u64,
    /// Preferred block size for memory types on large heaps
    pub large_heap_block_size: u64,
    /// Requests larger than `preferred block size / divisor` are allocated
    /// privately
    pub private_threshold_divisor: u64,
    /// Whether oversized requests may be routed to private allocations
    pub allow_private: bool,
    /// Whether the pool may grow by allocating new blocks
    pub allow_new_blocks: bool,
    /// Handling of pooled requests larger than a block
    pub oversize_policy: OversizePolicy,
    /// Free ranges smaller than this are never offered for placement
    pub min_free_register_size: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            small_heap_max_size: 512 * MIB,
            small_heap_block_size: 64 * MIB,
            large_heap_block_size: 256 * MIB,
            private_threshold_divisor: 2,
            allow_private: true,
            allow_new_blocks: true,
            oversize_policy: OversizePolicy::GrowBlock,
            min_free_register_size: 16,
        }
    }
}

impl AllocatorConfig {
    /// Parses a configuration from JSON and validates it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: AllocatorConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every field holds a usable value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.small_heap_block_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "small_heap_block_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.large_heap_block_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "large_heap_block_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.private_threshold_divisor == 0 {
            return Err(ConfigError::InvalidValue {
                field: "private_threshold_divisor",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.min_free_register_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "min_free_register_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        // A fresh block is one free range; it must be offered for placement.
        let smallest_block = self.small_heap_block_size.min(self.large_heap_block_size);
        if self.min_free_register_size > smallest_block {
            return Err(ConfigError::InvalidValue {
                field: "min_free_register_size",
                reason: format!("must not exceed the smallest block size ({smallest_block})"),
            });
        }

        Ok(())
    }

    /// Preferred block size for a memory type whose heap holds `heap_size`
    /// bytes.
    pub fn preferred_block_size(&self, heap_size: u64) -> u64 {
        if heap_size <= self.small_heap_max_size {
            self.small_heap_block_size
        } else {
            self.large_heap_block_size
        }
    }

    /// Requests above this size are allocated privately when
    /// [`allow_private`](Self::allow_private) is set.
    pub fn private_threshold(&self, preferred_block_size: u64) -> u64 {
        preferred_block_size / self.private_threshold_divisor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config =
            AllocatorConfig::from_json(r#"{ "large_heap_block_size": 1024, "oversize_policy": "Reject" }"#)
                .unwrap();

        assert_eq!(config.large_heap_block_size, 1024);
        assert_eq!(config.oversize_policy, OversizePolicy::Reject);
        assert_eq!(config.small_heap_block_size, 64 * MIB);
        assert!(config.allow_private);
    }

    #[test]
    fn zero_divisor_is_rejected() {
        let error = AllocatorConfig::from_json(r#"{ "private_threshold_divisor": 0 }"#).unwrap_err();

        assert!(matches!(
            error,
            ConfigError::InvalidValue {
                field: "private_threshold_divisor",
                ..
            }
        ));
    }

    #[test]
    fn register_threshold_cannot_exceed_a_block() {
        let error = AllocatorConfig::from_json(
            r#"{ "small_heap_block_size": 1024, "min_free_register_size": 4096 }"#,
        )
        .unwrap_err();
        assert!(matches!(
            error,
            ConfigError::InvalidValue {
                field: "min_free_register_size",
                ..
            }
        ));

        let at_limit = AllocatorConfig {
            small_heap_block_size: 1024,
            min_free_register_size: 1024,
            ..AllocatorConfig::default()
        };
        assert_eq!(at_limit.validate(), Ok(()));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(
            AllocatorConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn block_size_follows_heap_size() {
        let config = AllocatorConfig::default();

        assert_eq!(config.preferred_block_size(256 * MIB), 64 * MIB);
        assert_eq!(config.preferred_block_size(512 * MIB), 64 * MIB);
        assert_eq!(config.preferred_block_size(8192 * MIB), 256 * MIB);
        assert_eq!(config.private_threshold(256 * MIB), 128 * MIB);
    }
}
