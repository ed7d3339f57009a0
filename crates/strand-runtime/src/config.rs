//! Cord configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Environment Variables
//!
//! - `STRAND_STACK_SIZE` - default usable fiber stack size in bytes

use strand_core::env::env_get;

use crate::stack::{DEFAULT_STACK_SIZE, MIN_STACK_SIZE};

/// Per-cord defaults applied to fibers created without explicit attributes
#[derive(Debug, Clone)]
pub struct CordConfig {
    /// Default usable stack size for new fibers
    pub stack_size: usize,
}

impl CordConfig {
    /// Library defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("STRAND_STACK_SIZE", DEFAULT_STACK_SIZE),
        }
    }

    /// Builder-style stack size override
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Check the configuration for nonsense values
    pub fn validate(&self) -> Result<(), String> {
        if self.stack_size < MIN_STACK_SIZE {
            return Err(format!(
                "stack_size {} below minimum {}",
                self.stack_size, MIN_STACK_SIZE
            ));
        }
        Ok(())
    }
}

impl Default for CordConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(CordConfig::from_env().validate().is_ok());
    }

    #[test]
    fn test_undersized_stack_rejected() {
        let cfg = CordConfig::from_env().stack_size(1024);
        assert!(cfg.validate().is_err());
    }
}
