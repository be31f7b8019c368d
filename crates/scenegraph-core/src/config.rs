//! Engine configuration.

use crate::proposal::BoundaryOptions;
use std::time::Duration;

/// Default timeout for a single store call.
pub const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of timeout retries for Define/Redefine statements.
pub const DEFAULT_MAX_DEFINE_RETRIES: u32 = 2;

/// Schema evolution engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Timeout applied to every store call.
    pub statement_timeout: Duration,
    /// How often a Define/Redefine statement is retried after a timeout.
    pub max_define_retries: u32,
    /// Whether plans that delete live data may run.
    pub allow_destructive: bool,
    /// Supertype given to proposed entity types that declare none.
    pub default_entity_supertype: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            max_define_retries: DEFAULT_MAX_DEFINE_RETRIES,
            allow_destructive: false,
            default_entity_supertype: BoundaryOptions::default().default_entity_supertype,
        }
    }
}

impl EngineConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-call store timeout.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Set the Define/Redefine retry budget.
    pub fn with_max_define_retries(mut self, retries: u32) -> Self {
        self.max_define_retries = retries;
        self
    }

    /// Allow or forbid destructive plans.
    pub fn with_allow_destructive(mut self, allow: bool) -> Self {
        self.allow_destructive = allow;
        self
    }

    /// Set the default entity supertype. `None` leaves new entities at the root.
    pub fn with_default_entity_supertype(mut self, supertype: Option<String>) -> Self {
        self.default_entity_supertype = supertype;
        self
    }

    /// Options for converting loose analysis output.
    pub fn boundary_options(&self) -> BoundaryOptions {
        BoundaryOptions {
            default_entity_supertype: self.default_entity_supertype.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.statement_timeout, Duration::from_secs(30));
        assert_eq!(config.max_define_retries, 2);
        assert!(!config.allow_destructive);
        assert_eq!(
            config.default_entity_supertype.as_deref(),
            Some("physical_object")
        );
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::new()
            .with_statement_timeout(Duration::from_millis(250))
            .with_max_define_retries(0)
            .with_allow_destructive(true)
            .with_default_entity_supertype(None);
        assert_eq!(config.statement_timeout, Duration::from_millis(250));
        assert_eq!(config.max_define_retries, 0);
        assert!(config.allow_destructive);
        assert!(config.boundary_options().default_entity_supertype.is_none());
    }
}
