//! # batchrun
//!
//! Conflict-aware generation and execution of parameterized shell script
//! batches.
//!
//! batchrun expands reusable command templates into concrete script
//! instances (the cross product of their variable bindings), then schedules
//! those instances into execution rounds so that scripts competing for the
//! same named resource never run at the same time, while independent
//! scripts run with full parallelism.
//!
//! ## Quick Start
//!
//! ```rust
//! use batchrun::template::{compose_all, generate, Bindings, TempSpec, Template};
//! use std::collections::BTreeMap;
//! use serde_json::json;
//!
//! # fn example() -> batchrun::Result<()> {
//! // Define a template with one variable
//! let mut templates = BTreeMap::new();
//! templates.insert(
//!     "build".to_string(),
//!     Template::new("bench", "build", "make -j {jobs}")?,
//! );
//!
//! // Flatten template references and derive the final variable set
//! let composed = compose_all(&templates)?;
//!
//! // Generate one instance per variable combination
//! let mut bindings = Bindings::new();
//! bindings.insert("jobs".to_string(), json!([2, 4]));
//! let instances = generate(&composed["build"], &bindings, &[], &TempSpec::default())?
//!     .collect::<Result<Vec<_>, _>>()?;
//! assert_eq!(instances.len(), 2);
//! assert_eq!(instances[0].script, "make -j 2");
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```
//!
//! ## Modules
//!
//! - [`template`]: token streams, template composition, and instance generation
//! - [`semaphore`]: named resource descriptors and the memoizing registry
//! - [`scheduler`]: conflict leveling into rounds and serialization queues
//! - [`engine`]: serial and parallel execution engines
//! - [`config`]: YAML runbook loading with namespace imports

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for batchrun operations
pub type Result<T> = std::result::Result<T, BatchRunError>;

/// Main error type for batchrun operations
#[derive(Error, Debug)]
pub enum BatchRunError {
    /// Malformed runbook structure, fatal at load time
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    /// Template text failed to parse into a token stream
    #[error("Template parse error: {0}")]
    Token(#[from] template::TokenError),

    /// Template composition failed (cycle or unknown reference)
    #[error("Composition error: {0}")]
    Compose(#[from] template::ComposeError),

    /// Instance generation failed for one template
    #[error("Generation error: {0}")]
    Generate(#[from] template::GenerateError),

    /// A filter predicate failed to parse or evaluate
    #[error("Filter error: {0}")]
    Filter(#[from] template::FilterError),

    /// Execution engine failure outside any single instance
    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    /// Semaphore declaration error
    #[error("Semaphore error: {0}")]
    Semaphore(#[from] semaphore::SemaphoreError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Join error from async tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Named resource descriptors and the memoizing semaphore registry
pub mod semaphore;

/// Templates, token streams, composition, filters, and instance generation
pub mod template;

/// Concrete command instances produced by generation
pub mod instance;

/// Conflict-leveling scheduler producing rounds and queues
pub mod scheduler;

/// Serial and parallel execution engines
pub mod engine;

/// YAML runbook loading and merging
pub mod config;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_semaphore_creation() {
        let sem = semaphore::Semaphore::new("gpu0", 2);
        assert_eq!(sem.name, "gpu0");
        assert_eq!(sem.capacity, 2);
    }

    #[test]
    fn test_error_display() {
        let err = BatchRunError::from(template::ComposeError::Cycle {
            template: "a".to_string(),
        });
        assert!(err.to_string().contains("a"));
    }
}
