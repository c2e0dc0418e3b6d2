//! Command templates: parsing, composition, and instance generation.
//!
//! A [`Template`] is a parsed command-text pattern with named variable
//! references and resource requirements. Templates may reference other
//! templates with `{templates[name]}`; [`compose`]/[`compose_all`] splice
//! those references into a single flattened token stream, propagating
//! serial-ness and semaphores. [`generate`] then expands a flattened
//! template against variable bindings into concrete
//! [`CommandInstance`](crate::instance::CommandInstance)s.

pub mod binder;
pub mod composer;
pub mod filter;
pub mod temp;
pub mod token;

pub use binder::{generate, Bindings, GenerateError, InstanceIter};
pub use composer::{compose, compose_all, ComposeError};
pub use filter::{FilterError, FilterExpr};
pub use temp::{TempFiles, TempSpec};
pub use token::{Accessor, FieldRef, Token, TokenError, TokenStream};

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::semaphore::Semaphore;

/// The pseudo-variable that lazily allocates temporary files
pub const TEMPFILE_VAR: &str = "TempFile";

/// A named, parsed command-text pattern.
///
/// `semaphores` starts out holding the template's own serial semaphore (if
/// any) plus explicitly attached ones; after composition it additionally
/// holds everything inherited from referenced templates, transitively.
#[derive(Debug, Clone)]
pub struct Template {
    /// Template name, unique within its namespace
    pub name: String,
    /// Namespace of the runbook that defined this template
    pub namespace: String,
    /// Parsed command text
    pub tokens: TokenStream,
    /// Fragments are only usable by composition, never scheduled directly
    pub is_fragment: bool,
    /// Serial templates own a private capacity-1 semaphore
    pub is_serial: bool,
    /// Referenced variable names in first-reference order
    pub variables: Vec<String>,
    /// Own plus inherited semaphores, keyed by name
    pub semaphores: BTreeMap<String, Semaphore>,
    /// Working directory for generated instances
    pub cwd: Option<PathBuf>,
}

impl Template {
    /// Parse command text into a template with no flags or semaphores
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        text: &str,
    ) -> Result<Self, TokenError> {
        let tokens = TokenStream::parse(text.trim())?;
        let variables = tokens.variables();
        Ok(Self {
            name: name.into(),
            namespace: namespace.into(),
            tokens,
            is_fragment: false,
            is_serial: false,
            variables,
            semaphores: BTreeMap::new(),
            cwd: None,
        })
    }

    /// Mark as a fragment (composition-only)
    pub fn fragment(mut self) -> Self {
        self.is_fragment = true;
        self
    }

    /// Mark as serial and attach the private semaphore from the registry
    pub fn serial(mut self, registry: &crate::semaphore::SemaphoreRegistry) -> Self {
        self.is_serial = true;
        let sem = registry.serial(&self.namespace, &self.name);
        self.semaphores.insert(sem.name.clone(), sem);
        self
    }

    /// Attach an explicitly declared semaphore
    pub fn with_semaphore(mut self, sem: Semaphore) -> Self {
        self.semaphores.insert(sem.name.clone(), sem);
        self
    }

    /// Set the working directory for generated instances
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// The current command text, reconstructed from the token stream
    pub fn text(&self) -> String {
        self.tokens.to_text()
    }
}
