//! Concrete command instances.
//!
//! An instance is one renderable unit of work: the rendered script text,
//! the variable assignment that produced it (including any temporary files
//! it owns), and the semaphore set the scheduler uses as its conflict key.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use crate::semaphore::Semaphore;

/// The variable values bound for one cross-product combination
#[derive(Debug, Clone, Default)]
pub struct VariableAssignment {
    /// Bound variable values, keyed by name
    pub values: BTreeMap<String, Value>,
    /// Temporary files allocated while rendering, keyed by attribute.
    /// Ownership of these files belongs to the instance; the execution
    /// engine applies the retention policy to them.
    pub temp_files: BTreeMap<String, PathBuf>,
}

/// One concrete, immutable unit of work
#[derive(Debug, Clone)]
pub struct CommandInstance {
    /// Instance name, `<template>#<index>`
    pub name: String,
    /// Fully rendered script text
    pub script: String,
    /// The assignment this instance was rendered from
    pub assignment: VariableAssignment,
    /// Own plus inherited semaphores of the owning template
    pub semaphores: BTreeMap<String, Semaphore>,
    /// Working directory for execution
    pub cwd: Option<PathBuf>,
}

impl CommandInstance {
    /// Sorted semaphore names; instances conflict iff their keys intersect
    pub fn conflict_key(&self) -> Vec<String> {
        self.semaphores.keys().cloned().collect()
    }

    /// True if this instance carries no semaphore requirement
    pub fn is_unconstrained(&self) -> bool {
        self.semaphores.is_empty()
    }
}

impl std::fmt::Display for CommandInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}
