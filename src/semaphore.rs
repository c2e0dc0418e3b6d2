//! Named resource descriptors with bounded capacity.
//!
//! A semaphore names a logical resource (a GPU, a shared directory, a
//! license slot) and carries the number of concurrent holders it admits.
//! Capacity bounds how many serialization queues the scheduler spreads
//! contenders across; mutual exclusion itself comes from the round/queue
//! partition, so capacity enforcement is approximate rather than exact.

use dashmap::DashMap;
use thiserror::Error;

/// Errors raised when declaring semaphores
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SemaphoreError {
    /// Capacity must admit at least one holder
    #[error("semaphore '{name}' declared with capacity 0")]
    ZeroCapacity {
        /// Name of the offending semaphore
        name: String,
    },

    /// The same name was declared twice with different capacities
    #[error("semaphore '{name}' redeclared with capacity {new} (was {existing})")]
    CapacityMismatch {
        /// Name of the offending semaphore
        name: String,
        /// Capacity from the earlier declaration
        existing: u32,
        /// Capacity from the conflicting declaration
        new: u32,
    },
}

/// A named resource with an integer capacity.
///
/// Two semaphores are equal iff both name and capacity match. Conflict
/// detection in the scheduler compares names only.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Semaphore {
    /// Resource name; the identity used for conflict detection
    pub name: String,
    /// Number of concurrent holders admitted, always >= 1
    pub capacity: u32,
}

impl Semaphore {
    /// Create a semaphore descriptor
    pub fn new(name: impl Into<String>, capacity: u32) -> Self {
        Self {
            name: name.into(),
            capacity,
        }
    }
}

impl std::fmt::Display for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.capacity)
    }
}

/// Memoizing factory for semaphores.
///
/// Serial templates own exactly one private capacity-1 semaphore whose name
/// is derived from `(namespace, template_name)`; repeated calls for the
/// same pair return the same descriptor. Explicitly declared semaphores are
/// registered once and checked for capacity conflicts on redeclaration.
#[derive(Debug, Default)]
pub struct SemaphoreRegistry {
    inner: DashMap<String, Semaphore>,
}

impl SemaphoreRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The private capacity-1 semaphore owned by a serial template.
    ///
    /// The name is deterministic, so every call for the same
    /// `(namespace, template)` pair yields the same semaphore.
    pub fn serial(&self, namespace: &str, template: &str) -> Semaphore {
        let name = format!("{namespace}::{template}");
        self.inner
            .entry(name.clone())
            .or_insert_with(|| Semaphore::new(name, 1))
            .clone()
    }

    /// Register an explicitly declared semaphore.
    pub fn declare(&self, name: &str, capacity: u32) -> Result<Semaphore, SemaphoreError> {
        if capacity == 0 {
            return Err(SemaphoreError::ZeroCapacity {
                name: name.to_string(),
            });
        }
        if let Some(existing) = self.inner.get(name) {
            if existing.capacity != capacity {
                return Err(SemaphoreError::CapacityMismatch {
                    name: name.to_string(),
                    existing: existing.capacity,
                    new: capacity,
                });
            }
            return Ok(existing.clone());
        }
        let sem = Semaphore::new(name, capacity);
        self.inner.insert(name.to_string(), sem.clone());
        Ok(sem)
    }

    /// Look up a previously registered semaphore by name
    pub fn get(&self, name: &str) -> Option<Semaphore> {
        self.inner.get(name).map(|s| s.clone())
    }
}
