//! Conflict-aware round/queue scheduling.
//!
//! The scheduler partitions command instances into execution rounds such
//! that two instances sharing any semaphore name never land in the same
//! round, then sub-groups each round into serialization queues by slot
//! assignment. Within a queue, input order is preserved; that ordering is
//! a contract the engines rely on.
//!
//! Slot assignment is random: each instance draws one slot in
//! `[1, capacity]` per semaphore, spreading contenders across up to
//! `capacity` independent queues. Two instances may collide on a slot and
//! simply serialize, so capacity is enforced approximately, not exactly.
//! The random source is injected so a fixed seed reproduces a schedule.

use std::collections::{BTreeMap, HashMap};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::instance::CommandInstance;

/// A serialization queue: instances sharing a queue key run one at a time
#[derive(Debug, Clone)]
pub struct Queue {
    /// Sorted `"<semaphore>:<slot>"` strings identifying this queue
    pub key: Vec<String>,
    /// Members in input order
    pub instances: Vec<CommandInstance>,
}

/// A barrier-separated phase; all queues in a round may run concurrently
#[derive(Debug, Clone)]
pub struct Round {
    /// The conflict level this round was assigned
    pub level: usize,
    /// Queues in first-appearance order
    pub queues: Vec<Queue>,
}

/// The scheduler output: a reserved unconstrained phase plus leveled rounds
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    /// Instances with no semaphore requirement; these execute before all
    /// leveled rounds with unrestricted parallelism
    pub unconstrained: Vec<CommandInstance>,
    /// Leveled rounds in execution order
    pub rounds: Vec<Round>,
}

impl Schedule {
    /// Total number of scheduled instances
    pub fn instance_count(&self) -> usize {
        self.unconstrained.len()
            + self
                .rounds
                .iter()
                .map(|r| r.queues.iter().map(|q| q.instances.len()).sum::<usize>())
                .sum::<usize>()
    }

    /// True if nothing was scheduled
    pub fn is_empty(&self) -> bool {
        self.instance_count() == 0
    }

    /// All instances in execution order (queue interleaving notwithstanding)
    pub fn iter_instances(&self) -> impl Iterator<Item = &CommandInstance> {
        self.unconstrained.iter().chain(
            self.rounds
                .iter()
                .flat_map(|r| r.queues.iter().flat_map(|q| q.instances.iter())),
        )
    }
}

/// Conflict-leveling scheduler with an injected random source
#[derive(Debug)]
pub struct Scheduler<R: Rng> {
    rng: R,
}

impl Scheduler<StdRng> {
    /// A scheduler seeded for reproducible slot assignment
    pub fn from_seed(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    /// A scheduler drawing slots from OS entropy
    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl<R: Rng> Scheduler<R> {
    /// Create a scheduler over the given random source
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Partition instances into the unconstrained phase plus leveled rounds.
    ///
    /// Guarantee: any two instances placed in the same round have disjoint
    /// semaphore-name sets, so same-round queues are safe to run
    /// concurrently.
    pub fn schedule(&mut self, instances: Vec<CommandInstance>) -> Schedule {
        let mut unconstrained = Vec::new();
        let mut constrained: Vec<(Vec<String>, Vec<String>, CommandInstance)> = Vec::new();

        for instance in instances {
            if instance.is_unconstrained() {
                unconstrained.push(instance);
                continue;
            }
            let mut queue_key: Vec<String> = instance
                .semaphores
                .values()
                .map(|sem| {
                    let slot = self.rng.gen_range(1..=sem.capacity.max(1));
                    format!("{}:{}", sem.name, slot)
                })
                .collect();
            queue_key.sort();
            let conflict_key = instance.conflict_key();
            constrained.push((conflict_key, queue_key, instance));
        }

        let levels = assign_levels(constrained.iter().map(|(ck, _, _)| ck));

        // Group instances by level, then by queue key, preserving input
        // order at both steps.
        let mut by_level: BTreeMap<usize, Vec<(Vec<String>, CommandInstance)>> = BTreeMap::new();
        for (conflict_key, queue_key, instance) in constrained {
            let level = levels[&conflict_key];
            by_level
                .entry(level)
                .or_default()
                .push((queue_key, instance));
        }

        let mut rounds = Vec::new();
        for (level, members) in by_level {
            let mut order: Vec<Vec<String>> = Vec::new();
            let mut queues: HashMap<Vec<String>, Vec<CommandInstance>> = HashMap::new();
            for (queue_key, instance) in members {
                if !queues.contains_key(&queue_key) {
                    order.push(queue_key.clone());
                }
                queues.entry(queue_key).or_default().push(instance);
            }
            let queues = order
                .into_iter()
                .map(|key| {
                    let instances = queues.remove(&key).expect("queue recorded");
                    Queue { key, instances }
                })
                .collect();
            rounds.push(Round { level, queues });
        }

        debug!(
            unconstrained = unconstrained.len(),
            rounds = rounds.len(),
            "computed schedule"
        );
        Schedule {
            unconstrained,
            rounds,
        }
    }
}

/// Incremental max+1 leveling over distinct conflict keys.
///
/// Keys are processed in increasing size (ties broken lexicographically
/// for determinism); each key's level is one more than the highest level
/// among already-processed keys whose name-sets intersect it. Intersecting
/// keys therefore always end up on distinct levels.
fn assign_levels<'a>(
    conflict_keys: impl Iterator<Item = &'a Vec<String>>,
) -> HashMap<Vec<String>, usize> {
    let mut distinct: Vec<Vec<String>> = conflict_keys.cloned().collect();
    distinct.sort();
    distinct.dedup();
    distinct.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    let mut levels: HashMap<Vec<String>, usize> = HashMap::new();
    for key in distinct {
        let level = levels
            .iter()
            .filter(|(processed, _)| intersects(processed, &key))
            .map(|(_, level)| *level)
            .max()
            .map(|max| max + 1)
            .unwrap_or(0);
        levels.insert(key, level);
    }
    levels
}

fn intersects(a: &[String], b: &[String]) -> bool {
    // Both sides are sorted; walk them in lockstep.
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Equal => return true,
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
        }
    }
    false
}
