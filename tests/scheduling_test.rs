//! Scheduler properties: leveling, the unconstrained phase, and ordering.

use std::collections::BTreeMap;

use batchrun::instance::{CommandInstance, VariableAssignment};
use batchrun::scheduler::{Schedule, Scheduler};
use batchrun::semaphore::Semaphore;

fn instance(name: &str, semaphores: &[(&str, u32)]) -> CommandInstance {
    CommandInstance {
        name: name.to_string(),
        script: "true".to_string(),
        assignment: VariableAssignment::default(),
        semaphores: semaphores
            .iter()
            .map(|(n, c)| (n.to_string(), Semaphore::new(*n, *c)))
            .collect::<BTreeMap<_, _>>(),
        cwd: None,
    }
}

fn names_in_round(schedule: &Schedule, index: usize) -> Vec<String> {
    let mut names: Vec<String> = schedule.rounds[index]
        .queues
        .iter()
        .flat_map(|q| q.instances.iter().map(|i| i.name.clone()))
        .collect();
    names.sort();
    names
}

#[test]
fn concrete_leveling_scenario_from_conflicting_keys() {
    // {A} -> round 0, {B} -> round 0, {A,B} -> round 1, {} -> unconstrained
    let mut scheduler = Scheduler::from_seed(11);
    let schedule = scheduler.schedule(vec![
        instance("a", &[("A", 1)]),
        instance("b", &[("B", 1)]),
        instance("ab", &[("A", 1), ("B", 1)]),
        instance("free", &[]),
    ]);

    assert_eq!(schedule.unconstrained.len(), 1);
    assert_eq!(schedule.unconstrained[0].name, "free");
    assert_eq!(schedule.rounds.len(), 2);
    assert_eq!(schedule.rounds[0].level, 0);
    assert_eq!(schedule.rounds[1].level, 1);
    assert_eq!(names_in_round(&schedule, 0), vec!["a", "b"]);
    assert_eq!(names_in_round(&schedule, 1), vec!["ab"]);
}

#[test]
fn chained_intersections_stack_levels() {
    // {A}, {B}, {C} -> 0; {A,B} -> 1; {A,B,C} intersects both -> 2
    let mut scheduler = Scheduler::from_seed(2);
    let schedule = scheduler.schedule(vec![
        instance("a", &[("A", 1)]),
        instance("b", &[("B", 1)]),
        instance("c", &[("C", 1)]),
        instance("ab", &[("A", 1), ("B", 1)]),
        instance("abc", &[("A", 1), ("B", 1), ("C", 1)]),
    ]);
    assert_eq!(schedule.rounds.len(), 3);
    assert_eq!(names_in_round(&schedule, 0), vec!["a", "b", "c"]);
    assert_eq!(names_in_round(&schedule, 1), vec!["ab"]);
    assert_eq!(names_in_round(&schedule, 2), vec!["abc"]);
}

#[test]
fn every_instance_is_scheduled_exactly_once() {
    let mut scheduler = Scheduler::from_seed(17);
    let instances: Vec<_> = (0..40)
        .map(|i| match i % 4 {
            0 => instance(&format!("i{i}"), &[("A", 2)]),
            1 => instance(&format!("i{i}"), &[("B", 3)]),
            2 => instance(&format!("i{i}"), &[("A", 2), ("B", 3)]),
            _ => instance(&format!("i{i}"), &[]),
        })
        .collect();
    let schedule = scheduler.schedule(instances);
    assert_eq!(schedule.instance_count(), 40);

    let mut seen: Vec<&str> = schedule.iter_instances().map(|i| i.name.as_str()).collect();
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 40);
}

#[test]
fn pairs_with_different_conflict_keys_never_share_a_round_semaphore() {
    let mut scheduler = Scheduler::from_seed(23);
    let schedule = scheduler.schedule(vec![
        instance("a1", &[("A", 2)]),
        instance("ab", &[("A", 2), ("B", 1)]),
        instance("b1", &[("B", 1)]),
        instance("c1", &[("C", 4)]),
        instance("bc", &[("B", 1), ("C", 4)]),
    ]);

    for round in &schedule.rounds {
        let members: Vec<&CommandInstance> = round
            .queues
            .iter()
            .flat_map(|q| q.instances.iter())
            .collect();
        for (i, left) in members.iter().enumerate() {
            for right in &members[i + 1..] {
                if left.conflict_key() == right.conflict_key() {
                    continue;
                }
                assert!(
                    !left
                        .semaphores
                        .keys()
                        .any(|k| right.semaphores.contains_key(k)),
                    "{} and {} conflict within one round",
                    left.name,
                    right.name
                );
            }
        }
    }
}

#[test]
fn queue_preserves_input_order_across_templates() {
    // Two different "templates" feeding the same capacity-1 semaphore:
    // generation order must survive into the queue.
    let mut scheduler = Scheduler::from_seed(31);
    let schedule = scheduler.schedule(vec![
        instance("alpha#0", &[("disk", 1)]),
        instance("beta#0", &[("disk", 1)]),
        instance("alpha#1", &[("disk", 1)]),
        instance("beta#1", &[("disk", 1)]),
    ]);
    assert_eq!(schedule.rounds.len(), 1);
    assert_eq!(schedule.rounds[0].queues.len(), 1);
    let order: Vec<&str> = schedule.rounds[0].queues[0]
        .instances
        .iter()
        .map(|i| i.name.as_str())
        .collect();
    assert_eq!(order, vec!["alpha#0", "beta#0", "alpha#1", "beta#1"]);
}

#[test]
fn seeded_schedules_are_reproducible() {
    let build = || {
        (0..20)
            .map(|i| instance(&format!("i{i}"), &[("gpu", 4)]))
            .collect::<Vec<_>>()
    };
    let keys = |schedule: &Schedule| -> Vec<Vec<String>> {
        schedule
            .rounds
            .iter()
            .flat_map(|r| r.queues.iter().map(|q| q.key.clone()))
            .collect()
    };
    let one = Scheduler::from_seed(99).schedule(build());
    let two = Scheduler::from_seed(99).schedule(build());
    assert_eq!(keys(&one), keys(&two));
}
