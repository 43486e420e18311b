//! Tests for the in-memory job scheduler

use crate::scheduler::{
    Scheduler, MAX_READY_WORKS, MIN_LIVENESS_CYCLES, MIN_LIVENESS_INTERVALS, SLEEP_DELAY,
};
use shared::protocol::Command;

const T0: u64 = 1_000_000;

/// A scheduler with its clock normalized to T0.
fn scheduler_at_t0(interval: u64) -> Scheduler {
    let mut scheduler = Scheduler::new(interval);
    scheduler.beat_at(T0);
    scheduler
}

#[test]
fn test_ping_with_no_work_suggests_sleep() {
    let mut scheduler = scheduler_at_t0(60);
    let command = scheduler.ping_at(T0, "p1", false);
    assert!(command.is_sleep());
    // Single peer: (next_beat - now) + 0 * interval + SLEEP_DELAY
    assert_eq!(command.params.parse::<u64>().unwrap(), 60 + SLEEP_DELAY);
}

#[test]
fn test_sleep_suggestion_scales_with_peer_count() {
    let mut scheduler = scheduler_at_t0(60);
    let first = scheduler.ping_at(T0, "p1", false);
    let second = scheduler.ping_at(T0, "p2", false);
    let first_n: u64 = first.params.parse().unwrap();
    let second_n: u64 = second.params.parse().unwrap();
    // The second peer waits one extra interval for the first peer's turn
    assert_eq!(second_n, first_n + 60);
}

#[test]
fn test_sleep_suggestion_is_never_negative() {
    let mut scheduler = scheduler_at_t0(60);
    // Ping long after the next beat was due
    let command = scheduler.ping_at(T0 + 10_000, "p1", false);
    assert!(command.is_sleep());
    let n: i64 = command.params.parse().unwrap();
    assert!(n >= 0);
}

#[test]
fn test_beat_promotes_one_job_per_tick() {
    let mut scheduler = scheduler_at_t0(1);
    scheduler.append_work("ARTICLE", "A");
    scheduler.append_work("ARTICLE", "B");
    assert_eq!(scheduler.queued_len(), 2);
    assert_eq!(scheduler.ready_len(), 0);

    scheduler.beat_at(T0 + 1);
    assert_eq!(scheduler.queued_len(), 1);
    assert_eq!(scheduler.ready_len(), 1);

    scheduler.beat_at(T0 + 2);
    assert_eq!(scheduler.queued_len(), 0);
    assert_eq!(scheduler.ready_len(), 2);
}

#[test]
fn test_ready_queue_is_bounded() {
    let mut scheduler = scheduler_at_t0(1);
    for i in 0..20 {
        scheduler.append_work("ARTICLE", &format!("job-{}", i));
    }
    for tick in 0..20 {
        scheduler.beat_at(T0 + 1 + tick);
        assert!(scheduler.ready_len() <= MAX_READY_WORKS + 1);
    }
    assert_eq!(scheduler.ready_len(), MAX_READY_WORKS + 1);
}

#[test]
fn test_assignment_is_lifo_from_ready() {
    let mut scheduler = scheduler_at_t0(1);
    scheduler.append_work("ARTICLE", "A");
    scheduler.append_work("ARTICLE", "B");
    scheduler.beat_at(T0 + 1);
    scheduler.beat_at(T0 + 2);

    // Arrival order reached the ready queue head-first; consumption is from
    // the tail, so the most recently promoted job goes out first.
    let command = scheduler.ping_at(T0 + 2, "p1", false);
    assert_eq!(command, Command::new("ARTICLE", "B"));
    assert_eq!(scheduler.active_len(), 1);
    let command = scheduler.ping_at(T0 + 2, "p2", false);
    assert_eq!(command, Command::new("ARTICLE", "A"));
}

#[test]
fn test_just_ping_never_assigns_work() {
    let mut scheduler = scheduler_at_t0(1);
    scheduler.append_work("ARTICLE", "A");
    scheduler.beat_at(T0 + 1);
    assert_eq!(scheduler.ready_len(), 1);

    let command = scheduler.ping_at(T0 + 1, "p1", true);
    assert!(command.is_sleep());
    assert_eq!(scheduler.ready_len(), 1);
    assert_eq!(scheduler.active_len(), 0);
}

#[test]
fn test_job_is_in_at_most_one_queue() {
    let mut scheduler = scheduler_at_t0(1);
    scheduler.append_work("T", "X");
    let sums = |s: &Scheduler| {
        let (w, r, a) = s.queue_membership("T", "X");
        w as u8 + r as u8 + a as u8
    };
    assert_eq!(sums(&scheduler), 1);
    scheduler.beat_at(T0 + 1);
    assert_eq!(sums(&scheduler), 1);
    scheduler.ping_at(T0 + 1, "p1", false);
    assert_eq!(sums(&scheduler), 1);
    scheduler.mark_work_done("T", "X").unwrap();
    assert_eq!(sums(&scheduler), 0);
}

#[test]
fn test_mark_work_done_removes_from_any_queue() {
    // From the work queue
    let mut scheduler = scheduler_at_t0(1);
    scheduler.append_work("T", "X");
    scheduler.mark_work_done("T", "X").unwrap();
    assert!(!scheduler.holds_job("T", "X"));

    // From the ready queue
    scheduler.append_work("T", "Y");
    scheduler.beat_at(T0 + 1);
    scheduler.mark_work_done("T", "Y").unwrap();
    assert!(!scheduler.holds_job("T", "Y"));

    // From the active queue
    scheduler.append_work("T", "Z");
    scheduler.beat_at(T0 + 2);
    scheduler.ping_at(T0 + 2, "p1", false);
    scheduler.mark_work_done("T", "Z").unwrap();
    assert!(!scheduler.holds_job("T", "Z"));
}

#[test]
fn test_mark_work_done_on_unknown_job_fails() {
    let mut scheduler = scheduler_at_t0(1);
    let err = scheduler.mark_work_done("T", "never-registered").unwrap_err();
    assert_eq!(err.action, "T");
    assert_eq!(err.params, "never-registered");
}

#[test]
fn test_stuck_job_is_recycled_with_priority() {
    let interval = 1;
    let mut scheduler = scheduler_at_t0(interval);
    scheduler.append_work("T", "X");
    scheduler.beat_at(T0 + 1);
    scheduler.ping_at(T0 + 1, "p1", false);
    assert_eq!(scheduler.active_len(), 1);

    // A fresh job arrives while X is stuck
    scheduler.append_work("T", "FRESH");

    // One beat past the liveness horizon reclaims the job
    let late = T0 + 1 + MIN_LIVENESS_INTERVALS * interval + 1;
    scheduler.beat_at(late);
    assert_eq!(scheduler.active_len(), 0);
    let (in_work, in_ready, _) = scheduler.queue_membership("T", "X");
    assert!(in_work || in_ready);

    // The recycled job is ahead of the fresh one: it reaches the ready
    // queue first (the same beat may already have promoted it)
    if !in_ready {
        scheduler.beat_at(late + 1);
    }
    let command = scheduler.ping_at(late + 1, "p2", false);
    assert_eq!(command, Command::new("T", "X"));
}

#[test]
fn test_active_job_within_horizon_is_left_alone() {
    let interval = 10;
    let mut scheduler = scheduler_at_t0(interval);
    scheduler.append_work("T", "X");
    scheduler.beat_at(T0 + 10);
    scheduler.ping_at(T0 + 10, "p1", false);

    scheduler.beat_at(T0 + 10 + (MIN_LIVENESS_INTERVALS - 1) * interval);
    assert_eq!(scheduler.active_len(), 1);
}

#[test]
fn test_dead_peers_are_evicted() {
    let interval = 1;
    let mut scheduler = scheduler_at_t0(interval);
    scheduler.ping_at(T0, "p1", false);
    assert_eq!(scheduler.peer_count(), 1);

    // One peer: the liveness horizon is MIN_LIVENESS_CYCLES * interval
    scheduler.beat_at(T0 + MIN_LIVENESS_CYCLES * interval + 1);
    assert_eq!(scheduler.peer_count(), 0);
}

#[test]
fn test_fresh_peer_survives_the_beat() {
    let mut scheduler = scheduler_at_t0(60);
    scheduler.ping_at(T0, "p1", false);
    scheduler.beat_at(T0 + 60);
    assert_eq!(scheduler.peer_count(), 1);
    assert!(scheduler.peer_last_seen("p1").is_some());
}

#[test]
fn test_reschedule_changes_the_interval() {
    let mut scheduler = scheduler_at_t0(60);
    scheduler.reschedule(5);
    assert_eq!(scheduler.interval(), 5);
    scheduler.beat_at(T0 + 60);
    let command = scheduler.ping_at(T0 + 60, "p1", false);
    // next_beat is now + 5, so the lone peer sleeps 5 + SLEEP_DELAY
    assert_eq!(command.params.parse::<u64>().unwrap(), 5 + SLEEP_DELAY);
}
