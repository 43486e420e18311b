//! The in-memory job scheduler
//!
//! The scheduler works by, at periodic "beats", moving one registered job
//! from its work queue to its ready queue. Jobs in the ready queue can be
//! claimed by any pinging worker, which moves them to the active queue. Jobs
//! that sit in the active queue for too long are reclaimed after a timeout
//! and moved back to the head of the work queue.
//!
//! Peers are not assigned to jobs. A peer is any entity that pings us; as
//! long as there is work in the ready queue, whoever asks next gets it. The
//! per-peer SLEEP hint spreads pings roughly uniformly over the beat interval
//! by scaling with the number of known-alive peers. It is the workers' job to
//! avoid getting caught crawling a site; ours is to avoid flooding it, which
//! is what the small ready-queue cap is for.
//!
//! All queues here are volatile. Task controllers own the durable state and
//! re-register pending jobs at every restart.

use std::collections::{HashMap, VecDeque};

use shared::protocol::Command;
use shared::utils::current_timestamp;
use tracing::{debug, info, warn};

/// Workers are asked to sleep this many seconds beyond their computed turn,
/// to avoid collision with the beat itself.
pub const SLEEP_DELAY: u64 = 10;

/// Max number of jobs offered for processing at once. A balance between not
/// wasting beats where nothing was assigned and not hammering the target
/// site.
pub const MAX_READY_WORKS: usize = 4;

/// Number of intervals to wait before assuming an active job failed and
/// recycling it back into the work queue.
pub const MIN_LIVENESS_INTERVALS: u64 = 10;

/// Number of cycles to wait before declaring a peer dead. A cycle is the time
/// it takes for every known peer to have its turn.
pub const MIN_LIVENESS_CYCLES: u64 = 2;

/// A schedulable unit: the action names the owning task type, the params are
/// opaque to the scheduler.
pub type Job = (String, String);

/// The scheduler was asked to complete a job it does not hold in any queue.
/// Harmless for duplicate result uploads; controllers decide whether to
/// swallow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown work being marked as done: {action} {params}")]
pub struct UnknownWork {
    pub action: String,
    pub params: String,
}

pub struct Scheduler {
    /// Seconds between beats.
    interval: u64,
    /// When the next beat is due, as a Unix timestamp.
    next_beat: u64,
    /// Last ping timestamp of every fresh peer.
    peers: HashMap<String, u64>,
    /// Jobs waiting to be offered. Appends go to the tail; the beat consumes
    /// from the head; recycled jobs are reinserted at the head so retries
    /// jump ahead of freshly added work.
    work_queue: VecDeque<Job>,
    /// Jobs currently offered to whoever pings next. Consumed LIFO.
    ready_queue: Vec<Job>,
    /// Assigned jobs with their dispatch timestamp.
    active_queue: HashMap<Job, u64>,
}

impl Scheduler {
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            // next beat should be... now!
            next_beat: current_timestamp(),
            peers: HashMap::new(),
            work_queue: VecDeque::new(),
            ready_queue: Vec::new(),
            active_queue: HashMap::new(),
        }
    }

    /// Enqueue a job for future processing. Neither token may contain
    /// whitespace; idempotence is the caller's responsibility.
    pub fn append_work(&mut self, action: &str, params: &str) {
        self.work_queue
            .push_back((action.to_string(), params.to_string()));
    }

    /// Tell a peer what to do next.
    ///
    /// Refreshes the peer's liveness timestamp, then either assigns a ready
    /// job or answers with a SLEEP command sized to the peer's turn in the
    /// rotation. With `just_ping` set the peer is always told to sleep, never
    /// handed another job in the same round trip - used right after a result
    /// upload so a worker cannot be made to hit the target site twice without
    /// sleeping in between.
    pub fn ping(&mut self, peer_id: &str, just_ping: bool) -> Command {
        self.ping_at(current_timestamp(), peer_id, just_ping)
    }

    fn assign_work(&mut self, peer_id: &str, now: u64) -> Command {
        info!(peer_id = %peer_id, "Assigning work to peer");
        let (action, params) = self
            .ready_queue
            .pop()
            .expect("assign_work called with an empty ready queue");
        self.active_queue
            .insert((action.clone(), params.clone()), now);
        Command::new(action, params)
    }

    pub(crate) fn ping_at(&mut self, now: u64, peer_id: &str, just_ping: bool) -> Command {
        self.peers.insert(peer_id.to_string(), now);
        if !self.ready_queue.is_empty() && !just_ping {
            return self.assign_work(peer_id, now);
        }
        // No work (or a forced ping): suggest a sleep long enough for every
        // other peer to take a turn first, never negative.
        let n_peers = (self.peers.len() as i64) - 1;
        let next_turn = (self.next_beat as i64 - now as i64)
            + n_peers * self.interval as i64
            + SLEEP_DELAY as i64;
        Command::sleep(next_turn.max(0) as u64)
    }

    /// Remove a job from whichever queue currently holds it.
    pub fn mark_work_done(&mut self, action: &str, params: &str) -> Result<(), UnknownWork> {
        let job = (action.to_string(), params.to_string());
        if self.active_queue.remove(&job).is_some() {
            return Ok(());
        }
        if let Some(pos) = self.work_queue.iter().position(|j| *j == job) {
            self.work_queue.remove(pos);
            return Ok(());
        }
        if let Some(pos) = self.ready_queue.iter().position(|j| *j == job) {
            self.ready_queue.remove(pos);
            return Ok(());
        }
        warn!(action = %action, params = %params, "Unknown work being marked as done");
        Err(UnknownWork {
            action: action.to_string(),
            params: params.to_string(),
        })
    }

    /// The periodic beat: promote work, rescue jobs that got stuck, and
    /// forget dead peers. Driven by the beat timer every `interval` seconds.
    pub fn beat(&mut self) {
        self.beat_at(current_timestamp());
    }

    pub(crate) fn beat_at(&mut self, now: u64) {
        self.next_beat = now + self.interval;

        // Offer at most one enqueued job per beat, bounded by the ready cap
        if !self.work_queue.is_empty() && self.ready_queue.len() <= MAX_READY_WORKS {
            if let Some(job) = self.work_queue.pop_front() {
                debug!(action = %job.0, params = %job.1, "Job moved to ready queue");
                self.ready_queue.push(job);
            }
        }

        // Recycle active jobs nobody reported back on. Reinserted at the
        // head: a recycled job is older than anything freshly added.
        let liveness_threshold = now.saturating_sub(MIN_LIVENESS_INTERVALS * self.interval);
        let stuck: Vec<Job> = self
            .active_queue
            .iter()
            .filter(|(_, &ts)| ts < liveness_threshold)
            .map(|(job, _)| job.clone())
            .collect();
        for job in stuck {
            warn!(action = %job.0, params = %job.1, "Recycling stuck job");
            self.active_queue.remove(&job);
            self.work_queue.push_front(job);
        }

        // Remove dead peers
        let node_liveness_threshold =
            now.saturating_sub(MIN_LIVENESS_CYCLES * self.interval * self.peers.len() as u64);
        self.peers.retain(|peer_id, &mut ts| {
            let alive = ts >= node_liveness_threshold;
            if !alive {
                info!(peer_id = %peer_id, "Evicting dead peer");
            }
            alive
        });
    }

    /// Change the beat period. The beat timer is rearmed by the owner of the
    /// timer task; this only updates the bookkeeping.
    pub fn reschedule(&mut self, new_interval: u64) {
        info!(
            old_interval = self.interval,
            new_interval, "Rescheduling beat interval"
        );
        self.interval = new_interval;
    }

    // Status accessors, used by the management and client pages

    pub fn interval(&self) -> u64 {
        self.interval
    }

    pub fn seconds_to_next_beat(&self) -> i64 {
        self.next_beat as i64 - current_timestamp() as i64
    }

    pub fn ready_len(&self) -> usize {
        self.ready_queue.len()
    }

    pub fn active_len(&self) -> usize {
        self.active_queue.len()
    }

    pub fn queued_len(&self) -> usize {
        self.work_queue.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peer_last_seen(&self, peer_id: &str) -> Option<u64> {
        self.peers.get(peer_id).copied()
    }

    #[cfg(test)]
    pub(crate) fn holds_job(&self, action: &str, params: &str) -> bool {
        let job = (action.to_string(), params.to_string());
        self.work_queue.contains(&job)
            || self.ready_queue.contains(&job)
            || self.active_queue.contains_key(&job)
    }

    #[cfg(test)]
    pub(crate) fn queue_membership(&self, action: &str, params: &str) -> (bool, bool, bool) {
        let job = (action.to_string(), params.to_string());
        (
            self.work_queue.contains(&job),
            self.ready_queue.contains(&job),
            self.active_queue.contains_key(&job),
        )
    }
}
