//! Per-connection mining state.
//!
//! Each connection owns one `MiningState` for its lifetime: a bounded ring
//! of recently issued jobs, the monotonic counter that mints job ids, the
//! network target implied by the connection's current template, and the
//! connection's stratum difficulty.

use parking_lot::{Mutex, MutexGuard};
use ruint::aliases::U256;
use std::time::Instant;

use crate::node::RpcBlock;
use crate::types::StratumDiff;

/// Ring capacity. Job ids keep increasing forever; storage for them is
/// recycled every `MAX_JOBS` issuances.
pub const MAX_JOBS: usize = 32;

struct JobRing {
    slots: [Option<(u64, RpcBlock)>; MAX_JOBS],
    counter: u64,
}

/// The non-ring portion of the state, guarded as one unit: flags decided at
/// first-job setup plus the difficulty values that change across broadcasts.
#[derive(Default)]
pub struct StateInner {
    /// Target implied by the current template's compact bits
    pub network_target: U256,
    /// First job has been completed; one-time setup is done
    pub initialized: bool,
    /// Negotiated large-job encoding, decided once at setup
    pub use_big_job: bool,
    /// The connection's current owning difficulty
    pub stratum_diff: StratumDiff,
}

pub struct MiningState {
    jobs: Mutex<JobRing>,
    inner: Mutex<StateInner>,
    connect_time: Instant,
}

impl Default for MiningState {
    fn default() -> Self {
        Self::new()
    }
}

impl MiningState {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(JobRing {
                slots: std::array::from_fn(|_| None),
                counter: 0,
            }),
            inner: Mutex::new(StateInner::default()),
            connect_time: Instant::now(),
        }
    }

    /// Issue a new job for `template`, returning its id.
    ///
    /// Ids are strictly increasing and never reused; the slot `id % 32` is.
    /// Issuing the 33rd job overwrites storage for the 1st.
    pub fn add_job(&self, template: RpcBlock) -> u64 {
        let mut ring = self.jobs.lock();
        ring.counter += 1;
        let id = ring.counter;
        ring.slots[(id % MAX_JOBS as u64) as usize] = Some((id, template));
        id
    }

    /// Resolve a job id to the template it was issued for.
    ///
    /// Each slot remembers which id it was written for, so a recycled id
    /// resolves to `None` rather than whatever newer job now occupies its
    /// slot. Only the most recent 32 ids can resolve successfully.
    pub fn get_job(&self, id: u64) -> Option<RpcBlock> {
        let ring = self.jobs.lock();
        ring.slots[(id % MAX_JOBS as u64) as usize]
            .as_ref()
            .filter(|(stored_id, _)| *stored_id == id)
            .map(|(_, template)| template.clone())
    }

    pub fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock()
    }

    pub fn connect_time(&self) -> Instant {
        self.connect_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::messages::test_block;

    #[test]
    fn job_ids_strictly_increase() {
        let state = MiningState::new();
        let mut last = 0;
        for _ in 0..100 {
            let id = state.add_job(test_block(0x1d00ffff, 0));
            assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn recent_jobs_resolve_to_their_templates() {
        let state = MiningState::new();
        for ts in 1..=10u64 {
            state.add_job(test_block(0x1d00ffff, ts));
        }
        let job = state.get_job(7).expect("job 7 is recent");
        assert_eq!(job.header.timestamp, 7);
    }

    #[test]
    fn ring_recycles_slots_after_32_jobs() {
        let state = MiningState::new();
        for ts in 1..=40u64 {
            state.add_job(test_block(0x1d00ffff, ts));
        }
        // Job 37 landed in job 5's slot (5 % 32 == 37 % 32). The stale id
        // must not resolve; the live one must.
        assert!(state.get_job(5).is_none(), "recycled id resolves to nothing");
        let job = state.get_job(37).expect("job 37 is live");
        assert_eq!(job.header.timestamp, 37);
        // Oldest still-live id is 40 - 32 + 1 = 9.
        assert!(state.get_job(8).is_none());
        assert!(state.get_job(9).is_some());
    }

    #[test]
    fn unissued_ids_resolve_to_nothing() {
        let state = MiningState::new();
        assert!(state.get_job(1).is_none());
        state.add_job(test_block(0x1d00ffff, 0));
        assert!(state.get_job(2).is_none());
    }
}
