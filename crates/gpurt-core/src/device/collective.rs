//! Collective and point-to-point communication between devices.
//!
//! A [`Communicator`] connects the participants of one clique. Collective
//! algorithms are built on a single rendezvous primitive, `exchange`, which
//! hands every participant the contributions of all ranks in rank order.
//! Point-to-point traffic goes through per-pair mailboxes.
//!
//! Reductions operate on `f32` elements.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, RuntimeError};

/// Reduction applied by all-reduce and reduce-scatter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionKind {
    /// Elementwise sum.
    Sum,
    /// Elementwise product.
    Product,
    /// Elementwise minimum.
    Min,
    /// Elementwise maximum.
    Max,
}

impl ReductionKind {
    fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            ReductionKind::Sum => a + b,
            ReductionKind::Product => a * b,
            ReductionKind::Min => a.min(b),
            ReductionKind::Max => a.max(b),
        }
    }
}

impl fmt::Display for ReductionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReductionKind::Sum => write!(f, "sum"),
            ReductionKind::Product => write!(f, "product"),
            ReductionKind::Min => write!(f, "min"),
            ReductionKind::Max => write!(f, "max"),
        }
    }
}

/// Connection of one rank to its clique.
pub trait Communicator: Send + Sync {
    /// This participant's rank.
    fn rank(&self) -> usize;

    /// Number of participants.
    fn size(&self) -> usize;

    /// Contributes `data` and returns every rank's contribution in rank
    /// order. All ranks must call this the same number of times.
    fn exchange(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    /// Sends `data` to `peer`.
    fn send(&self, peer: usize, data: Vec<u8>) -> Result<()>;

    /// Receives the next message from `peer`.
    fn recv(&self, peer: usize) -> Result<Vec<u8>>;
}

/// Communicator for a clique of one.
#[derive(Debug, Default)]
pub struct LocalCommunicator {
    loopback: Mutex<VecDeque<Vec<u8>>>,
}

impl LocalCommunicator {
    /// Creates a single-rank communicator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn exchange(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![data])
    }

    fn send(&self, peer: usize, data: Vec<u8>) -> Result<()> {
        check_peer(peer, 1)?;
        self.loopback.lock().push_back(data);
        Ok(())
    }

    fn recv(&self, peer: usize) -> Result<Vec<u8>> {
        check_peer(peer, 1)?;
        self.loopback
            .lock()
            .pop_front()
            .ok_or_else(|| RuntimeError::Collective("recv with no pending send".to_string()))
    }
}

/// Rendezvous state for `exchange`. A round completes when every rank has
/// contributed; the last arrival publishes the round and bumps `generation`.
struct Rendezvous {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    published: Arc<Vec<Vec<u8>>>,
}

struct CliqueShared {
    size: usize,
    timeout: Duration,
    rendezvous: Mutex<Rendezvous>,
    round_done: Condvar,
    mailboxes: Mutex<HashMap<(usize, usize), VecDeque<Vec<u8>>>>,
    mail_ready: Condvar,
}

/// A clique of ranks living in one process, one thread per rank.
pub struct InProcessClique;

impl InProcessClique {
    /// Creates `size` connected communicators, one per rank.
    pub fn create(size: usize) -> Vec<Arc<CliqueCommunicator>> {
        Self::with_timeout(size, Duration::from_secs(30))
    }

    /// Creates a clique whose exchanges and receives give up after `timeout`.
    pub fn with_timeout(size: usize, timeout: Duration) -> Vec<Arc<CliqueCommunicator>> {
        let shared = Arc::new(CliqueShared {
            size,
            timeout,
            rendezvous: Mutex::new(Rendezvous {
                generation: 0,
                arrived: 0,
                slots: vec![None; size],
                published: Arc::new(Vec::new()),
            }),
            round_done: Condvar::new(),
            mailboxes: Mutex::new(HashMap::new()),
            mail_ready: Condvar::new(),
        });
        tracing::debug!(size = size, "Created in-process clique");
        (0..size)
            .map(|rank| {
                Arc::new(CliqueCommunicator {
                    rank,
                    shared: Arc::clone(&shared),
                })
            })
            .collect()
    }
}

/// One rank of an [`InProcessClique`].
pub struct CliqueCommunicator {
    rank: usize,
    shared: Arc<CliqueShared>,
}

impl Communicator for CliqueCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn exchange(&self, data: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        let shared = &self.shared;
        let mut state = shared.rendezvous.lock();
        let generation = state.generation;
        state.slots[self.rank] = Some(data);
        state.arrived += 1;

        if state.arrived == shared.size {
            let gathered = state
                .slots
                .iter_mut()
                .map(Option::take)
                .collect::<Option<Vec<_>>>()
                .ok_or_else(|| RuntimeError::Collective("missing contribution in exchange".to_string()))?;
            state.published = Arc::new(gathered);
            state.arrived = 0;
            state.generation += 1;
            shared.round_done.notify_all();
            return Ok(state.published.as_ref().clone());
        }

        // The next round cannot complete without this rank, so `published`
        // still holds this round when the generation moves on.
        let deadline = Instant::now() + shared.timeout;
        while state.generation == generation {
            if shared.round_done.wait_until(&mut state, deadline).timed_out()
                && state.generation == generation
            {
                state.slots[self.rank] = None;
                state.arrived -= 1;
                return Err(RuntimeError::Collective(format!(
                    "rank {} timed out in exchange waiting for {} of {} ranks",
                    self.rank,
                    shared.size - state.arrived - 1,
                    shared.size
                )));
            }
        }
        Ok(state.published.as_ref().clone())
    }

    fn send(&self, peer: usize, data: Vec<u8>) -> Result<()> {
        check_peer(peer, self.shared.size)?;
        self.shared
            .mailboxes
            .lock()
            .entry((self.rank, peer))
            .or_default()
            .push_back(data);
        self.shared.mail_ready.notify_all();
        Ok(())
    }

    fn recv(&self, peer: usize) -> Result<Vec<u8>> {
        check_peer(peer, self.shared.size)?;
        let mut mailboxes = self.shared.mailboxes.lock();
        loop {
            if let Some(data) = mailboxes
                .get_mut(&(peer, self.rank))
                .and_then(|queue| queue.pop_front())
            {
                return Ok(data);
            }
            if self
                .shared
                .mail_ready
                .wait_for(&mut mailboxes, self.shared.timeout)
                .timed_out()
            {
                return Err(RuntimeError::Collective(format!(
                    "rank {} timed out waiting for rank {}",
                    self.rank, peer
                )));
            }
        }
    }
}

impl fmt::Debug for CliqueCommunicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CliqueCommunicator")
            .field("rank", &self.rank)
            .field("size", &self.shared.size)
            .finish()
    }
}

fn check_peer(peer: usize, size: usize) -> Result<()> {
    if peer >= size {
        return Err(RuntimeError::Collective(format!(
            "peer {} out of range for clique of {}",
            peer, size
        )));
    }
    Ok(())
}

// ============================================================================
// COLLECTIVE ALGORITHMS
// ============================================================================

/// Elementwise reduction across all ranks.
pub fn all_reduce(comm: &dyn Communicator, kind: ReductionKind, data: &[f32]) -> Result<Vec<f32>> {
    let contributions = comm.exchange(bytemuck::cast_slice::<f32, u8>(data).to_vec())?;
    let mut acc: Vec<f32> = bytemuck::pod_collect_to_vec(&contributions[0]);
    for contribution in &contributions[1..] {
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(contribution);
        if values.len() != acc.len() {
            return Err(RuntimeError::Collective(format!(
                "all-reduce size mismatch: {} vs {} elements",
                values.len(),
                acc.len()
            )));
        }
        for (a, v) in acc.iter_mut().zip(values) {
            *a = kind.apply(*a, v);
        }
    }
    Ok(acc)
}

/// Concatenates every rank's bytes in rank order.
pub fn all_gather(comm: &dyn Communicator, data: &[u8]) -> Result<Vec<u8>> {
    Ok(comm.exchange(data.to_vec())?.concat())
}

/// Reduces across ranks and keeps this rank's chunk of the result.
///
/// Sizes are checked after the exchange so every rank fails together.
pub fn reduce_scatter(comm: &dyn Communicator, kind: ReductionKind, data: &[f32]) -> Result<Vec<f32>> {
    let size = comm.size();
    let reduced = all_reduce(comm, kind, data)?;
    if reduced.len() % size != 0 {
        return Err(RuntimeError::Collective(format!(
            "reduce-scatter of {} elements over {} ranks",
            reduced.len(),
            size
        )));
    }
    let chunk = reduced.len() / size;
    Ok(reduced[comm.rank() * chunk..(comm.rank() + 1) * chunk].to_vec())
}

/// Sends chunk `i` of this rank's data to rank `i`; returns the chunks
/// received from every rank in rank order.
///
/// Sizes are checked after the exchange so every rank fails together.
pub fn all_to_all(comm: &dyn Communicator, data: &[u8]) -> Result<Vec<u8>> {
    let size = comm.size();
    let contributions = comm.exchange(data.to_vec())?;
    let len = contributions[0].len();
    if let Some((peer, c)) = contributions.iter().enumerate().find(|(_, c)| c.len() != len) {
        return Err(RuntimeError::Collective(format!(
            "all-to-all size mismatch: rank {} sent {} bytes, rank 0 sent {}",
            peer,
            c.len(),
            len
        )));
    }
    if len % size != 0 {
        return Err(RuntimeError::Collective(format!(
            "all-to-all of {} bytes over {} ranks",
            len, size
        )));
    }
    let chunk = len / size;
    let rank = comm.rank();
    let mut out = Vec::with_capacity(len);
    for contribution in &contributions {
        out.extend_from_slice(&contribution[rank * chunk..(rank + 1) * chunk]);
    }
    Ok(out)
}

/// Moves data along `(source, target)` pairs. Returns what this rank
/// received, or `None` if no rank targets it.
pub fn collective_permute(
    comm: &dyn Communicator,
    pairs: &[(usize, usize)],
    data: &[u8],
) -> Result<Option<Vec<u8>>> {
    let contributions = comm.exchange(data.to_vec())?;
    let rank = comm.rank();
    match pairs.iter().find(|(_, target)| *target == rank) {
        Some((source, _)) => contributions
            .get(*source)
            .cloned()
            .map(Some)
            .ok_or_else(|| RuntimeError::Collective(format!("permute source {} out of range", source))),
        None => Ok(None),
    }
}
