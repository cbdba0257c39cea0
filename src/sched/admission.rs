//! FIFO admission of logical streams onto one physical unit.

use crate::config::defaults::MAX_TILES;
use crate::error::{Error, Result};
use crate::irq::{FastPath, IrqLock};
use crate::queue::IndexList;

/// One hardware pass handed out by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    /// Logical stream being serviced.
    pub instance: u32,
    /// Zero-based tile index of this pass.
    pub tile: u8,
    /// Total passes for the frame.
    pub tiles: u8,
}

impl Pass {
    /// Single-pass (untiled) work for `instance`.
    pub fn single(instance: u32) -> Self {
        Self {
            instance,
            tile: 0,
            tiles: 1,
        }
    }

    /// Whether this is the final pass of the frame.
    pub fn is_last(&self) -> bool {
        self.tile + 1 >= self.tiles
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Node {
    instance: u32,
    tiles: u8,
    next_tile: u8,
}

/// Unlocked schedule-node lists.
///
/// A busy node stays at the head until its last tile has been handed out,
/// then returns to the idle tail. An instance can have at most one busy
/// node.
#[derive(Debug)]
pub struct AdmissionQueue {
    list: IndexList,
    nodes: Box<[Node]>,
    busy: Box<[bool]>,
}

impl AdmissionQueue {
    /// Preallocate `node_count` nodes for instances `0..max_instances`.
    pub fn new(max_instances: u32, node_count: usize) -> Result<Self> {
        if node_count == 0 || max_instances == 0 {
            return Err(Error::AllocationFailed(
                "admission scheduler needs nodes and instances".into(),
            ));
        }
        Ok(Self {
            list: IndexList::new(node_count),
            nodes: vec![Node::default(); node_count].into_boxed_slice(),
            busy: vec![false; max_instances as usize].into_boxed_slice(),
        })
    }

    /// Queue one untiled pass for `instance`.
    pub fn enqueue(&mut self, instance: u32) -> Result<()> {
        self.enqueue_tiled(instance, 1)
    }

    /// Queue `tiles` consecutive passes for `instance`.
    pub fn enqueue_tiled(&mut self, instance: u32, tiles: u8) -> Result<()> {
        let max = self.busy.len() as u32;
        if instance >= max {
            return Err(Error::InvalidInstance { id: instance, max });
        }
        if tiles == 0 || tiles > MAX_TILES {
            return Err(Error::InvalidArgument(format!(
                "tile count {tiles} out of range 1..={MAX_TILES}"
            )));
        }
        if self.busy[instance as usize] {
            return Err(Error::AlreadyScheduled(instance));
        }
        let idx = self.list.activate().ok_or(Error::NoFreeNode)?;
        self.nodes[idx] = Node {
            instance,
            tiles,
            next_tile: 0,
        };
        self.busy[instance as usize] = true;
        Ok(())
    }

    /// Hand out the next pass of the head node, or `None` when idle.
    pub fn dequeue(&mut self) -> Option<Pass> {
        let idx = self.list.front()?;
        let node = &mut self.nodes[idx];
        let pass = Pass {
            instance: node.instance,
            tile: node.next_tile,
            tiles: node.tiles,
        };
        node.next_tile += 1;
        if node.next_tile >= node.tiles {
            self.busy[node.instance as usize] = false;
            self.list.retire();
        }
        Some(pass)
    }

    /// Flush every busy node back to idle. Returns how many were flushed.
    pub fn reset(&mut self) -> usize {
        for idx in self.list.iter_active() {
            self.busy[self.nodes[idx].instance as usize] = false;
        }
        self.list.reset()
    }

    /// Number of busy nodes.
    pub fn len(&self) -> usize {
        self.list.active_len()
    }

    /// Whether no node is busy.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of idle nodes.
    pub fn free_nodes(&self) -> usize {
        self.list.idle_len()
    }

    /// Whether `instance` has a busy node.
    pub fn contains(&self, instance: u32) -> bool {
        self.busy.get(instance as usize).copied().unwrap_or(false)
    }

    /// Number of instances this queue accepts.
    pub fn max_instances(&self) -> u32 {
        self.busy.len() as u32
    }
}

/// Locked [`AdmissionQueue`], usable from interrupt and worker context.
///
/// # Example
///
/// ```rust
/// use campipe::sched::AdmissionScheduler;
///
/// let sched = AdmissionScheduler::new(8, 2).unwrap();
/// sched.enqueue(5).unwrap();
/// sched.enqueue(7).unwrap();
/// assert_eq!(sched.dequeue().map(|p| p.instance), Some(5));
/// sched.enqueue(5).unwrap();
/// assert_eq!(sched.dequeue().map(|p| p.instance), Some(7));
/// assert_eq!(sched.dequeue().map(|p| p.instance), Some(5));
/// assert!(sched.dequeue().is_none());
/// ```
#[derive(Debug)]
pub struct AdmissionScheduler {
    inner: IrqLock<AdmissionQueue>,
}

impl AdmissionScheduler {
    /// See [`AdmissionQueue::new`].
    pub fn new(max_instances: u32, node_count: usize) -> Result<Self> {
        Ok(Self {
            inner: IrqLock::new(AdmissionQueue::new(max_instances, node_count)?),
        })
    }

    /// See [`AdmissionQueue::enqueue`].
    pub fn enqueue(&self, instance: u32) -> Result<()> {
        self.inner.with(|q| q.enqueue(instance))
    }

    /// See [`AdmissionQueue::enqueue_tiled`].
    pub fn enqueue_tiled(&self, instance: u32, tiles: u8) -> Result<()> {
        self.inner.with(|q| q.enqueue_tiled(instance, tiles))
    }

    /// See [`AdmissionQueue::dequeue`].
    pub fn dequeue(&self) -> Option<Pass> {
        self.inner.with(AdmissionQueue::dequeue)
    }

    /// See [`AdmissionQueue::reset`].
    pub fn reset(&self) -> usize {
        self.inner.with(AdmissionQueue::reset)
    }

    /// Number of busy nodes.
    pub fn len(&self) -> usize {
        self.inner.with(|q| q.len())
    }

    /// Whether no node is busy.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of idle nodes.
    pub fn free_nodes(&self) -> usize {
        self.inner.with(|q| q.free_nodes())
    }

    /// Whether `instance` has a busy node.
    pub fn contains(&self, instance: u32) -> bool {
        self.inner.with(|q| q.contains(instance))
    }
}

impl FastPath for AdmissionScheduler {}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(sched: &AdmissionScheduler) -> Vec<u32> {
        std::iter::from_fn(|| sched.dequeue().map(|p| p.instance)).collect()
    }

    #[test]
    fn test_two_node_scenario() {
        let sched = AdmissionScheduler::new(8, 2).unwrap();
        sched.enqueue(5).unwrap();
        sched.enqueue(7).unwrap();
        assert_eq!(sched.dequeue(), Some(Pass::single(5)));
        sched.enqueue(5).unwrap();
        assert_eq!(sched.dequeue(), Some(Pass::single(7)));
        assert_eq!(sched.dequeue(), Some(Pass::single(5)));
        assert_eq!(sched.dequeue(), None);
    }

    #[test]
    fn test_enqueue_then_dequeue_same_id() {
        let sched = AdmissionScheduler::new(4, 4).unwrap();
        for id in 0..4 {
            sched.enqueue(id).unwrap();
            assert_eq!(sched.dequeue().map(|p| p.instance), Some(id));
        }
    }

    #[test]
    fn test_fifo_order() {
        let sched = AdmissionScheduler::new(6, 6).unwrap();
        for id in [3, 0, 5, 1] {
            sched.enqueue(id).unwrap();
        }
        assert_eq!(ids(&sched), vec![3, 0, 5, 1]);
    }

    #[test]
    fn test_pool_exhaustion() {
        let sched = AdmissionScheduler::new(4, 2).unwrap();
        sched.enqueue(0).unwrap();
        sched.enqueue(1).unwrap();
        assert_eq!(sched.enqueue(2), Err(Error::NoFreeNode));
        assert!(!sched.contains(2));
        assert_eq!(sched.free_nodes(), 0);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let sched = AdmissionScheduler::new(2, 4).unwrap();
        assert_eq!(
            sched.enqueue(2),
            Err(Error::InvalidInstance { id: 2, max: 2 })
        );
        assert!(matches!(
            sched.enqueue_tiled(0, 0),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            sched.enqueue_tiled(0, MAX_TILES + 1),
            Err(Error::InvalidArgument(_))
        ));
        sched.enqueue(1).unwrap();
        assert_eq!(sched.enqueue(1), Err(Error::AlreadyScheduled(1)));
        assert!(AdmissionScheduler::new(0, 1).is_err());
        assert!(AdmissionScheduler::new(1, 0).is_err());
    }

    #[test]
    fn test_tiled_node_stays_at_head() {
        let sched = AdmissionScheduler::new(4, 4).unwrap();
        sched.enqueue_tiled(2, 3).unwrap();
        sched.enqueue(1).unwrap();

        let passes: Vec<Pass> = std::iter::from_fn(|| sched.dequeue()).collect();
        assert_eq!(
            passes,
            vec![
                Pass { instance: 2, tile: 0, tiles: 3 },
                Pass { instance: 2, tile: 1, tiles: 3 },
                Pass { instance: 2, tile: 2, tiles: 3 },
                Pass::single(1),
            ]
        );
        assert!(passes[2].is_last());
        assert!(!passes[0].is_last());
    }

    #[test]
    fn test_tiled_instance_busy_until_last_tile() {
        let sched = AdmissionScheduler::new(4, 4).unwrap();
        sched.enqueue_tiled(0, 2).unwrap();
        sched.dequeue();
        assert_eq!(sched.enqueue(0), Err(Error::AlreadyScheduled(0)));
        sched.dequeue();
        assert!(sched.enqueue(0).is_ok());
    }

    #[test]
    fn test_reset_flushes_busy_nodes() {
        let sched = AdmissionScheduler::new(4, 3).unwrap();
        sched.enqueue(0).unwrap();
        sched.enqueue_tiled(1, 4).unwrap();
        sched.dequeue();
        sched.enqueue(2).unwrap();

        assert_eq!(sched.reset(), 2);
        assert!(sched.is_empty());
        assert_eq!(sched.free_nodes(), 3);
        assert!(!sched.contains(1));
        assert!(sched.dequeue().is_none());
        sched.enqueue(1).unwrap();
        assert_eq!(sched.dequeue().map(|p| p.instance), Some(1));
    }
}
