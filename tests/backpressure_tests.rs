//! Integration tests for back-pressure and resource exhaustion.
//!
//! These tests verify that:
//! - Full queues, node pools and rings are reported, never fatal
//! - A failed frame acquisition leaves every port untouched
//! - Stages recover from buffer starvation without intervention

use campipe::buffer::{Buffer, BufferId};
use campipe::bus::{BusRegistry, Command, Direction, Message, ReplyWriter};
use campipe::config::{BindRecord, BusConfig};
use campipe::error::{Error, ErrorKind, Result};
use campipe::frame::{Acquire, FrameBuffers, FrameContext, FramePool, FrameQueue, SourcePort};
use campipe::memory::MemBuf;
use campipe::queue::JobQueue;
use campipe::sched::{AdmissionScheduler, Pass};
use campipe::stage::{Capability, Capture, IrqStatus, StageKind};
use std::sync::Arc;

fn noop(_: &Message<'_>, _: &mut ReplyWriter<'_>) -> i32 {
    0
}

fn filled(id: u64) -> Buffer {
    Buffer::new(BufferId(id), MemBuf::new(0x2000_0000 + id * 0x100, 0x100))
}

#[test]
fn test_job_queue_capacity_two_scenario() {
    let queue = JobQueue::new(2).unwrap();
    assert_eq!(queue.push('a'), Ok(()));
    assert_eq!(queue.push('b'), Ok(()));
    assert_eq!(queue.push('c'), Err(Error::QueueFull));
    assert_eq!(queue.pop(), Ok('a'));
    assert_eq!(queue.push('c'), Ok(()));
    assert_eq!(queue.pop(), Ok('b'));
    assert_eq!(queue.pop(), Ok('c'));
    assert_eq!(queue.pop(), Err(Error::QueueEmpty));
}

#[test]
fn test_job_queue_fill_drain_and_reset() {
    for capacity in [1, 3, 16, 100] {
        let queue = JobQueue::new(capacity).unwrap();
        for i in 0..capacity {
            queue.push(i).unwrap();
        }
        let err = queue.push(capacity).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        assert!(err.is_retryable());

        let drained: Vec<usize> = std::iter::from_fn(|| queue.pop().ok()).collect();
        assert_eq!(drained, (0..capacity).collect::<Vec<_>>());

        // Any mix of ready and idle slots resets to all idle.
        for i in 0..capacity / 2 + 1 {
            queue.push(i).unwrap();
        }
        queue.pop().unwrap();
        queue.reset();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.idle(), capacity);
    }
    assert!(matches!(
        JobQueue::<u8>::new(0),
        Err(Error::AllocationFailed(_))
    ));
}

#[test]
fn test_admission_two_node_scenario() {
    let sched = AdmissionScheduler::new(8, 2).unwrap();
    sched.enqueue(5).unwrap();
    sched.enqueue(7).unwrap();
    assert_eq!(sched.enqueue(3), Err(Error::NoFreeNode));
    assert_eq!(sched.dequeue().map(|p| p.instance), Some(5));
    sched.enqueue(5).unwrap();
    assert_eq!(sched.dequeue().map(|p| p.instance), Some(7));
    assert_eq!(sched.dequeue().map(|p| p.instance), Some(5));
    assert_eq!(sched.dequeue(), None);
}

#[test]
fn test_admission_rejects_duplicates_and_bad_ids() {
    let sched = AdmissionScheduler::new(4, 4).unwrap();
    sched.enqueue(1).unwrap();
    assert_eq!(sched.enqueue(1), Err(Error::AlreadyScheduled(1)));
    assert_eq!(
        sched.enqueue(4),
        Err(Error::InvalidInstance { id: 4, max: 4 })
    );
    assert_eq!(sched.len(), 1);
}

#[test]
fn test_empty_sink_keeps_filled_source() {
    let sink = Arc::new(FramePool::new("empty"));
    let source = Arc::new(FrameQueue::new("in", 2));
    source.enqueue_filled(filled(1));

    let mut ctx = FrameContext::new(0);
    ctx.set_sink(sink.clone()).unwrap();
    ctx.add_source(source.clone()).unwrap();
    ctx.start().unwrap();

    assert_eq!(ctx.acquire_next_frame(), Ok(Acquire::NoBuffer));
    assert_eq!(source.pending(), 1);
    assert!(!ctx.has_frame());
    assert!(ctx.release_frame().is_empty());
}

#[test]
fn test_partial_sources_are_given_back() {
    let sink = Arc::new(FramePool::with_buffers("out", 0, 0x9000_0000, 0x100, 1));
    let sources: Vec<Arc<FrameQueue>> = (0..3)
        .map(|i| Arc::new(FrameQueue::new(format!("in{i}"), 2)))
        .collect();
    let mut ctx = FrameContext::new(0);
    ctx.set_sink(sink.clone()).unwrap();
    for source in &sources {
        ctx.add_source(source.clone()).unwrap();
    }
    ctx.start().unwrap();

    sources[0].enqueue_filled(filled(10));
    sources[1].enqueue_filled(filled(11));
    assert_eq!(ctx.acquire_next_frame(), Ok(Acquire::NoBuffer));
    assert_eq!(sources[0].pending(), 1);
    assert_eq!(sources[1].pending(), 1);
    assert_eq!(sink.free_count(), 1);

    sources[2].enqueue_filled(filled(12));
    let Ok(Acquire::Ready(frame)) = ctx.acquire_next_frame() else {
        panic!("all ports have buffers");
    };
    // Order of the inputs survived the give-back.
    assert_eq!(frame.sources[0], filled(10).mem());
    assert_eq!(frame.sources[2], filled(12).mem());
}

#[test]
fn test_full_ring_returns_retry_later() {
    let registry = BusRegistry::new(BusConfig::default()).unwrap();
    let (up, _) = registry
        .register(
            BindRecord::new(0x50, Direction::UpToDown).with_ring(64, 2),
            noop,
        )
        .unwrap();
    let (down, _) = registry
        .register(BindRecord::new(0x50, Direction::DownToUp), noop)
        .unwrap();

    up.post(Command::ResetControl).unwrap();
    up.post(Command::ResetControl).unwrap();
    let err = up.post(Command::ResetControl).unwrap_err();
    assert_eq!(err, Error::RetryLater);
    assert!(err.is_retryable());

    assert_eq!(down.deliver().unwrap(), 2);
    assert!(up.post(Command::ResetControl).is_ok());
    assert_eq!(up.stats().outstanding, 1);
}

#[test]
fn test_capture_rides_out_starvation() {
    let capture = Capture::new(
        "csi0",
        StageKind::Capture.default_config(),
        |_: &Pass, _: &FrameBuffers| -> Result<()> { Ok(()) },
    )
    .unwrap();
    let pool = Arc::new(FramePool::with_buffers("raw", 0, 0x8000_0000, 0x1000, 3));
    capture.attach_output(0, pool.clone()).unwrap();
    capture.driver().start(0).unwrap();

    let mut delivered = 0;
    for cycle in 0..30 {
        capture.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
        // Every buffer is in exactly one place.
        let loaned = usize::from(capture.driver().frame_buffers(0).unwrap().is_some());
        assert_eq!(
            pool.free_count() + pool.produced_count() + loaned,
            pool.total()
        );
        // A slow consumer returns frames only every third cycle.
        if cycle % 3 == 2 {
            while let Some(buf) = pool.take_produced() {
                delivered += 1;
                pool.recycle(buf);
            }
        }
    }
    assert!(delivered > 0);
    assert_eq!(pool.stats().dropped, 0);
    assert_eq!(pool.stats().produced, delivered + pool.produced_count() as u64);
}
