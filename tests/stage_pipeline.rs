//! End-to-end tests for stage drivers wired into small pipelines.

use campipe::buffer::{Buffer, BufferId};
use campipe::bus::{BusRegistry, Command, Direction, Message, ReplyWriter, StageState};
use campipe::config::{BindRecord, BusConfig};
use campipe::error::Result;
use campipe::frame::{FrameBuffers, FramePool, FrameQueue, FrameState, SourcePort};
use campipe::memory::MemBuf;
use campipe::sched::Pass;
use campipe::stage::{
    Capability, Capture, Hardware, IrqStatus, Isp, Scaler, Stage, StageEvent, StageKind, Warp,
};
use std::sync::{Arc, Mutex, OnceLock, mpsc};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Hardware double recording every programmed pass.
#[derive(Clone, Default)]
struct Recorder {
    passes: Arc<Mutex<Vec<(Pass, FrameBuffers)>>>,
}

impl Recorder {
    fn hardware(&self) -> impl Hardware + 'static {
        let passes = Arc::clone(&self.passes);
        move |pass: &Pass, frame: &FrameBuffers| -> Result<()> {
            passes.lock().unwrap().push((*pass, frame.clone()));
            Ok(())
        }
    }

    fn passes(&self) -> Vec<(Pass, FrameBuffers)> {
        self.passes.lock().unwrap().clone()
    }

    fn last(&self) -> (Pass, FrameBuffers) {
        self.passes().last().cloned().unwrap()
    }
}

fn filled(id: u64) -> Buffer {
    Buffer::new(BufferId(id), MemBuf::new(0x1000_0000 + id * 0x1000, 0x1000))
}

async fn next_frame_done(rx: &mut broadcast::Receiver<StageEvent>) -> (u32, u64, bool) {
    loop {
        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within a second")
            .expect("event stream open");
        if let StageEvent::FrameDone {
            instance,
            sequence,
            dropped,
        } = event
        {
            return (instance, sequence, dropped);
        }
    }
}

#[test]
fn test_capture_feeds_isp() {
    let capture_hw = Recorder::default();
    let isp_hw = Recorder::default();
    let capture = Capture::new(
        "csi0",
        StageKind::Capture.default_config(),
        capture_hw.hardware(),
    )
    .unwrap();
    let isp = Isp::new("isp0", StageKind::Isp.default_config(), isp_hw.hardware()).unwrap();

    let raw = Arc::new(FramePool::with_buffers("raw", 0, 0x8000_0000, 0x1000, 2));
    let link = Arc::new(FrameQueue::new("raw-link", 2));
    assert!(raw.link(&link));
    let processed = Arc::new(FramePool::with_buffers("yuv", 100, 0x9000_0000, 0x1000, 2));

    capture.attach_output(0, raw.clone()).unwrap();
    isp.connect(0, link.clone(), processed.clone()).unwrap();
    isp.driver().start(0).unwrap();
    capture.driver().start(0).unwrap();
    assert!(isp.driver().is_starved(0).unwrap());

    // Capture finishes frame 1; it flows straight into the ISP.
    capture.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
    assert!(!isp.driver().is_starved(0).unwrap());
    let (_, isp_frame) = isp_hw.last();
    assert_eq!(isp_frame.sources.as_slice(), &[MemBuf::new(0x8000_0000, 0x1000)]);
    assert_eq!(capture_hw.passes().len(), 2);

    // ISP done: raw buffer goes back to the capture pool.
    isp.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
    assert_eq!(processed.produced_count(), 1);
    assert_eq!(link.consumed_total(), 1);
    assert_eq!(raw.free_count(), 1);

    // Several more cycles keep both stages turning.
    for _ in 0..4 {
        capture.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
        isp.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
        processed.recycle(processed.take_produced().unwrap());
    }
    assert_eq!(link.consumed_total(), 5);
    assert_eq!(processed.stats().produced, 5);
    assert_eq!(raw.stats().dropped, 0);
}

#[test]
fn test_downstream_programs_outside_upstream_locks() {
    let upstream: Arc<OnceLock<Capture>> = Arc::default();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let isp_hw = {
        let upstream = Arc::clone(&upstream);
        let seen = Arc::clone(&seen);
        move |_: &Pass, _: &FrameBuffers| -> Result<()> {
            // Reads the upstream stage while its interrupt is still running.
            if let Some(capture) = upstream.get() {
                seen.lock().unwrap().push(capture.driver().state(0)?);
            }
            Ok(())
        }
    };
    let capture = Capture::new(
        "csi0",
        StageKind::Capture.default_config(),
        Recorder::default().hardware(),
    )
    .unwrap();
    let isp = Isp::new("isp0", StageKind::Isp.default_config(), isp_hw).unwrap();
    assert!(upstream.set(capture.clone()).is_ok());

    let raw = Arc::new(FramePool::with_buffers("raw", 0, 0x8000_0000, 0x1000, 2));
    let link = Arc::new(FrameQueue::new("raw-link", 2));
    assert!(raw.link(&link));
    let processed = Arc::new(FramePool::with_buffers("yuv", 100, 0x9000_0000, 0x1000, 2));
    capture.attach_output(0, raw.clone()).unwrap();
    isp.connect(0, link.clone(), processed.clone()).unwrap();
    isp.driver().start(0).unwrap();
    capture.driver().start(0).unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let driver = Arc::clone(capture.driver());
    std::thread::spawn(move || {
        let _ = done_tx.send(driver.on_interrupt(IrqStatus::frame_end(0)));
    });
    let result = done_rx
        .recv_timeout(Duration::from_secs(3))
        .expect("capture interrupt finished");
    assert!(result.is_ok());
    assert_eq!(*seen.lock().unwrap(), vec![FrameState::Running]);

    // The held raw buffer comes back only when the ISP lets go of it.
    isp.driver().hold_source(0, 0).unwrap();
    isp.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
    assert_eq!(raw.free_count(), 0);
    assert!(isp.driver().release_held(0, 0).unwrap());
    assert_eq!(raw.free_count(), 1);
}

#[tokio::test]
async fn test_capture_event_stream() {
    let hw = Recorder::default();
    let capture = Capture::new("csi0", StageKind::Capture.default_config(), hw.hardware()).unwrap();
    let pool = Arc::new(FramePool::with_buffers("raw", 0, 0x8000_0000, 0x1000, 4));
    capture.attach_output(0, pool.clone()).unwrap();
    let mut rx = capture.driver().subscribe();

    capture.driver().start(0).unwrap();
    for _ in 0..3 {
        capture.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
    }

    for expected in 1..=3 {
        assert_eq!(next_frame_done(&mut rx).await, (0, expected, false));
    }
    assert_eq!(pool.produced_count(), 3);
}

#[tokio::test]
async fn test_isp_streams_take_turns() {
    let hw = Recorder::default();
    let config = StageKind::Isp.default_config().with_instances(2);
    let isp = Isp::new("isp0", config, hw.hardware()).unwrap();
    let mut rx = isp.driver().subscribe();

    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for i in 0..2u32 {
        let input = Arc::new(FrameQueue::new(format!("in{i}"), 4));
        let output = Arc::new(FramePool::with_buffers(
            format!("out{i}"),
            u64::from(i) * 10,
            0x9000_0000 + u64::from(i) * 0x10_0000,
            0x1000,
            2,
        ));
        isp.connect(i, input.clone(), output.clone()).unwrap();
        isp.driver().start(i).unwrap();
        inputs.push(input);
        outputs.push(output);
    }

    // Stream 1 submits first, so it owns the unit first.
    inputs[1].enqueue_filled(filled(1));
    inputs[0].enqueue_filled(filled(2));
    inputs[1].enqueue_filled(filled(3));
    assert_eq!(isp.queued(), 1);
    assert_eq!(hw.last().0.instance, 1);

    for _ in 0..3 {
        let running = isp.driver().unit().unwrap().running().unwrap();
        isp.driver()
            .on_interrupt(IrqStatus::frame_end(running.instance))
            .unwrap();
    }

    let order: Vec<u32> = hw.passes().iter().map(|(p, _)| p.instance).collect();
    assert_eq!(order, vec![1, 0, 1]);
    assert_eq!(next_frame_done(&mut rx).await, (1, 1, false));
    assert_eq!(next_frame_done(&mut rx).await, (0, 1, false));
    assert_eq!(next_frame_done(&mut rx).await, (1, 2, false));
    assert_eq!(outputs[0].produced_count(), 1);
    assert_eq!(outputs[1].produced_count(), 2);
    assert!(!isp.driver().unit().unwrap().is_busy());
}

#[test]
fn test_scaler_waits_for_every_input() {
    let hw = Recorder::default();
    let scaler = Scaler::new(
        "scaler0",
        StageKind::Scaler.default_config().with_sources(6),
        hw.hardware(),
    )
    .unwrap();
    assert_eq!(scaler.fan_in(), 6);

    let inputs: Vec<Arc<FrameQueue>> = (0..6)
        .map(|i| Arc::new(FrameQueue::new(format!("cam{i}"), 2)))
        .collect();
    let ports: Vec<Arc<dyn SourcePort>> = inputs
        .iter()
        .map(|q| Arc::clone(q) as Arc<dyn SourcePort>)
        .collect();
    let output = Arc::new(FramePool::with_buffers("pano", 0, 0xa000_0000, 0x6000, 1));
    assert!(scaler.connect(0, &ports[..5], output.clone()).is_err());
    scaler.connect(0, &ports, output.clone()).unwrap();
    scaler.driver().start(0).unwrap();

    for (i, input) in inputs.iter().enumerate().take(5) {
        input.enqueue_filled(filled(i as u64));
    }
    assert!(hw.passes().is_empty());
    // Nothing is held while waiting for the sixth camera.
    assert!(inputs.iter().take(5).all(|q| q.pending() == 1));
    assert_eq!(output.free_count(), 1);

    inputs[5].enqueue_filled(filled(5));
    let (_, frame) = hw.last();
    assert_eq!(frame.sources.len(), 6);
    assert_eq!(frame.sources[5], MemBuf::new(0x1000_0000 + 5 * 0x1000, 0x1000));

    scaler.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
    assert!(inputs.iter().all(|q| q.consumed_total() == 1));
    assert_eq!(output.produced_count(), 1);
    assert!(scaler.driver().is_starved(0).unwrap());
}

#[test]
fn test_warp_tiles_without_output_pool() {
    let hw = Recorder::default();
    let config = StageKind::Warp
        .default_config()
        .with_tiles(2)
        .with_sink(false);
    let warp = Warp::new("warp0", config, hw.hardware()).unwrap();
    assert_eq!(warp.tiles(), 2);
    let input = Arc::new(FrameQueue::new("warp-in", 2));
    warp.connect(0, input.clone(), None).unwrap();
    let mut rx = warp.driver().subscribe();
    warp.driver().start(0).unwrap();

    input.enqueue_filled(filled(7));
    warp.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
    assert_eq!(input.consumed_total(), 0);
    warp.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
    assert_eq!(input.consumed_total(), 1);

    let tiles: Vec<u8> = hw.passes().iter().map(|(p, _)| p.tile).collect();
    assert_eq!(tiles, vec![0, 1]);
    assert!(hw.passes().iter().all(|(_, f)| f.sink.is_none()));

    let done: Vec<StageEvent> = std::iter::from_fn(|| rx.try_recv().ok())
        .filter(|e| matches!(e, StageEvent::FrameDone { .. }))
        .collect();
    assert_eq!(
        done,
        vec![StageEvent::FrameDone {
            instance: 0,
            sequence: 1,
            dropped: false
        }]
    );
}

#[test]
fn test_stage_controlled_over_the_bus() {
    let hw = Recorder::default();
    let stage: Stage = Isp::new("isp0", StageKind::Isp.default_config(), hw.hardware())
        .unwrap()
        .into();
    assert_eq!(stage.kind(), StageKind::Isp);
    let input = Arc::new(FrameQueue::new("in", 2));
    let output = Arc::new(FramePool::with_buffers("out", 0, 0x9000_0000, 0x1000, 2));
    stage.driver().attach_source(0, input.clone()).unwrap();
    stage.driver().attach_sink(0, output.clone()).unwrap();

    let registry = BusRegistry::new(BusConfig::default()).unwrap();
    stage
        .bind(&registry, BindRecord::new(0x40, Direction::DownToUp))
        .unwrap();
    let notices = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&notices);
    let (service, _) = registry
        .register(
            BindRecord::new(0x40, Direction::UpToDown),
            move |msg: &Message<'_>, _: &mut ReplyWriter<'_>| {
                if let Some(cmd) = msg.command() {
                    log.lock().unwrap().push(cmd);
                }
                0
            },
        )
        .unwrap();
    let endpoint = stage.driver().endpoint().unwrap();

    service.post(Command::SetState(StageState::Started)).unwrap();
    endpoint.deliver().unwrap();
    assert_eq!(stage.driver().state(0).unwrap(), FrameState::Starting);

    input.enqueue_filled(filled(1));
    stage.driver().on_interrupt(IrqStatus::frame_end(0)).unwrap();
    service.deliver().unwrap();
    {
        let notices = notices.lock().unwrap();
        assert!(notices.iter().any(|c| matches!(c, Command::Schedule { unit: 0, .. })));
        assert!(notices.contains(&Command::FrameDone {
            instance: 0,
            sequence: 1,
            dropped: false
        }));
    }

    // Reset drops nothing here: the frame already completed.
    service.post(Command::ResetControl).unwrap();
    service.post(Command::SetState(StageState::Stopped)).unwrap();
    endpoint.deliver().unwrap();
    assert_eq!(stage.driver().state(0).unwrap(), FrameState::Stopped);
    assert_eq!(output.stats().dropped, 0);
    assert_eq!(output.produced_count(), 1);
}
