use super::*;
use ash::vk::Handle;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize};
use std::sync::Barrier;
use std::time::Duration;

use crate::config::LoaderConfig;
use crate::graph::{PipelineVariant, RenderGraph};
use crate::loader::{BackgroundLoader, Task, TaskKind};
use crate::model::ModelHandle;
use crate::testing::{triangle_info, CountingBuilder, Event, HeadlessBackend};

struct Fixture {
    backend: Arc<HeadlessBackend>,
    core: FrameCore<HeadlessBackend>,
    registry: Arc<ModelRegistry>,
    loader: BackgroundLoader,
}

fn fixture(frames_in_flight: usize, images: usize) -> Fixture {
    let backend = Arc::new(HeadlessBackend::new(images));
    let core = FrameCore::new(backend.clone(), frames_in_flight).unwrap();
    let graph = Arc::new(RenderGraph::for_variant(PipelineVariant::Forward));
    let registry = Arc::new(ModelRegistry::new(graph));
    let loader = BackgroundLoader::new(
        registry.clone(),
        Arc::new(CountingBuilder::default()),
        backend.clone(),
        Arc::new(RwLock::new(())),
        LoaderConfig::default(),
    );
    Fixture {
        backend,
        core,
        registry,
        loader,
    }
}

impl Fixture {
    fn add_ready(&self, pass: usize, subpass: usize) -> ModelHandle {
        let handle = self.registry.insert(triangle_info(pass, subpass)).unwrap();
        self.loader
            .enqueue(Task {
                handle,
                kind: TaskKind::Construct,
            })
            .unwrap();
        self.loader.run_pending().unwrap();
        handle
    }

    fn frame(&self) -> FrameOutcome {
        self.core.draw_frame(&self.registry, |_| {}).unwrap()
    }
}

fn draw_events(events: &[Event]) -> Vec<Event> {
    events
        .iter()
        .filter(|e| matches!(e, Event::Draw { .. } | Event::DrawIndexed { .. }))
        .cloned()
        .collect()
}

#[test]
fn test_zero_frames_in_flight_rejected() {
    let backend = Arc::new(HeadlessBackend::new(3));
    assert!(FrameCore::new(backend, 0).is_err());
}

#[test]
fn test_single_triangle_single_draw() {
    let f = fixture(2, 3);
    f.add_ready(0, 0);

    let outcome = f.frame();
    assert!(outcome.presented());
    assert!(!outcome.needs_recreate());

    let events = f.backend.events();
    assert_eq!(
        draw_events(&events),
        vec![Event::Draw {
            count: 3,
            instances: 1
        }]
    );
    assert_eq!(f.backend.presented(), 1);
    assert!(f.backend.violations().is_empty());
}

#[test]
fn test_every_pass_recorded_even_when_empty() {
    let f = fixture(2, 3);
    f.frame();

    let events = f.backend.events();
    let begins = events
        .iter()
        .filter(|e| matches!(e, Event::BeginPass { .. }))
        .count();
    let ends = events.iter().filter(|e| matches!(e, Event::EndPass)).count();
    assert_eq!(begins, f.registry.graph().pass_count());
    assert_eq!(ends, begins);
    assert!(draw_events(&events).is_empty());
}

#[test]
fn test_zero_instances_not_drawn() {
    let f = fixture(2, 3);
    let handle = f.add_ready(0, 0);
    assert!(f.registry.set_instances(handle, 0).unwrap());

    match f.frame() {
        FrameOutcome::Presented { draws, .. } => assert_eq!(draws, 0),
        other => panic!("unexpected outcome {:?}", other),
    }

    f.registry.set_instances(handle, 4).unwrap();
    f.backend.clear_events();
    f.frame();
    assert_eq!(
        draw_events(&f.backend.events()),
        vec![Event::Draw {
            count: 3,
            instances: 4
        }]
    );
}

#[test]
fn test_pending_model_not_drawn() {
    let f = fixture(2, 3);
    f.registry.insert(triangle_info(0, 0)).unwrap();

    match f.frame() {
        FrameOutcome::Presented { draws, .. } => assert_eq!(draws, 0),
        other => panic!("unexpected outcome {:?}", other),
    }
}

/// Per slot: every pool reset follows a wait on that slot's fence with no
/// submission in between.
fn assert_pool_resets_follow_waits(f: &Fixture) {
    let events = f.backend.events();
    for index in 0..f.core.frames_in_flight() {
        let objects = *f.core.lock_slot(index).objects();
        let fence = objects.in_flight.as_raw();
        let pool = objects.command_pool.as_raw();
        let mut waited = true;
        for event in &events {
            match event {
                Event::Submit { fence: submitted, .. } if *submitted == fence => waited = false,
                Event::WaitFence(w) if *w == fence => waited = true,
                Event::ResetPool(p) if *p == pool => assert!(waited, "slot {} pool reset early", index),
                _ => {}
            }
        }
    }
}

#[test]
fn test_fence_waited_before_pool_reset() {
    let f = fixture(2, 3);
    f.add_ready(0, 0);
    for _ in 0..12 {
        assert!(f.frame().presented());
    }
    assert!(f.backend.violations().is_empty());
    assert_pool_resets_follow_waits(&f);
}

#[test]
fn test_slots_rotate() {
    let f = fixture(3, 3);
    let order: Vec<usize> = (0..7).map(|_| f.core.advance_slot()).collect();
    assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
}

#[test]
fn test_slot_lock_single_writer() {
    let f = fixture(2, 3);
    let core = &f.core;
    let holders: Vec<AtomicUsize> = (0..2).map(|_| AtomicUsize::new(0)).collect();
    let max_seen = AtomicUsize::new(0);

    std::thread::scope(|s| {
        for t in 0..8 {
            let holders = &holders;
            let max_seen = &max_seen;
            s.spawn(move || {
                for i in 0..200 {
                    let slot = (t + i) % 2;
                    let _pool = core.lock_slot(slot);
                    let now = holders[slot].fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    std::hint::spin_loop();
                    holders[slot].fetch_sub(1, Ordering::SeqCst);
                }
            });
        }
    });

    assert_eq!(max_seen.load(Ordering::SeqCst), 1);
}

#[test]
fn test_images_get_owner_slots() {
    let f = fixture(2, 3);
    assert!(f.core.image_owners().iter().all(Option::is_none));
    for _ in 0..3 {
        f.frame();
    }
    let owners = f.core.image_owners();
    assert_eq!(owners.len(), 3);
    assert!(owners.iter().all(Option::is_some));

    // Image 0 was rendered by slot 0 and is reused by slot 1
    let slot0 = f.core.lock_slot(0).fence();
    assert_eq!(owners[0], Some(0));
    f.backend.clear_events();
    f.frame();
    f.frame();
    assert!(f
        .backend
        .events()
        .contains(&Event::WaitFence(slot0.as_raw())));
    assert_eq!(f.core.image_owners()[0], Some(1));
}

#[test]
fn test_swapchain_recreation_forgets_owners() {
    let f = fixture(2, 3);
    f.frame();
    f.core.on_swapchain_recreated(4);
    let owners = f.core.image_owners();
    assert_eq!(owners.len(), 4);
    assert!(owners.iter().all(Option::is_none));
}

#[test]
fn test_stale_acquire_skips_frame() {
    let f = fixture(2, 3);
    f.add_ready(0, 0);
    f.backend.fail_acquire(1);

    let outcome = f.frame();
    assert_eq!(outcome, FrameOutcome::Stale);
    assert!(outcome.needs_recreate());
    assert!(!f
        .backend
        .events()
        .iter()
        .any(|e| matches!(e, Event::Submit { .. })));

    // The slot fence was never reset, so the next use doesn't hang
    assert!(f.frame().presented());
    assert!(f.frame().presented());
    assert!(f.backend.violations().is_empty());
}

#[test]
fn test_stale_present_reported() {
    let f = fixture(2, 3);
    f.backend.fail_present(2);
    assert!(f.frame().presented());
    assert_eq!(f.frame(), FrameOutcome::Stale);
    assert!(f.frame().presented());
    assert!(f.backend.violations().is_empty());
}

#[test]
fn test_update_writes_global_uniform() {
    let f = fixture(2, 3);
    let mut seen = Vec::new();
    let outcome = f
        .core
        .draw_frame(&f.registry, |update| {
            seen.push((update.frame_number(), update.image_index()));
            update.set_global(&[0u8; 32]);
        })
        .unwrap();

    let FrameOutcome::Presented { image_index, .. } = outcome else {
        panic!("frame not presented");
    };
    assert_eq!(seen, vec![(0, image_index)]);
    assert!(f.backend.events().contains(&Event::GlobalUniform {
        image: image_index as usize,
        len: 32
    }));
}

#[test]
fn test_model_uniform_lands_in_image_region() {
    let f = fixture(2, 3);
    let handle = f.add_ready(0, 0);
    let payload: Vec<u8> = (0..64).collect();

    let outcome = f
        .core
        .draw_frame(&f.registry, |update| update.set_model(handle, &payload))
        .unwrap();
    let FrameOutcome::Presented { image_index, .. } = outcome else {
        panic!("frame not presented");
    };

    let stored = f
        .registry
        .with_model(handle, |model| {
            model
                .resources()
                .and_then(|r| r.uniforms.as_ref())
                .and_then(|u| u.read(image_index as usize))
                .map(<[u8]>::to_vec)
        })
        .flatten()
        .unwrap();
    assert_eq!(stored, payload);
}

#[test]
fn test_oversized_model_uniform_keeps_frame() {
    let f = fixture(2, 3);
    let handle = f.add_ready(0, 0);
    let outcome = f
        .core
        .draw_frame(&f.registry, |update| update.set_model(handle, &[1u8; 4096]))
        .unwrap();
    assert!(outcome.presented());
}

#[test]
fn test_single_time_blocks_until_done() {
    let f = fixture(2, 3);
    let mut recorded = None;
    f.core
        .submit_single_time(|cmd| {
            recorded = Some(cmd);
            Ok(())
        })
        .unwrap();
    let cmd = recorded.unwrap().as_raw();

    let events = f.backend.events();
    let submit = events
        .iter()
        .position(|e| matches!(e, Event::Submit { cmd: c, .. } if *c == cmd))
        .unwrap();
    let Event::Submit { fence, .. } = events[submit] else {
        unreachable!()
    };
    assert!(events[submit + 1..].contains(&Event::WaitFence(fence)));
    assert!(f.backend.violations().is_empty());
}

#[test]
fn test_single_time_failure_leaves_slot_usable() {
    let f = fixture(1, 3);
    let result = f
        .core
        .submit_single_time(|_| anyhow::bail!("recording failed"));
    assert!(result.is_err());
    assert!(f.frame().presented());
    assert!(f.backend.violations().is_empty());
}

#[test]
fn test_single_time_interleaves_with_frames() {
    let f = fixture(2, 3);
    f.add_ready(0, 0);
    for i in 0..6 {
        if i % 2 == 0 {
            f.core.submit_single_time(|_| Ok(())).unwrap();
        }
        assert!(f.frame().presented());
    }
    assert!(f.backend.violations().is_empty());
}

#[test]
fn test_single_time_on_other_thread_during_frames() {
    let f = fixture(2, 3);
    f.add_ready(0, 0);
    f.backend.set_fence_dwell(Duration::from_micros(20));

    let uploads = std::thread::scope(|s| {
        let core = &f.core;
        let uploader = s.spawn(move || {
            (0..200)
                .map(|_| core.submit_single_time(|_| Ok(())))
                .filter(Result::is_ok)
                .count()
        });

        for _ in 0..200 {
            match f.core.draw_frame(&f.registry, |_| {}) {
                Ok(outcome) => assert!(outcome.presented()),
                Err(e) => panic!("frame failed: {:#}", e),
            }
        }
        uploader.join().unwrap()
    });

    assert_eq!(uploads, 200);
    assert_eq!(f.backend.presented(), 200);
    assert_eq!(f.backend.violations(), Vec::<String>::new());
    assert_pool_resets_follow_waits(&f);
}

#[test]
fn test_image_owner_waited_under_its_slot_lock() {
    let f = fixture(2, 3);
    // slot 0 -> image 0, slot 1 -> image 1, slot 0 -> image 2
    for _ in 0..3 {
        f.frame();
    }
    assert_eq!(f.core.image_owners()[0], Some(0));

    // The next frame runs on slot 1 and lands on image 0, owned by slot 0,
    // which another thread holds.
    let released = AtomicBool::new(false);
    let locked = Barrier::new(2);
    let seen_released = std::thread::scope(|s| {
        let core = &f.core;
        let (released, locked) = (&released, &locked);
        s.spawn(move || {
            let _pool = core.lock_slot(0);
            locked.wait();
            std::thread::sleep(Duration::from_millis(30));
            released.store(true, Ordering::SeqCst);
        });

        locked.wait();
        let mut seen = false;
        let outcome = f
            .core
            .draw_frame(&f.registry, |_| seen = released.load(Ordering::SeqCst))
            .unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Presented {
                image_index: 0,
                draws: 0,
                suboptimal: false
            }
        );
        seen
    });

    assert!(seen_released);
    assert_eq!(f.core.image_owners()[0], Some(1));
}

#[test]
fn test_loader_thread_then_draw() {
    let mut f = fixture(2, 3);
    f.loader.start().unwrap();
    let handle = f.registry.insert(triangle_info(0, 0)).unwrap();
    f.loader
        .enqueue(Task {
            handle,
            kind: TaskKind::Construct,
        })
        .unwrap();
    assert!(f.loader.wait_until_drained(Duration::from_secs(5)));

    match f.frame() {
        FrameOutcome::Presented { draws, .. } => assert_eq!(draws, 1),
        other => panic!("unexpected outcome {:?}", other),
    }
    f.loader.shutdown();
}

#[test]
fn test_drop_destroys_slots() {
    let backend = Arc::new(HeadlessBackend::new(3));
    let core = FrameCore::new(backend.clone(), 3).unwrap();
    drop(core);
    assert_eq!(backend.destroyed_slots(), 3);
    assert!(backend.events().contains(&Event::WaitIdle));
}
