//! Cross-thread create/drop stress.
//!
//! Images are built on the driving thread and their final handles are
//! dropped on worker threads, so teardown (detach, then segment release)
//! runs away from the creating thread. Backends with a ledger can then
//! assert that every attach was balanced by exactly one detach.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;

use lucarne::{IntSize, Link, ShmImage, VisualInfo, ensure_shm_image};

pub struct StressConfig {
    /// Worker threads receiving image handles to drop.
    pub droppers: usize,
    /// Frames to drive through the factory.
    pub frames: usize,
    /// Sizes cycled frame by frame. Repeats exercise the reuse path;
    /// changes exercise retire-and-replace.
    pub sizes: Vec<IntSize>,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            droppers: 4,
            frames: 200,
            sizes: vec![
                IntSize::new(64, 64),
                IntSize::new(64, 64),
                IntSize::new(128, 96),
                IntSize::new(33, 17),
            ],
        }
    }
}

pub struct StressReport {
    /// Distinct instances the factory built.
    pub built: usize,
}

/// Drive `frames` factory calls, shipping each frame's image handle to a
/// dropper thread. Panics if the link refuses a frame; backends under
/// stress are expected to be healthy.
pub fn stress_create_drop(
    link: &Link,
    visual: &VisualInfo,
    config: &StressConfig,
) -> StressReport {
    assert!(!config.sizes.is_empty(), "stress needs at least one size");

    let mut handles = Vec::new();
    let mut senders = Vec::new();
    for _ in 0..config.droppers.max(1) {
        let (tx, rx) = mpsc::channel::<Arc<ShmImage>>();
        senders.push(tx);
        handles.push(thread::spawn(move || {
            // Hold a small window of handles so the final drop regularly
            // happens here rather than on the driving thread.
            let mut held: VecDeque<Arc<ShmImage>> = VecDeque::new();
            while let Ok(image) = rx.recv() {
                held.push_back(image);
                if held.len() > 8 {
                    held.pop_front();
                }
            }
        }));
    }

    let mut slot: Option<Arc<ShmImage>> = None;
    let mut previous: Option<Arc<ShmImage>> = None;
    let mut built = 0;
    for frame in 0..config.frames {
        let size = config.sizes[frame % config.sizes.len()];
        let target = ensure_shm_image(link, size, visual, &mut slot)
            .expect("stress link refused a shared image");
        drop(target);

        let image = slot.as_ref().expect("slot holds the image on success");
        if previous
            .as_ref()
            .is_none_or(|p| !Arc::ptr_eq(p, image))
        {
            built += 1;
        }
        previous = Some(Arc::clone(image));
        senders[frame % senders.len()].send(Arc::clone(image)).ok();
    }

    drop(slot);
    drop(previous);
    drop(senders);
    for handle in handles {
        handle.join().expect("dropper thread panicked");
    }

    StressReport { built }
}
