//! A headless render-then-present loop against the in-process backend.
//!
//! Run with: cargo run --example frame_loop

use lucarne::{
    Drawable, IntRect, IntSize, Link, PutTarget, SurfaceFormat, VisualInfo, ensure_shm_image,
};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let (link, server) = Link::in_proc();
    let visual = VisualInfo {
        visual: 0,
        depth: 32,
    };
    let size = IntSize::new(320, 240);
    let window = 0x2a;
    server.create_target(window, size, SurfaceFormat::B8G8R8A8);

    let mut slot = None;
    for frame in 0u32..8 {
        let Some(mut target) = ensure_shm_image(&link, size, &visual, &mut slot) else {
            eprintln!("fast path unavailable, a real caller would fall back here");
            return;
        };

        let shade = 0xff00_0000 | (frame * 0x20) << 16;
        if let Some(pixels) = target.pixels_mut() {
            pixels.fill(shade);
        }
        drop(target);

        let image = slot.as_ref().expect("slot holds the image");
        let dirty = IntRect::new(0, 0, size.width, size.height / (frame as i32 + 1));
        image
            .put(PutTarget::Drawable(Drawable(window)), &[dirty])
            .expect("transfer");
    }

    let ledger = server.ledger();
    println!(
        "frames presented: {} puts, {} attaches, balanced teardown pending drop",
        ledger.puts, ledger.attaches
    );

    drop(slot);
    println!("balanced after drop: {}", server.ledger().balanced());
}
