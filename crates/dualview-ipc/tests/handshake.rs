//! Cross-thread exchanges over a real POSIX shared memory mapping.

use dualview_ipc::{
    CacheMode, Command, FilterMode, Flush, Rect, SurfaceId, Transport, TransportConfig,
    TransportError,
};
use std::thread;
use std::time::Duration;

fn test_config(tag: &str, cache: CacheMode) -> TransportConfig {
    TransportConfig {
        shm_name: format!("/dualview-test-{}-{}", std::process::id(), tag),
        cache,
        ..TransportConfig::default()
    }
}

/// Tiny xorshift so polling intervals vary without pulling in an RNG crate.
fn jitter(state: &mut u32) -> Duration {
    *state ^= *state << 13;
    *state ^= *state >> 17;
    *state ^= *state << 5;
    Duration::from_micros((*state % 300) as u64)
}

fn wait_idle(transport: &Transport) {
    while transport.is_busy() {
        thread::sleep(Duration::from_micros(50));
    }
}

fn run_sequence(config: TransportConfig) {
    const COUNT: u32 = 200;

    let mut producer = Transport::create(&config).unwrap();
    let mut consumer = Transport::open(&config).unwrap();

    let reader = thread::spawn(move || {
        let mut seen = Vec::new();
        let mut seed = 0x9E37_79B9;
        loop {
            thread::sleep(jitter(&mut seed));
            let Some(polled) = consumer.poll() else { continue };
            let quit = match polled.unwrap() {
                Command::Flush(flush) => {
                    let tag = u32::from_le_bytes(flush.pixels[..4].try_into().unwrap());
                    assert!(flush.pixels.iter().skip(4).all(|&b| b == tag as u8));
                    seen.push(Some(tag));
                    false
                }
                Command::Flip => {
                    seen.push(None);
                    false
                }
                Command::Quit => true,
            };
            consumer.consume();
            if quit {
                assert!(consumer.is_closed());
                return seen;
            }
        }
    });

    let mut expected = Vec::new();
    for i in 0..COUNT {
        let mut pixels = vec![i as u8; 64 * 48 * 4];
        pixels[..4].copy_from_slice(&i.to_le_bytes());
        let command = Command::Flush(Flush {
            surface: if i % 2 == 0 { SurfaceId::LeftLcd } else { SurfaceId::RightLcd },
            pixels: &pixels,
            src: Rect::new(0, 0, 64, 48),
            dst: Rect::new(0, 0, 320, 240),
            pitch: 64 * 4,
            filter: FilterMode::Nearest,
            alpha: 10,
        });
        wait_idle(&producer);
        producer.publish(&command).unwrap();
        expected.push(Some(i));

        if i % 2 == 1 {
            wait_idle(&producer);
            producer.publish(&Command::Flip).unwrap();
            expected.push(None);
        }
    }

    wait_idle(&producer);
    producer.publish(&Command::Quit).unwrap();
    wait_idle(&producer);

    let seen = reader.join().unwrap();
    assert_eq!(seen, expected);

    assert!(matches!(producer.publish(&Command::Flip), Err(TransportError::Closed)));
    producer.unlink().unwrap();
    assert!(Transport::open(&config).is_err());
}

#[test]
fn test_order_preserved_under_jittered_polling() {
    run_sequence(test_config("coherent", CacheMode::Coherent));
}

#[test]
fn test_order_preserved_with_explicit_cache_maintenance() {
    run_sequence(test_config("flush", CacheMode::Flush));
}

#[test]
fn test_open_before_create_fails() {
    let config = test_config("missing", CacheMode::Coherent);
    assert!(matches!(Transport::open(&config), Err(TransportError::Map(_))));
}
