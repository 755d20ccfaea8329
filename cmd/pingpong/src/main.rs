//! Ping-pong round-trip example
//!
//! Spawns a listener and a client in one process and bounces a 2-byte
//! frame back and forth a configurable number of times, then prints the
//! round-trip rate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use pktio_channel::{LengthCodec, Listener, Client, Packet};

const PORT: u16 = 9100;

fn frame(id: u8) -> Packet {
    let mut p = Packet::alloc(2);
    p.view_mut().write_u8(0, 2).expect("frame header");
    p.view_mut().write_u8(1, id).expect("frame id");
    p
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let rounds: usize = std::env::args()
        .nth(1)
        .and_then(|n| n.parse().ok())
        .unwrap_or(10_000);

    println!("=== pktio ping-pong: {} rounds ===", rounds);

    let server = std::thread::spawn(move || {
        let mut listener = Listener::new(LengthCodec::u8()).expect("listener setup");
        let stop = listener.stop_handle();
        listener.on_accept(move |chan| {
            chan.on_read(|chan, packet| {
                // Bounce it straight back.
                chan.write(packet);
            });
            let stop = stop.clone();
            chan.on_close(move |_| stop.stop());
        });
        listener.listen("127.0.0.1", PORT)
    });

    // Give the listener a moment to bind.
    std::thread::sleep(std::time::Duration::from_millis(100));

    let completed = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let mut client = Client::new(LengthCodec::u8()).expect("client setup");
    let stop = client.stop_handle();
    {
        let completed = completed.clone();
        client.on_connect(move |chan| {
            let completed = completed.clone();
            chan.on_read(move |chan, _pong| {
                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if done == rounds {
                    chan.close();
                    return;
                }
                chan.write(frame(1));
            });
            let stop = stop.clone();
            chan.on_close(move |_| stop.stop());
            chan.write(frame(1));
        });
    }

    if let Err(err) = client.connect_to("127.0.0.1", PORT) {
        eprintln!("client failed: {}", err);
        std::process::exit(1);
    }
    let elapsed = started.elapsed();
    server.join().expect("server thread").expect("server exit");

    let done = completed.load(Ordering::Relaxed);
    println!(
        "{} round trips in {:?} ({:.0} rt/s)",
        done,
        elapsed,
        done as f64 / elapsed.as_secs_f64()
    );
}
