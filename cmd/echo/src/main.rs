//! Echo server example
//!
//! Every received frame is written straight back on the same channel.
//! The arena handle rides along, so the echo never copies payload bytes.
//!
//! Frames are `{u8 total_len, payload…}`. Try it with:
//!
//! ```text
//! RUST_LOG=debug cargo run -p echo -- 9000
//! printf '\x05ping' | nc 127.0.0.1 9000 | xxd
//! ```

use pktio_channel::{LengthCodec, Listener};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(9000);

    let mut listener = Listener::new(LengthCodec::u8()).expect("listener setup failed");
    let stop = listener.stop_handle();

    listener.on_accept(|chan| {
        println!("[echo] channel {} connected", chan.id());
        chan.on_read(|chan, packet| {
            chan.write(packet);
        });
        chan.on_close(|chan| {
            println!("[echo] channel {} closed", chan.id());
        });
    });

    listener.on_error(move |err| {
        eprintln!("[echo] listener error: {}", err);
        stop.stop();
    });

    println!("[echo] listening on 127.0.0.1:{} (ctrl-c to quit)", port);
    if let Err(err) = listener.listen("127.0.0.1", port) {
        eprintln!("[echo] exited with error: {}", err);
        std::process::exit(1);
    }
}
