//! The listener driver: binds, accepts, and hosts one channel per
//! accepted connection on a single reactor thread.
//!
//! `listen()` blocks running the event loop until a [`StopHandle`] fires,
//! then closes the listening socket and returns `Ok(())`. Accept, bind,
//! and listen failures go to the listener-level error handler; they never
//! tear down channels that were already accepted.

use std::io;
use std::os::unix::io::{FromRawFd, RawFd};

use mio::net::TcpListener;
use mio::{Events, Interest};
use tracing::{debug, warn};

use pktio_core::{Codec, Error, Result};

use crate::channel::{Channel, OUT_BUF_SIZE};
use crate::reactor::{Reactor, StopHandle, DRIVER_TOKEN, STOP_TOKEN};
use crate::signal;

/// Accept backlog for the listening socket.
pub const BACKLOG: i32 = 1024;

type AcceptHandler = Box<dyn FnMut(&Channel) + Send>;
type ErrorHandler = Box<dyn FnMut(&Error) + Send>;

pub struct Listener<C: Codec> {
    reactor: Reactor<C>,
    codec: C,
    accept_handler: Option<AcceptHandler>,
    error_handler: Option<ErrorHandler>,
}

impl<C: Codec> Listener<C> {
    /// A listener whose channels all frame with `codec`.
    pub fn new(codec: C) -> Result<Self> {
        Ok(Self {
            reactor: Reactor::new(OUT_BUF_SIZE)?,
            codec,
            accept_handler: None,
            error_handler: None,
        })
    }

    /// Override the per-CPU egress queue capacity of accepted channels.
    pub fn out_buf_size(mut self, slots: usize) -> Self {
        self.reactor.out_buf_size = slots;
        self
    }

    /// Handler invoked on the reactor thread with each accepted channel.
    /// Register the channel's own callbacks inside it, before returning.
    pub fn on_accept(&mut self, handler: impl FnMut(&Channel) + Send + 'static) {
        self.accept_handler = Some(Box::new(handler));
    }

    /// Listener-level error channel: bind, listen, and accept failures.
    pub fn on_error(&mut self, handler: impl FnMut(&Error) + Send + 'static) {
        self.error_handler = Some(Box::new(handler));
    }

    /// Thread-safe stop signal. Grab it before `listen()`.
    pub fn stop_handle(&self) -> StopHandle {
        self.reactor.stop_handle()
    }

    /// Bind `host:port` (IPv4) and run the event loop until stopped.
    pub fn listen(&mut self, host: &str, port: u16) -> Result<()> {
        // The reactor does not mask SIGPIPE for us on Linux.
        signal::ignore_sigpipe();

        let fd = match bind_socket(host, port, BACKLOG) {
            Ok(fd) => fd,
            Err(err) => {
                let err = Error::Io(err);
                self.call_error(&err);
                return Err(err);
            }
        };
        // Safety: bind_socket just created this fd; ownership moves here.
        let mut sock = unsafe { TcpListener::from_raw_fd(fd) };
        self.reactor
            .poll
            .registry()
            .register(&mut sock, DRIVER_TOKEN, Interest::READABLE)?;
        debug!(host, port, "listening");
        self.run(sock)
    }

    fn run(&mut self, mut sock: TcpListener) -> Result<()> {
        let mut events = Events::with_capacity(256);
        loop {
            self.reactor.poll_events(&mut events)?;
            for event in events.iter() {
                match event.token() {
                    STOP_TOKEN => {
                        self.reactor.drain_stop();
                        debug!("listener stopped");
                        // Returning drops `sock`: the listening socket
                        // closes before the loop exits.
                        return Ok(());
                    }
                    DRIVER_TOKEN => self.accept_ready(&mut sock),
                    _ => self.reactor.dispatch(event),
                }
            }
        }
    }

    fn accept_ready(&mut self, sock: &mut TcpListener) {
        loop {
            match sock.accept() {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    match self.reactor.add_channel(stream, self.codec.clone(), false) {
                        Ok((_slot, chan)) => {
                            debug!(channel = chan.id(), %peer, "accepted");
                            self.call_accept(&chan);
                        }
                        Err(err) => {
                            warn!(error = %err, "failed to register accepted socket");
                            self.call_error(&Error::Io(err));
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    self.call_error(&Error::Io(err));
                    break;
                }
            }
        }
    }

    fn call_accept(&mut self, chan: &Channel) {
        if let Some(mut handler) = self.accept_handler.take() {
            handler(chan);
            if self.accept_handler.is_none() {
                self.accept_handler = Some(handler);
            }
        }
    }

    fn call_error(&mut self, err: &Error) {
        if let Some(mut handler) = self.error_handler.take() {
            handler(err);
            if self.error_handler.is_none() {
                self.error_handler = Some(handler);
            }
        }
    }
}

/// Raw listening-socket setup: explicit fd, `SO_REUSEADDR`, nonblocking,
/// cloexec, and a real backlog value (std's bind hardcodes its own).
fn bind_socket(host: &str, port: u16, backlog: i32) -> io::Result<RawFd> {
    let ip: std::net::Ipv4Addr = host
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "IPv4 address required"))?;

    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        let opt: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &opt as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(ip).to_be();

    let rc = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let rc = unsafe { libc::listen(fd, backlog) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use pktio_core::{LengthCodec, Packet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const HOST: &str = "127.0.0.1";

    fn frame(id: u8) -> Packet {
        let mut p = Packet::alloc(2);
        p.view_mut().write_u8(0, 2).unwrap();
        p.view_mut().write_u8(1, id).unwrap();
        p
    }

    fn id_of(p: &Packet) -> u8 {
        p.view().read_u8(1).unwrap()
    }

    /// Run a client against `port`, retrying while the listener is still
    /// coming up. Returns the client loop's exit result.
    fn run_client<F>(port: u16, configure: F) -> Result<()>
    where
        F: Fn(&mut Client<LengthCodec>) + Send + 'static,
    {
        let mut last = Ok(());
        for _ in 0..100 {
            let mut client = Client::new(LengthCodec::u8()).unwrap().out_buf_size(1024);
            configure(&mut client);
            match client.connect_to(HOST, port) {
                Err(Error::Io(ref e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    thread::sleep(Duration::from_millis(20));
                    last = Err(Error::Io(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "listener never came up",
                    )));
                }
                other => return other,
            }
        }
        last
    }

    #[test]
    fn ping_pong() {
        const PORT: u16 = 22223;
        const PING: u8 = 1;
        const PONG: u8 = 2;

        let server_error = Arc::new(AtomicBool::new(false));

        let listener_thread = {
            let server_error = server_error.clone();
            thread::spawn(move || {
                let mut listener = Listener::new(LengthCodec::u8())
                    .unwrap()
                    .out_buf_size(1024);
                let stop = listener.stop_handle();
                let expected = Arc::new(AtomicUsize::new(PING as usize));
                listener.on_accept(move |chan| {
                    let expected = expected.clone();
                    let stop_read = stop.clone();
                    chan.on_read(move |chan, ping| {
                        let want = expected.load(Ordering::SeqCst) as u8;
                        assert_eq!(want, id_of(&ping));
                        if want == PONG {
                            chan.close();
                            return;
                        }
                        expected.store(PONG as usize, Ordering::SeqCst);
                        chan.write(frame(PONG));
                    });
                    let server_error = server_error.clone();
                    chan.on_error(move |_| server_error.store(true, Ordering::SeqCst));
                    chan.on_close(move |_| stop_read.stop());
                });
                listener.listen(HOST, PORT)
            })
        };

        let client_result = run_client(PORT, |client| {
            let stop = client.stop_handle();
            client.on_connect(move |chan| {
                let stop = stop.clone();
                chan.on_read(move |chan, pong| {
                    assert_eq!(PONG, id_of(&pong));
                    chan.write(frame(PONG));
                });
                chan.on_close(move |_| stop.stop());
                chan.write(frame(PING));
            });
        });

        assert!(client_result.is_ok(), "client: {:?}", client_result);
        let listener_result = listener_thread.join().unwrap();
        assert!(listener_result.is_ok(), "listener: {:?}", listener_result);
        assert!(
            !server_error.load(Ordering::SeqCst),
            "server error handler fired"
        );
    }

    #[test]
    fn reliable_messaging() {
        const PORT: u16 = 22224;
        const MAX_ID: u8 = 10;

        let server_seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let client_seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let listener_thread = {
            let server_seen = server_seen.clone();
            thread::spawn(move || {
                let mut listener = Listener::new(LengthCodec::u8())
                    .unwrap()
                    .out_buf_size(1024);
                let stop = listener.stop_handle();
                listener.on_accept(move |chan| {
                    let server_seen = server_seen.clone();
                    chan.on_read(move |chan, message| {
                        let id = id_of(&message);
                        server_seen.lock().push(id);
                        chan.write(frame(id));
                    });
                    let stop = stop.clone();
                    chan.on_close(move |_| stop.stop());
                });
                listener.listen(HOST, PORT)
            })
        };

        let client_result = {
            let client_seen = client_seen.clone();
            run_client(PORT, move |client| {
                let stop = client.stop_handle();
                let client_seen = client_seen.clone();
                client.on_connect(move |chan| {
                    let client_seen = client_seen.clone();
                    chan.on_read(move |chan, message| {
                        let id = id_of(&message);
                        client_seen.lock().push(id);
                        if id == MAX_ID {
                            chan.close();
                            return;
                        }
                        chan.write(frame(id + 1));
                    });
                    let stop = stop.clone();
                    chan.on_close(move |_| stop.stop());
                    chan.write(frame(0));
                });
            })
        };

        assert!(client_result.is_ok(), "client: {:?}", client_result);
        assert!(listener_thread.join().unwrap().is_ok());

        let want: Vec<u8> = (0..=MAX_ID).collect();
        assert_eq!(&*server_seen.lock(), &want);
        assert_eq!(&*client_seen.lock(), &want);
    }

    #[test]
    fn server_close_surfaces_as_client_error() {
        const PORT: u16 = 22222;

        let client_error = Arc::new(AtomicBool::new(false));

        let listener_thread = thread::spawn(move || {
            let mut listener = Listener::new(LengthCodec::u8())
                .unwrap()
                .out_buf_size(1024);
            let stop = listener.stop_handle();
            listener.on_accept(move |chan| {
                chan.close();
                stop.stop();
            });
            listener.listen(HOST, PORT)
        });

        let client_result = {
            let client_error = client_error.clone();
            run_client(PORT, move |client| {
                let stop = client.stop_handle();
                let client_error = client_error.clone();
                client.on_connect(move |chan| {
                    let stop = stop.clone();
                    let client_error = client_error.clone();
                    chan.on_error(move |_| {
                        client_error.store(true, Ordering::SeqCst);
                        stop.stop();
                    });
                });
            })
        };

        assert!(client_result.is_ok(), "client: {:?}", client_result);
        assert!(listener_thread.join().unwrap().is_ok());
        assert!(client_error.load(Ordering::SeqCst));
    }

    #[test]
    fn bind_rejects_garbage_host() {
        let mut listener = Listener::new(LengthCodec::u8()).unwrap();
        let errors = Arc::new(AtomicUsize::new(0));
        {
            let errors = errors.clone();
            listener.on_error(move |_| {
                errors.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(listener.listen("not-an-address", 0).is_err());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }
}
