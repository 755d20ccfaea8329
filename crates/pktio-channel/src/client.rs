//! The client driver: one reactor, one channel, one connection.
//!
//! `connect_to()` starts a nonblocking connect and blocks in the event
//! loop. The connect handler fires on the reactor thread once the
//! handshake completes; register the channel's callbacks inside it. A
//! connect that fails outright is returned as `Err`: no channel callback
//! can have been registered at that point, so there is nobody else to tell.

use std::net::{SocketAddr, SocketAddrV4};

use mio::net::TcpStream;
use mio::Events;
use tracing::debug;

use pktio_core::{Codec, Error, Result};

use crate::channel::{Channel, OUT_BUF_SIZE};
use crate::reactor::{decode, ChannelToken, Reactor, StopHandle, STOP_TOKEN};
use crate::signal;

type ConnectHandler = Box<dyn FnMut(&Channel) + Send>;

pub struct Client<C: Codec> {
    reactor: Reactor<C>,
    codec: C,
    connect_handler: Option<ConnectHandler>,
}

impl<C: Codec> Client<C> {
    pub fn new(codec: C) -> Result<Self> {
        Ok(Self {
            reactor: Reactor::new(OUT_BUF_SIZE)?,
            codec,
            connect_handler: None,
        })
    }

    /// Override the per-CPU egress queue capacity of the channel.
    pub fn out_buf_size(mut self, slots: usize) -> Self {
        self.reactor.out_buf_size = slots;
        self
    }

    /// Handler invoked on the reactor thread once the connection is up.
    pub fn on_connect(&mut self, handler: impl FnMut(&Channel) + Send + 'static) {
        self.connect_handler = Some(Box::new(handler));
    }

    /// Thread-safe stop signal. Grab it before `connect_to()`.
    pub fn stop_handle(&self) -> StopHandle {
        self.reactor.stop_handle()
    }

    /// Connect to `host:port` (IPv4) and run the event loop until stopped.
    pub fn connect_to(&mut self, host: &str, port: u16) -> Result<()> {
        signal::ignore_sigpipe();

        let ip: std::net::Ipv4Addr = host.parse().map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "IPv4 address required",
            ))
        })?;
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, port));

        let stream = TcpStream::connect(addr).map_err(Error::Io)?;
        let _ = stream.set_nodelay(true);
        let (slot, _chan) = self.reactor.add_channel(stream, self.codec.clone(), true)?;
        debug!(host, port, "connecting");
        self.run(slot)
    }

    fn run(&mut self, slot: usize) -> Result<()> {
        let mut events = Events::with_capacity(256);
        loop {
            self.reactor.poll_events(&mut events)?;
            for event in events.iter() {
                match event.token() {
                    STOP_TOKEN => {
                        self.reactor.drain_stop();
                        // Close the channel, then exit the loop.
                        self.reactor.close_channel(slot);
                        debug!("client stopped");
                        return Ok(());
                    }
                    token => {
                        let own_socket = decode(token)
                            .is_some_and(|(s, kind)| s == slot && kind == ChannelToken::Socket);
                        if own_socket && self.reactor.is_connecting(slot) {
                            match self.reactor.try_finish_connect(slot) {
                                Ok(Some(chan)) => {
                                    self.call_connect(&chan);
                                    // Data may have raced in together with
                                    // the connect completion.
                                    if event.is_readable() {
                                        self.reactor.dispatch(event);
                                    }
                                }
                                Ok(None) => {}
                                Err(err) => {
                                    self.reactor.remove_channel(slot);
                                    return Err(err);
                                }
                            }
                        } else {
                            self.reactor.dispatch(event);
                        }
                    }
                }
            }
        }
    }

    fn call_connect(&mut self, chan: &Channel) {
        if let Some(mut handler) = self.connect_handler.take() {
            handler(chan);
            if self.connect_handler.is_none() {
                self.connect_handler = Some(handler);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pktio_core::LengthCodec;

    #[test]
    fn refused_connect_returns_io_error() {
        // Bind a listener and drop it so the port is known-dead.
        let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = dead.local_addr().unwrap().port();
        drop(dead);

        let mut client = Client::new(LengthCodec::u8()).unwrap().out_buf_size(64);
        client.on_connect(|_| panic!("connected to a dead port"));
        let err = client.connect_to("127.0.0.1", port).unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn bad_host_is_rejected() {
        let mut client = Client::new(LengthCodec::u8()).unwrap();
        assert!(client.connect_to("::1", 1).is_err());
    }
}
