//! Reactor plumbing shared by the listener and client drivers.
//!
//! A driver owns one [`Reactor`]: a mio poll, the table of live channels,
//! and the stop-wake handle. All callbacks run on the thread that drives
//! the poll loop.
//!
//! # Token space
//!
//! Token 0 is the stop wake, token 1 the driver's own socket (the listening
//! socket, for a listener). Every channel occupies three consecutive
//! tokens: its stream, its write-wake eventfd, and its close-wake eventfd.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use tracing::debug;

use pktio_core::{Codec, Result};

use crate::channel::{Channel, ChannelIo};
use crate::wake::WakeFd;

pub(crate) const STOP_TOKEN: Token = Token(0);
pub(crate) const DRIVER_TOKEN: Token = Token(1);

const CHANNEL_TOKEN_BASE: usize = 2;
const TOKENS_PER_CHANNEL: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelToken {
    Socket,
    WriteWake,
    CloseWake,
}

fn tokens_for(slot: usize) -> (Token, Token, Token) {
    let base = CHANNEL_TOKEN_BASE + slot * TOKENS_PER_CHANNEL;
    (Token(base), Token(base + 1), Token(base + 2))
}

pub(crate) fn decode(token: Token) -> Option<(usize, ChannelToken)> {
    let raw = token.0.checked_sub(CHANNEL_TOKEN_BASE)?;
    let slot = raw / TOKENS_PER_CHANNEL;
    let kind = match raw % TOKENS_PER_CHANNEL {
        0 => ChannelToken::Socket,
        1 => ChannelToken::WriteWake,
        _ => ChannelToken::CloseWake,
    };
    Some((slot, kind))
}

/// Thread-safe stop signal for a running driver. Cloneable and callable
/// from any thread, including from inside driver callbacks.
#[derive(Clone)]
pub struct StopHandle {
    wake: Arc<WakeFd>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.wake.wake();
    }
}

pub(crate) struct Reactor<C: Codec> {
    pub(crate) poll: Poll,
    stop_wake: Arc<WakeFd>,
    channels: HashMap<usize, ChannelIo<C>>,
    next_slot: usize,
    pub(crate) out_buf_size: usize,
}

impl<C: Codec> Reactor<C> {
    pub(crate) fn new(out_buf_size: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let stop_wake = Arc::new(WakeFd::new()?);
        poll.registry()
            .register(&mut SourceFd(&stop_wake.fd()), STOP_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            stop_wake,
            channels: HashMap::new(),
            next_slot: 0,
            out_buf_size,
        })
    }

    pub(crate) fn stop_handle(&self) -> StopHandle {
        StopHandle {
            wake: self.stop_wake.clone(),
        }
    }

    pub(crate) fn drain_stop(&self) {
        self.stop_wake.drain();
    }

    /// Poll once, retrying interrupted syscalls.
    pub(crate) fn poll_events(&mut self, events: &mut Events) -> io::Result<()> {
        loop {
            match self.poll.poll(events, None) {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Register a socket as a new channel: three tokens, two eventfds, one
    /// table entry holding the reactor's reference to the channel.
    pub(crate) fn add_channel(
        &mut self,
        mut stream: mio::net::TcpStream,
        codec: C,
        connecting: bool,
    ) -> io::Result<(usize, Channel)> {
        let slot = self.next_slot;
        self.next_slot += 1;
        let (sock_token, write_token, close_token) = tokens_for(slot);

        let chan = Channel::new(self.out_buf_size)?;

        let interest = if connecting {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let registry = self.poll.registry();
        registry.register(&mut stream, sock_token, interest)?;
        registry.register(
            &mut SourceFd(&chan.shared.write_wake.fd()),
            write_token,
            Interest::READABLE,
        )?;
        registry.register(
            &mut SourceFd(&chan.shared.close_wake.fd()),
            close_token,
            Interest::READABLE,
        )?;

        debug!(channel = chan.id(), slot, "channel registered");
        let io = ChannelIo::new(stream, chan.clone(), codec, connecting);
        self.channels.insert(slot, io);
        Ok((slot, chan))
    }

    pub(crate) fn is_connecting(&self, slot: usize) -> bool {
        self.channels.get(&slot).is_some_and(|io| io.connecting)
    }

    /// Try to complete a nonblocking connect. `Ok(None)` means the socket
    /// is not connected yet (spurious wakeup); `Ok(Some)` hands back the
    /// channel with the socket reregistered for reads only.
    pub(crate) fn try_finish_connect(&mut self, slot: usize) -> Result<Option<Channel>> {
        let (sock_token, _, _) = tokens_for(slot);
        let Some(io) = self.channels.get_mut(&slot) else {
            return Ok(None);
        };
        if !io.connecting {
            return Ok(None);
        }

        if let Some(err) = io.stream.take_error()? {
            return Err(err.into());
        }
        match io.stream.peer_addr() {
            Ok(_) => {}
            Err(ref e) if e.kind() == io::ErrorKind::NotConnected => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        io.connecting = false;
        self.poll
            .registry()
            .reregister(&mut io.stream, sock_token, Interest::READABLE)?;
        debug!(channel = io.chan().id(), "connect completed");
        Ok(Some(io.chan().clone()))
    }

    /// Route a channel event to the owning `ChannelIo`.
    pub(crate) fn dispatch(&mut self, event: &Event) {
        let Some((slot, kind)) = decode(event.token()) else {
            return;
        };
        match kind {
            ChannelToken::Socket => {
                if event.is_readable() {
                    self.socket_readable(slot);
                }
            }
            ChannelToken::WriteWake => self.write_wake(slot),
            ChannelToken::CloseWake => self.close_wake(slot),
        }
    }

    fn socket_readable(&mut self, slot: usize) {
        let failed = match self.channels.get_mut(&slot) {
            Some(io) => {
                if io.connecting || io.chan().is_closed() {
                    // Reads racing a close are dropped; the close wake will
                    // reap the channel.
                    return;
                }
                match io.on_readable() {
                    Ok(()) => false,
                    Err(err) => {
                        io.fail(&err);
                        true
                    }
                }
            }
            None => return,
        };
        if failed {
            self.remove_channel(slot);
        }
    }

    fn write_wake(&mut self, slot: usize) {
        if let Some(io) = self.channels.get_mut(&slot) {
            io.handle_write_wake();
        }
    }

    fn close_wake(&mut self, slot: usize) {
        if let Some(io) = self.channels.get_mut(&slot) {
            io.chan().shared.close_wake.drain();
            io.finish_close();
        }
        self.remove_channel(slot);
    }

    /// Close a channel from the driver itself (client stop path).
    pub(crate) fn close_channel(&mut self, slot: usize) {
        if let Some(io) = self.channels.get_mut(&slot) {
            io.finish_close();
        }
        self.remove_channel(slot);
    }

    /// Deregister and drop a channel's reactor state. Dropping the table
    /// entry releases the reactor's reference; the channel itself dies when
    /// the last user handle goes.
    pub(crate) fn remove_channel(&mut self, slot: usize) {
        if let Some(mut io) = self.channels.remove(&slot) {
            let registry = self.poll.registry();
            let _ = registry.deregister(&mut io.stream);
            let write_fd = io.chan().shared.write_wake.fd();
            let close_fd = io.chan().shared.close_wake.fd();
            let _ = registry.deregister(&mut SourceFd(&write_fd));
            let _ = registry.deregister(&mut SourceFd(&close_fd));
            debug!(channel = io.chan().id(), slot, "channel removed");
        }
    }
}
