//! TCP server: one lifetime, one debugger.

mod commands;
mod transport;

pub use commands::Session;
pub use transport::PacketCodec;

use crate::error::Error;
use log::info;
use nix::sys::socket::{self, sockopt::ReuseAddr, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage};
use std::io::BufReader;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::AsRawFd;

pub struct GdbServer {
    listener: TcpListener,
}

impl GdbServer {
    /// Resolve `hostname:port` and listen on the first address it yields.
    /// The socket takes SO_REUSEADDR so a crashed session's port can be
    /// rebound immediately.
    pub fn bind(hostname: &str, port: u16) -> Result<Self, Error> {
        let addr = (hostname, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::AddrNotAvailable,
                    format!("{hostname} does not resolve"),
                ))
            })?;

        let family = match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        };
        let fd = socket::socket(family, SockType::Stream, SockFlag::empty(), None)?;
        socket::setsockopt(&fd, ReuseAddr, &true)?;
        socket::bind(fd.as_raw_fd(), &SockaddrStorage::from(addr))?;
        socket::listen(&fd, Backlog::new(1)?)?;

        Ok(GdbServer {
            listener: TcpListener::from(fd),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept exactly one debugger and serve it until it detaches, kills
    /// the session, or drops the connection. Both sockets close on return.
    pub fn serve(self, session: &mut Session) -> Result<(), Error> {
        let (stream, peer) = self.listener.accept()?;
        info!(target: "server", "debugger connected from {peer}");
        stream.set_nodelay(true)?;

        let reader = BufReader::new(stream.try_clone()?);
        let mut codec = PacketCodec::new(reader, stream);

        while session.running() {
            match codec.recv() {
                Ok(Some(payload)) => {
                    let reply = session.handle(&payload);
                    // NoAck takes effect for the packets after the OK.
                    codec.set_ack_mode(!session.noack_mode());
                    codec.send(&reply)?;
                }
                // Bad checksum: the nak is out, wait for the retransmit.
                Ok(None) => continue,
                Err(Error::ConnectionClosed) => {
                    info!(target: "server", "debugger disconnected");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        info!(target: "server", "session finished");
        Ok(())
    }
}
