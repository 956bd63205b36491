use std::{
    io::{self, BufReader},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use log::{debug, error, info, warn};
use thiserror::Error;

use super::{events::StreamEvents, session::Session, tuple::Stream};
use crate::utilities::isolate;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("endpoint I/O error: {0}")]
    Io(#[from] io::Error),
}

/// TCP listener accepting OML client connections.
///
/// Every accepted connection is served by its own thread running a
/// [`Session`]; a failing session never affects the others.
pub struct Endpoint {
    listener: TcpListener,
    address: SocketAddr,
    events: StreamEvents,
    running: Arc<AtomicBool>,
}

/// Handle used to stop a listening [`Endpoint`] from another thread.
#[derive(Debug, Clone)]
pub struct EndpointHandle {
    address: SocketAddr,
    running: Arc<AtomicBool>,
}

impl Endpoint {
    pub fn bind(address: impl ToSocketAddrs) -> Result<Self, EndpointError> {
        let listener = TcpListener::bind(address)?;
        let address = listener.local_addr()?;
        Ok(Self {
            listener,
            address,
            events: StreamEvents::new(),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn events(&self) -> &StreamEvents {
        &self.events
    }

    /// Registers `f` to be called whenever a client declares a new stream.
    pub fn on_new_stream<F>(&self, key: impl Into<String>, f: F)
    where
        F: Fn(&str, &Stream) + Send + Sync + 'static,
    {
        self.events.on_new_stream(key, f);
    }

    pub fn remove_stream_observer(&self, key: &str) -> bool {
        self.events.remove(key)
    }

    pub fn handle(&self) -> EndpointHandle {
        EndpointHandle {
            address: self.address,
            running: Arc::clone(&self.running),
        }
    }

    /// Accepts connections until stopped through an [`EndpointHandle`].
    pub fn listen(self) -> Result<(), EndpointError> {
        info!("listening for OML clients at {}", self.address);

        for stream in self.listener.incoming() {
            if !self.running.load(Ordering::Acquire) {
                break;
            }
            match stream {
                Ok(stream) => self.accept(stream),
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        info!("endpoint {} stopped", self.address);
        Ok(())
    }

    /// Runs [`Endpoint::listen`] on a background thread.
    pub fn spawn(
        self,
    ) -> Result<(EndpointHandle, thread::JoinHandle<Result<(), EndpointError>>), EndpointError> {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name("oml-endpoint".into())
            .spawn(move || self.listen())?;
        Ok((handle, join))
    }

    fn accept(&self, stream: TcpStream) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown peer".into());
        let events = self.events.clone();
        let name = format!("oml-session-{peer}");

        let spawned = thread::Builder::new().name(name).spawn(move || {
            debug!("OML client connected: {peer}");
            isolate(&peer, || {
                let mut session = Session::new(events, peer.as_str());
                match session.run(BufReader::new(stream)) {
                    Ok(()) => debug!(
                        "OML client disconnected: {peer} ({} line(s) discarded)",
                        session.discarded()
                    ),
                    Err(e) => error!("[{peer}] session failed: {e}"),
                }
            });
        });
        if let Err(e) = spawned {
            error!("cannot serve connection: {e}");
        }
    }
}

impl EndpointHandle {
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops accepting connections. Sessions already running finish on their own.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        // Wake the accept loop.
        let mut wake = self.address;
        if wake.ip().is_unspecified() {
            let loopback = match wake.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
            };
            wake.set_ip(loopback);
        }
        if let Err(e) = TcpStream::connect(wake) {
            warn!("could not wake endpoint at {wake}: {e}");
        }
    }
}
