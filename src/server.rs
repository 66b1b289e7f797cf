// Copyright 2020 Joyent, Inc.

use std::io;

use chrono::Utc;
use derive_more::Display;
use socket2::{SockAddr, Socket};

use crate::config::ClientConfig;
use crate::error::{ConnectError, ErrorKind};
use crate::resolver::Candidate;

/// The concatenation of a server's hostname and port with a colon delimiter.
/// This is a type alias for String.
pub type ServerName = String;

/// The transport used to reach a server.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum Transport {
    #[display(fmt = "tcp")]
    Tcp,
    #[display(fmt = "udp")]
    Udp,
    #[display(fmt = "unix")]
    UnixSocket,
}

/// Connection lifecycle state of a server instance.
///
/// The states are ordered; the network connector compares against
/// `InProgress` on its timeout return path.
#[derive(Clone, Copy, Debug, Display, Eq, Ord, PartialEq, PartialOrd)]
pub enum ServerState {
    #[display(fmt = "new")]
    New,
    #[display(fmt = "addrinfo-ready")]
    AddrInfoReady,
    #[display(fmt = "in-progress")]
    InProgress,
    #[display(fmt = "connected")]
    Connected,
    #[display(fmt = "in-timeout")]
    InTimeout,
}

/// Counters of time spent waiting on the network.
#[derive(Clone, Copy, Debug, Default)]
pub struct IoWaitCount {
    /// Readiness polls that hit their deadline.
    pub timeouts: u64,
}

/// A single server endpoint and the connect-side state attached to it.
///
/// Instances are created by the server-list registry and handed to
/// [`Client`](crate::client::Client) to connect. The connect subsystem
/// mutates the socket handle, resolved-address list, lifecycle state,
/// failure accounting, and error slot; it never destroys the instance.
#[derive(Debug)]
pub struct Server {
    pub(crate) transport: Transport,
    pub(crate) hostname: String,
    pub(crate) ipaddress: Option<String>,
    pub(crate) port: u16,
    pub(crate) socket: Option<Socket>,
    pub(crate) candidates: Option<Vec<Candidate>>,
    pub(crate) cursor: usize,
    pub(crate) state: ServerState,
    pub(crate) server_failure_counter: u32,
    pub(crate) next_retry: i64,
    pub(crate) io_wait_count: IoWaitCount,
    pub(crate) error: Option<ConnectError>,
}

impl Server {
    /// Create a server instance for a hostname (or textual IP) and port.
    ///
    /// A hostname beginning with `/` is taken to be a Unix socket path.
    pub fn new(hostname: impl Into<String>, port: u16) -> Self {
        let hostname = hostname.into();
        let transport = if hostname.starts_with('/') {
            Transport::UnixSocket
        } else {
            Transport::Tcp
        };
        Server::with_transport(hostname, port, transport)
    }

    /// Create a server instance reached over the datagram transport.
    pub fn udp(hostname: impl Into<String>, port: u16) -> Self {
        Server::with_transport(hostname.into(), port, Transport::Udp)
    }

    fn with_transport(hostname: String, port: u16, transport: Transport) -> Self {
        Server {
            transport,
            hostname,
            ipaddress: None,
            port,
            socket: None,
            candidates: None,
            cursor: 0,
            state: ServerState::New,
            server_failure_counter: 0,
            next_retry: 0,
            io_wait_count: IoWaitCount::default(),
            error: None,
        }
    }

    /// Install a pre-resolved IP address. When set, lookups use it instead
    /// of the hostname.
    pub fn with_ipaddress(mut self, ipaddress: impl Into<String>) -> Self {
        self.ipaddress = Some(ipaddress.into());
        self
    }

    /// `hostname:port` identity of this server.
    pub fn name(&self) -> ServerName {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn transport(&self) -> Transport {
        self.transport
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// The established socket, if any.
    pub fn socket(&self) -> Option<&Socket> {
        self.socket.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Count of consecutive connect failures since the last success.
    pub fn failure_count(&self) -> u32 {
        self.server_failure_counter
    }

    /// Wall-clock second at which a failed server may be retried.
    pub fn next_retry(&self) -> i64 {
        self.next_retry
    }

    pub fn io_wait_count(&self) -> &IoWaitCount {
        &self.io_wait_count
    }

    /// The error recorded by the most recent connect attempt, if it failed.
    pub fn error(&self) -> Option<&ConnectError> {
        self.error.as_ref()
    }

    /// Reset the failure accounting after a successful connect.
    pub fn mark_clean(&mut self) {
        self.server_failure_counter = 0;
        self.next_retry = 0;
    }

    /// Flip the server toward its timeout state after a failed connect.
    ///
    /// No-op when the server is already in timeout, so repeated failures in
    /// one cooldown window count once.
    pub fn mark_for_timeout(&mut self, config: &ClientConfig) {
        if self.state != ServerState::InTimeout {
            self.next_retry = Utc::now().timestamp() + config.retry_timeout;
            self.state = ServerState::InTimeout;
            self.server_failure_counter += 1;
        }
    }

    /// Drop the socket handle, returning the instance to the invalid
    /// sentinel. Any errno of interest must be captured before this call.
    pub(crate) fn close_socket(&mut self) {
        self.socket = None;
    }

    pub(crate) fn candidates_exhausted(&self) -> bool {
        match &self.candidates {
            Some(candidates) => self.cursor >= candidates.len(),
            None => true,
        }
    }

    pub(crate) fn connect_socket(&self, addr: &SockAddr) -> io::Result<()> {
        match &self.socket {
            Some(socket) => socket.connect(addr),
            None => Err(io::Error::from_raw_os_error(libc::EBADF)),
        }
    }

    /// Record an error of the given kind on the instance and return it.
    #[track_caller]
    pub(crate) fn set_error(&mut self, kind: ErrorKind) -> ConnectError {
        let err = ConnectError::new(kind);
        self.error = Some(err.clone());
        err
    }

    #[track_caller]
    pub(crate) fn set_error_message(
        &mut self,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> ConnectError {
        let err = ConnectError::new(kind).with_message(message);
        self.error = Some(err.clone());
        err
    }

    /// Record an errno-carrying system error on the instance and return it.
    #[track_caller]
    pub(crate) fn set_errno(&mut self, errno: i32) -> ConnectError {
        let err = ConnectError::new(ErrorKind::SystemError).with_errno(errno);
        self.error = Some(err.clone());
        err
    }

    #[track_caller]
    pub(crate) fn set_errno_message(
        &mut self,
        errno: i32,
        message: impl Into<String>,
    ) -> ConnectError {
        let err = ConnectError::new(ErrorKind::SystemError)
            .with_errno(errno)
            .with_message(message);
        self.error = Some(err.clone());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_transport_inferred_from_path() {
        let server = Server::new("/var/run/cache.sock", 0);
        assert_eq!(server.transport(), Transport::UnixSocket);

        let server = Server::new("cache-1.example.com", 11211);
        assert_eq!(server.transport(), Transport::Tcp);
    }

    #[test]
    fn name_concatenates_host_and_port() {
        let server = Server::new("10.0.0.1", 11211);
        assert_eq!(server.name(), "10.0.0.1:11211");
    }

    #[test]
    fn mark_for_timeout_counts_once_per_window() {
        let config = ClientConfig::default();
        let mut server = Server::new("10.0.0.1", 11211);

        server.mark_for_timeout(&config);
        assert_eq!(server.state(), ServerState::InTimeout);
        assert_eq!(server.failure_count(), 1);
        assert!(server.next_retry() > 0);

        // Already in timeout; the counter must not move again.
        server.mark_for_timeout(&config);
        assert_eq!(server.failure_count(), 1);
    }

    #[test]
    fn mark_clean_resets_failure_accounting() {
        let config = ClientConfig::default();
        let mut server = Server::new("10.0.0.1", 11211);
        server.mark_for_timeout(&config);

        server.mark_clean();
        assert_eq!(server.failure_count(), 0);
        assert_eq!(server.next_retry(), 0);
    }

    #[test]
    fn error_slot_holds_most_recent_error() {
        let mut server = Server::new("10.0.0.1", 11211);
        assert!(server.error().is_none());

        let _ = server.set_errno(libc::ECONNREFUSED);
        let err = server.error().expect("error slot empty");
        assert_eq!(err.kind(), ErrorKind::SystemError);
        assert_eq!(err.errno(), Some(libc::ECONNREFUSED));
    }

    #[test]
    fn server_states_are_ordered() {
        assert!(ServerState::New < ServerState::InProgress);
        assert!(ServerState::AddrInfoReady < ServerState::InProgress);
        assert!(ServerState::InProgress < ServerState::Connected);
    }
}
