// Copyright 2020 Joyent, Inc.

//! Connection establishment.
//!
//! This module walks a server instance through the connect state machine:
//! backoff screening, address resolution, per-candidate non-blocking
//! connect with a bounded readiness poll, and the post-connect SASL step.
//! The entry points are methods on [`Client`].

use std::io;
use std::os::unix::io::AsRawFd;

use chrono::Utc;
use slog::{debug, Logger};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{ConnectError, ConnectResult, ErrorKind};
use crate::resolver::{self, HostResolver};
use crate::server::{Server, ServerState, Transport};
use crate::socket;

// The readiness poll should only loop on EINTR or ERESTART.
const CONNECT_POLL_RETRIES: u32 = 5;

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// Nonblocking connect(2) results that mean the attempt is still in flight
// and the socket should be polled for writability.
fn connect_in_progress(errno: i32) -> bool {
    errno == libc::EAGAIN
        || errno == libc::EWOULDBLOCK
        || errno == libc::EINPROGRESS
        || errno == libc::EALREADY
}

/// Wait for an in-progress non-blocking connect to resolve.
///
/// Polls the socket for POLLOUT, bounded by the configured connect
/// timeout. A deadline bumps the server's timeout counter; hard poll
/// failures release the socket and reset the state machine.
fn connect_poll(server: &mut Server, config: &ClientConfig) -> ConnectResult<()> {
    if config.poll_timeout == 0 {
        return Err(server.set_error(ErrorKind::Timeout));
    }

    let fd = match &server.socket {
        Some(socket) => socket.as_raw_fd(),
        None => return Err(server.set_error(ErrorKind::ConnectionFailure)),
    };

    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };

    for _ in 0..CONNECT_POLL_RETRIES {
        let number_of =
            unsafe { libc::poll(&mut pollfd, 1, config.connect_timeout as libc::c_int) };

        if number_of < 0 {
            // Cached before any cleanup call can overwrite it.
            let local_errno = last_errno();
            match local_errno {
                libc::EINTR => continue,

                #[cfg(target_os = "linux")]
                libc::ERESTART => continue,

                libc::EFAULT | libc::ENOMEM => {
                    return Err(server.set_error(ErrorKind::MemoryAllocationFailure));
                }

                libc::EINVAL => {
                    return Err(server.set_error_message(
                        ErrorKind::MemoryAllocationFailure,
                        "RLIMIT_NOFILE exceeded or invalid timeout",
                    ));
                }

                // This should not happen.
                _ => {
                    let mut local_errno = local_errno;
                    if (pollfd.revents & libc::POLLERR) != 0 {
                        match server.socket.as_ref().map(|s| s.take_error()) {
                            Some(Ok(Some(err))) => {
                                local_errno = err.raw_os_error().unwrap_or(local_errno);
                            }
                            // SO_ERROR had nothing to add; punt and poll
                            // again.
                            Some(Ok(None)) => continue,
                            _ => {}
                        }
                    }

                    server.close_socket();
                    server.state = ServerState::New;
                    return Err(server.set_errno(local_errno));
                }
            }
        }

        if number_of == 0 {
            server.io_wait_count.timeouts += 1;
            return Err(server.set_error(ErrorKind::Timeout));
        }

        if (pollfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL)) != 0 {
            return match server.socket.as_ref().map(|s| s.take_error()) {
                Some(Ok(Some(err))) => {
                    let errno = err.raw_os_error().unwrap_or(0);
                    Err(server.set_errno(errno))
                }
                // SO_ERROR reports nothing wrong: the connect raced to
                // completion, and any real failure will surface on the
                // first IO.
                Some(Ok(None)) => Ok(()),
                Some(Err(err)) => {
                    let errno = err.raw_os_error().unwrap_or(0);
                    Err(server.set_errno(errno))
                }
                None => Err(server.set_error(ErrorKind::ConnectionFailure)),
            };
        }

        debug_assert!((pollfd.revents & (libc::POLLIN | libc::POLLOUT)) != 0);
        return Ok(());
    }

    // Only reachable through repeated EINTR or ERESTART.
    Err(server.set_errno(last_errno()))
}

/// Blocking connect over an AF_UNIX path.
#[cfg(unix)]
fn unix_socket_connect(server: &mut Server, log: &Logger) -> ConnectResult<()> {
    debug_assert!(server.socket.is_none());

    let unix_socket = match Socket::new(Domain::UNIX, Type::STREAM, None) {
        Ok(unix_socket) => unix_socket,
        Err(err) => {
            server.set_errno(err.raw_os_error().unwrap_or(0));
            return Err(ConnectError::new(ErrorKind::ConnectionFailure));
        }
    };

    let addr = match SockAddr::unix(&server.hostname) {
        Ok(addr) => addr,
        Err(err) => {
            server.set_errno(err.raw_os_error().unwrap_or(libc::ENAMETOOLONG));
            return Err(ConnectError::new(ErrorKind::ConnectionFailure));
        }
    };

    server.socket = Some(unix_socket);

    // Interrupted or already-in-flight results retry the connect itself.
    loop {
        match server.connect_socket(&addr) {
            Ok(()) => break,
            Err(err) => match err.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EINTR) => continue,

                Some(libc::EISCONN) => {
                    // Spinning on an already established connect is a
                    // programmer error.
                    debug_assert!(false, "EISCONN from a blocking connect");
                    break;
                }

                _ => {
                    let errno = err.raw_os_error().unwrap_or(0);
                    server.close_socket();
                    server.set_errno(errno);
                    return Err(ConnectError::new(ErrorKind::ConnectionFailure));
                }
            },
        }
    }

    // The reader and writer loops expect nonblocking IO regardless of
    // transport.
    socket::set_socket_nonblocking(server, log);
    server.state = ServerState::Connected;

    debug_assert!(server.socket.is_some());

    Ok(())
}

#[cfg(not(unix))]
fn unix_socket_connect(server: &mut Server, _log: &Logger) -> ConnectResult<()> {
    Err(server.set_error(ErrorKind::NotSupported))
}

/// Walk the resolved candidate list until one address yields a connected
/// socket.
fn network_connect(
    server: &mut Server,
    config: &ClientConfig,
    host_resolver: &dyn HostResolver,
    log: &Logger,
) -> ConnectResult<()> {
    let mut timeout_error_occurred = false;

    debug_assert!(server.socket.is_none());

    // Re-resolve when there is no list or the previous one has been fully
    // tried, so any new DNS information is picked up.
    if server.candidates.is_none() || server.candidates_exhausted() {
        resolver::set_hostinfo_with_retry(server, host_resolver, log)?;
    }

    while server.socket.is_none() {
        let candidate = match server
            .candidates
            .as_ref()
            .and_then(|candidates| candidates.get(server.cursor))
        {
            Some(candidate) => *candidate,
            None => break,
        };

        // The cache protocol has no IPv6 datagram mode; skip anything that
        // is not v4.
        if server.transport == Transport::Udp && !candidate.is_ipv4() {
            server.cursor += 1;
            continue;
        }

        let (socktype, protocol) = match server.transport {
            Transport::Udp => (Type::DGRAM, Protocol::UDP),
            _ => (Type::STREAM, Protocol::TCP),
        };

        let new_socket =
            match Socket::new(Domain::for_address(candidate), socktype, Some(protocol)) {
                Ok(new_socket) => new_socket,
                Err(err) => return Err(server.set_errno(err.raw_os_error().unwrap_or(0))),
            };
        server.socket = Some(new_socket);

        socket::set_socket_options(server, config, log);

        match server.connect_socket(&SockAddr::from(candidate)) {
            Ok(()) => {
                server.state = ServerState::Connected;
                return Ok(());
            }
            Err(err) => {
                // Cached before the socket teardown below can clobber it.
                let errno = err.raw_os_error().unwrap_or(0);

                if connect_in_progress(errno) {
                    server.state = ServerState::InProgress;
                    match connect_poll(server, config) {
                        Ok(()) => {
                            server.state = ServerState::Connected;
                            return Ok(());
                        }
                        // A poll deadline is an error here; the candidate
                        // is not retried.
                        Err(poll_err) if poll_err.kind() == ErrorKind::Timeout => {
                            timeout_error_occurred = true;
                        }
                        Err(_) => {}
                    }
                } else if errno == libc::ETIMEDOUT {
                    timeout_error_occurred = true;
                } else if errno == libc::EINTR {
                    // Interrupted: release the socket and retry the same
                    // candidate without advancing the cursor.
                    server.close_socket();
                    continue;
                } else if errno == libc::EISCONN {
                    debug_assert!(false, "EISCONN from a first connect");
                }

                debug!(log, "connect to {} failed (os error {})", candidate, errno);
                server.close_socket();
                server.cursor += 1;
            }
        }
    }

    debug_assert!(server.socket.is_none());

    // Never got a good socket. Prefer whatever error the walk recorded.
    if let Some(err) = server.error.clone() {
        return Err(err);
    }

    if timeout_error_occurred && server.state < ServerState::InProgress {
        return Err(server.set_error(ErrorKind::Timeout));
    }

    // The last failure should have come from connect(2).
    Err(server.set_error(ErrorKind::ConnectionFailure))
}

impl Client {
    /// Screen a connect attempt against the server's failure history.
    ///
    /// Fails the attempt outright without touching the network when the
    /// server has been ejected or is still inside its cooldown window.
    /// `in_timeout` reports that the attempt runs right after a cooldown
    /// expired, which the orchestrator folds into its failure reporting.
    fn backoff_handling(
        &mut self,
        server: &mut Server,
        in_timeout: &mut bool,
    ) -> ConnectResult<()> {
        let now = Utc::now().timestamp();

        // Crossing the failure limit means something is structurally wrong
        // with the server: eject it from the distribution when allowed,
        // otherwise keep sitting out the timeout.
        if server.server_failure_counter >= self.config.server_failure_limit {
            if self.config.flags.auto_eject_hosts {
                self.note_disconnect(server);

                // A dead server is retried exactly once after the dead
                // timeout expires.
                if self.config.dead_timeout > 0 {
                    server.next_retry = now + self.config.dead_timeout;
                    server.server_failure_counter =
                        self.config.server_failure_limit.saturating_sub(1);
                }

                if let Err(err) = self.distribution.run_distribution() {
                    return Err(server.set_error_message(
                        err.kind(),
                        "backoff handling failed during run_distribution",
                    ));
                }

                return Err(server.set_error(ErrorKind::ServerMarkedDead));
            }

            server.state = ServerState::InTimeout;

            // Sanity setting so the retry comparison below has a value to
            // work with.
            if server.next_retry == 0 {
                server.next_retry = 1;
            }
        }

        if server.state == ServerState::InTimeout {
            // Once next_retry has passed, reset and try everything again.
            if server.next_retry < now {
                server.state = ServerState::New;
            } else {
                return Err(server.set_error(ErrorKind::ServerTemporarilyDisabled));
            }

            *in_timeout = true;
        }

        Ok(())
    }

    fn connect_impl(
        &mut self,
        server: &mut Server,
        set_last_disconnected: bool,
    ) -> ConnectResult<()> {
        // Reconnecting an already connected server is a no-op.
        if server.socket.is_some() {
            return Ok(());
        }

        // The error slot describes the current attempt only.
        server.error = None;

        let mut in_timeout = false;
        if let Err(err) = self.backoff_handling(server, &mut in_timeout) {
            self.note_disconnect(server);
            return Err(err);
        }

        if self.sasl.is_some() && self.config.flags.udp {
            return Err(server.set_error_message(
                ErrorKind::InvalidHostProtocol,
                "SASL is not supported for UDP connections",
            ));
        }

        if server.hostname.starts_with('/') {
            server.transport = Transport::UnixSocket;
        }

        let rc = match server.transport {
            Transport::Tcp | Transport::Udp => {
                let mut rc =
                    network_connect(server, &self.config, self.resolver.as_ref(), &self.log);

                if server.socket.is_some() {
                    if let Some(sasl) = self.sasl.clone() {
                        rc = sasl.authenticate(server);
                        if rc.is_err() && server.socket.is_some() {
                            server.close_socket();
                        }
                    }
                }

                rc
            }
            Transport::UnixSocket => unix_socket_connect(server, &self.log),
        };

        match rc {
            Ok(()) => {
                debug!(self.log, "connected to {}", server.name());
                server.mark_clean();
                Ok(())
            }
            Err(err) => {
                if set_last_disconnected {
                    self.note_disconnect(server);

                    if server.error.is_none() {
                        server.error = Some(err.clone());
                    }
                    server.mark_for_timeout(&self.config);

                    if in_timeout {
                        let name = server.name();
                        return Err(
                            server.set_error_message(ErrorKind::ServerTemporarilyDisabled, name)
                        );
                    }
                }

                Err(err)
            }
        }
    }

    /// Connect a server instance, updating its failure accounting.
    ///
    /// Success resets the server's failure state; failure records the
    /// server as the last disconnected host and pushes it toward its
    /// timeout window. Calling with an already connected server is a
    /// no-op.
    pub fn connect(&mut self, server: &mut Server) -> ConnectResult<()> {
        self.connect_impl(server, true)
    }

    /// Connect a server instance without recording it as the last
    /// disconnected host on failure.
    pub fn connect_try(&mut self, server: &mut Server) -> ConnectResult<()> {
        self.connect_impl(server, false)
    }

    /// Connect after the server's address may have changed: forces a fresh
    /// lookup before the usual flow.
    pub fn connect_new_ipaddress(&mut self, server: &mut Server) -> ConnectResult<()> {
        let _ = resolver::set_hostinfo(server, self.resolver.as_ref());
        self.connect_impl(server, true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use chrono::Utc;

    use crate::client::Client;
    use crate::config::ClientConfig;
    use crate::distribution::Distribution;
    use crate::error::{ConnectError, ConnectResult, ErrorKind};
    use crate::server::{Server, ServerState};

    struct CountingDistribution {
        runs: Arc<AtomicUsize>,
        fail_with: Option<ErrorKind>,
    }

    impl Distribution for CountingDistribution {
        fn run_distribution(&mut self) -> ConnectResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(kind) => Err(ConnectError::new(kind)),
                None => Ok(()),
            }
        }
    }

    fn counting_client(config: ClientConfig, fail_with: Option<ErrorKind>) -> (Client, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let client = Client::new(config).with_distribution(Box::new(CountingDistribution {
            runs: runs.clone(),
            fail_with,
        }));
        (client, runs)
    }

    #[test]
    fn backoff_passes_below_failure_limit() {
        let mut client = Client::new(ClientConfig::default());
        let mut server = Server::new("10.0.0.1", 11211);
        let mut in_timeout = false;

        client
            .backoff_handling(&mut server, &mut in_timeout)
            .expect("backoff should pass");
        assert!(!in_timeout);
        assert_eq!(server.state(), ServerState::New);
    }

    #[test]
    fn backoff_without_eject_enters_timeout_and_allows_retry() {
        let mut config = ClientConfig::default();
        config.server_failure_limit = 2;
        let mut client = Client::new(config);

        let mut server = Server::new("10.0.0.1", 11211);
        server.server_failure_counter = 2;
        // next_retry was never set; the sanity value must let the attempt
        // through immediately.
        let mut in_timeout = false;

        client
            .backoff_handling(&mut server, &mut in_timeout)
            .expect("sanity next_retry should allow the attempt");
        assert!(in_timeout);
        assert_eq!(server.state(), ServerState::New);
        assert_eq!(server.next_retry(), 1);
    }

    #[test]
    fn backoff_without_eject_disables_until_next_retry() {
        let mut config = ClientConfig::default();
        config.server_failure_limit = 2;
        let mut client = Client::new(config);

        let mut server = Server::new("10.0.0.1", 11211);
        server.server_failure_counter = 2;
        server.next_retry = Utc::now().timestamp() + 100;
        let mut in_timeout = false;

        let err = client
            .backoff_handling(&mut server, &mut in_timeout)
            .expect_err("cooldown should short-circuit");
        assert_eq!(err.kind(), ErrorKind::ServerTemporarilyDisabled);
        assert_eq!(server.state(), ServerState::InTimeout);
        assert!(!in_timeout);
        assert_eq!(
            server.error().map(ConnectError::kind),
            Some(ErrorKind::ServerTemporarilyDisabled)
        );
    }

    #[test]
    fn backoff_disables_while_cooldown_active() {
        let mut client = Client::new(ClientConfig::default());
        let mut server = Server::new("10.0.0.1", 11211);
        server.state = ServerState::InTimeout;
        server.next_retry = Utc::now().timestamp() + 50;
        let mut in_timeout = false;

        let err = client
            .backoff_handling(&mut server, &mut in_timeout)
            .expect_err("cooldown should short-circuit");
        assert_eq!(err.kind(), ErrorKind::ServerTemporarilyDisabled);
    }

    #[test]
    fn backoff_resets_after_cooldown_expires() {
        let mut client = Client::new(ClientConfig::default());
        let mut server = Server::new("10.0.0.1", 11211);
        server.state = ServerState::InTimeout;
        server.next_retry = Utc::now().timestamp() - 5;
        let mut in_timeout = false;

        client
            .backoff_handling(&mut server, &mut in_timeout)
            .expect("expired cooldown should reset");
        assert!(in_timeout);
        assert_eq!(server.state(), ServerState::New);
    }

    #[test]
    fn auto_eject_marks_server_dead_and_pins_counter() {
        let mut config = ClientConfig::default();
        config.server_failure_limit = 2;
        config.dead_timeout = 5;
        config.flags.auto_eject_hosts = true;
        let (mut client, runs) = counting_client(config, None);

        let mut server = Server::new("10.0.0.1", 11211);
        server.server_failure_counter = 2;
        let mut in_timeout = false;

        let before = Utc::now().timestamp();
        let err = client
            .backoff_handling(&mut server, &mut in_timeout)
            .expect_err("eject should fail the attempt");

        assert_eq!(err.kind(), ErrorKind::ServerMarkedDead);
        // One retry is owed once the dead timeout expires.
        assert_eq!(server.failure_count(), 1);
        assert!(server.next_retry() >= before + 5);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(client.last_disconnected_host(), Some("10.0.0.1:11211"));
    }

    #[test]
    fn auto_eject_propagates_distribution_failure() {
        let mut config = ClientConfig::default();
        config.server_failure_limit = 1;
        config.dead_timeout = 5;
        config.flags.auto_eject_hosts = true;
        let (mut client, runs) =
            counting_client(config, Some(ErrorKind::MemoryAllocationFailure));

        let mut server = Server::new("10.0.0.1", 11211);
        server.server_failure_counter = 1;
        let mut in_timeout = false;

        let err = client
            .backoff_handling(&mut server, &mut in_timeout)
            .expect_err("distribution failure should propagate");
        assert_eq!(err.kind(), ErrorKind::MemoryAllocationFailure);
        assert_eq!(
            err.message(),
            Some("backoff handling failed during run_distribution")
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn auto_eject_without_dead_timeout_leaves_counter_alone() {
        let mut config = ClientConfig::default();
        config.server_failure_limit = 2;
        config.dead_timeout = 0;
        config.flags.auto_eject_hosts = true;
        let (mut client, _runs) = counting_client(config, None);

        let mut server = Server::new("10.0.0.1", 11211);
        server.server_failure_counter = 3;
        let mut in_timeout = false;

        let err = client
            .backoff_handling(&mut server, &mut in_timeout)
            .expect_err("eject should fail the attempt");
        assert_eq!(err.kind(), ErrorKind::ServerMarkedDead);
        assert_eq!(server.failure_count(), 3);
        assert_eq!(server.next_retry(), 0);
    }
}
