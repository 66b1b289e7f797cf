// Copyright 2020 Joyent, Inc.

//! Name resolution for server endpoints.
//!
//! Lookups run through the [`HostResolver`] trait so the connect paths can
//! be exercised against injected address lists; [`SystemResolver`] is the
//! production implementation over `getaddrinfo`.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use dns_lookup::{getaddrinfo, AddrInfoHints, LookupError, LookupErrorKind};
use slog::{debug, Logger};
use thiserror::Error;

use crate::error::{ConnectResult, ErrorKind};
use crate::server::{Server, ServerState, Transport};

/// One candidate address produced by a lookup, tried in returned order.
/// This is a type alias for std::net::SocketAddr.
pub type Candidate = SocketAddr;

// Bounded retry for transient lookup failures.
const LOOKUP_RETRIES: u32 = 5;
const LOOKUP_RETRY_DELAY: Duration = Duration::from_millis(1);

/// A name-resolution failure, classified the way the connect subsystem
/// needs to react to it.
#[derive(Debug, Error)]
pub enum LookupFailure {
    /// The failure is transient and the lookup may be retried.
    #[error("transient resolver failure: {0}")]
    TryAgain(String),
    /// The resolver failed in a system call; the errno is carried.
    #[error("resolver system error (os error {0})")]
    System(i32),
    /// The resolver rejected the lookup hints.
    #[error("resolver rejected lookup hints: {0}")]
    BadFlags(String),
    /// The resolver could not allocate memory for the result.
    #[error("resolver allocation failure: {0}")]
    OutOfMemory(String),
    /// Any other definitive lookup error.
    #[error("host lookup failure: {0}")]
    Other(String),
}

/// Endpoint-to-address lookup.
///
/// Implementations translate a textual endpoint, port, and transport into
/// the candidate addresses a connect attempt should walk.
pub trait HostResolver: Send + Sync {
    fn lookup(
        &self,
        endpoint: &str,
        port: u16,
        transport: Transport,
    ) -> Result<Vec<Candidate>, LookupFailure>;
}

/// The system resolver: `getaddrinfo` with transport-appropriate hints and
/// the address family left unspecified, so both v4 and v6 candidates come
/// back.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn lookup(
        &self,
        endpoint: &str,
        port: u16,
        transport: Transport,
    ) -> Result<Vec<Candidate>, LookupFailure> {
        let hints = match transport {
            Transport::Udp => AddrInfoHints {
                socktype: libc::SOCK_DGRAM,
                protocol: libc::IPPROTO_UDP,
                address: 0,
                flags: 0,
            },
            _ => AddrInfoHints {
                socktype: libc::SOCK_STREAM,
                protocol: libc::IPPROTO_TCP,
                address: 0,
                flags: 0,
            },
        };

        let service = port.to_string();
        let addrs = getaddrinfo(Some(endpoint), Some(&service), Some(hints))
            .map_err(classify_lookup_error)?;

        Ok(addrs
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.sockaddr)
            .collect())
    }
}

fn classify_lookup_error(err: LookupError) -> LookupFailure {
    match err.kind() {
        LookupErrorKind::Again => LookupFailure::TryAgain(std::io::Error::from(err).to_string()),
        LookupErrorKind::System => LookupFailure::System(
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        ),
        LookupErrorKind::Badflags => {
            LookupFailure::BadFlags(std::io::Error::from(err).to_string())
        }
        LookupErrorKind::Memory => {
            LookupFailure::OutOfMemory(std::io::Error::from(err).to_string())
        }
        _ => LookupFailure::Other(std::io::Error::from(err).to_string()),
    }
}

/// Replace the server's candidate list with a fresh lookup result.
///
/// The previous list, if any, is dropped whether or not the lookup
/// succeeds. On success the cursor sits at the head of the new list and the
/// server state advances to `AddrInfoReady`.
pub(crate) fn set_hostinfo(
    server: &mut Server,
    resolver: &dyn HostResolver,
) -> ConnectResult<()> {
    debug_assert!(
        server.transport != Transport::UnixSocket,
        "lookup requested for a unix-domain server"
    );

    server.candidates = None;
    server.cursor = 0;

    // A pre-resolved IP address takes precedence over the hostname.
    let endpoint = server
        .ipaddress
        .clone()
        .unwrap_or_else(|| server.hostname.clone());

    match resolver.lookup(&endpoint, server.port, server.transport) {
        Ok(candidates) => {
            server.candidates = Some(candidates);
            server.state = ServerState::AddrInfoReady;
            Ok(())
        }
        Err(LookupFailure::TryAgain(message)) => {
            Err(server.set_error_message(ErrorKind::Timeout, message))
        }
        Err(LookupFailure::System(errno)) => {
            Err(server.set_errno_message(errno, "getaddrinfo(EAI_SYSTEM)"))
        }
        Err(LookupFailure::BadFlags(_)) => Err(server
            .set_error_message(ErrorKind::InvalidArguments, "getaddrinfo(EAI_BADFLAGS)")),
        Err(LookupFailure::OutOfMemory(_)) => Err(server.set_error_message(
            ErrorKind::MemoryAllocationFailure,
            "getaddrinfo(EAI_MEMORY)",
        )),
        Err(LookupFailure::Other(message)) => {
            Err(server.set_error_message(ErrorKind::HostLookupFailure, message))
        }
    }
}

/// Lookup with bounded retry: transient failures sleep briefly and try
/// again; anything definitive propagates at once.
pub(crate) fn set_hostinfo_with_retry(
    server: &mut Server,
    resolver: &dyn HostResolver,
    log: &Logger,
) -> ConnectResult<()> {
    let mut last = set_hostinfo(server, resolver);
    for attempt in 1..LOOKUP_RETRIES {
        match &last {
            Err(err) if err.kind() == ErrorKind::Timeout => {
                debug!(
                    log,
                    "transient lookup failure for {}, retry {}",
                    server.name(),
                    attempt
                );
                thread::sleep(LOOKUP_RETRY_DELAY);
                last = set_hostinfo(server, resolver);
            }
            _ => break,
        }
    }
    last
}
