// Copyright 2020 Joyent, Inc.

use slog::Logger;

/// Behavior flags shared by every server a client drives.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnectionFlags {
    /// Abortive close on teardown: SO_LINGER is enabled with a zero linger
    /// interval so a close drops the socket instead of draining it.
    pub no_block: bool,
    /// Set TCP_NODELAY on new sockets.
    pub tcp_nodelay: bool,
    /// Set SO_KEEPALIVE on new sockets.
    pub tcp_keepalive: bool,
    /// When a server crosses the failure limit, eject it from the key
    /// distribution instead of merely cooling down on it.
    pub auto_eject_hosts: bool,
    /// Speak the datagram variant of the protocol.
    pub udp: bool,
}

/// The configuration shared by all server instances of a client.
///
/// Plain data; behavior hooks (resolver, distribution, SASL, logger) are
/// installed on [`Client`](crate::client::Client).
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Connect timeout in milliseconds. Bounds each readiness poll after a
    /// non-blocking connect reports in-progress.
    pub connect_timeout: u64,
    /// Poll timeout in milliseconds. Zero disables the readiness poll
    /// entirely, turning every in-progress connect into a timeout.
    pub poll_timeout: u64,
    /// SO_SNDTIMEO in microseconds; zero leaves the kernel default.
    pub snd_timeout: u64,
    /// SO_RCVTIMEO in microseconds; zero leaves the kernel default.
    pub rcv_timeout: u64,
    /// SO_SNDBUF in bytes; zero leaves the kernel default.
    pub send_size: usize,
    /// SO_RCVBUF in bytes; zero leaves the kernel default.
    pub recv_size: usize,
    /// TCP_KEEPIDLE in seconds; zero leaves the kernel default.
    pub tcp_keepidle: u64,
    /// Consecutive connect failures tolerated before a server is ejected or
    /// put into timeout.
    pub server_failure_limit: u32,
    /// Seconds a failed server waits before its next ordinary retry.
    pub retry_timeout: i64,
    /// Seconds an auto-ejected server stays dead before it is granted one
    /// more attempt. Zero disables dead-server retries.
    pub dead_timeout: i64,
    pub flags: ConnectionFlags,
    /// An optional `slog` logger instance. If none is provided the client
    /// falls back to the [`slog-stdlog`](https://docs.rs/slog-stdlog) drain.
    pub log: Option<Logger>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            connect_timeout: 4000,
            poll_timeout: 5000,
            snd_timeout: 0,
            rcv_timeout: 0,
            send_size: 0,
            recv_size: 0,
            tcp_keepidle: 0,
            server_failure_limit: 5,
            retry_timeout: 2,
            dead_timeout: 0,
            flags: ConnectionFlags::default(),
            log: None,
        }
    }
}
