// Copyright 2020 Joyent, Inc.

//! Connection establishment for multi-node cache clients
//!
//! Breakshot turns an abstract server endpoint -- a hostname and port, a
//! pre-resolved IP address, or a Unix socket path -- into a usable,
//! non-blocking socket. It is the connect-side subsystem of a cache client:
//! everything between "here is a server" and "here is a tuned socket you
//! may read and write", including the failure accounting that keeps a
//! client from hammering dead peers.
//!
//! ## Servers and clients
//!
//! A [`Server`](server/struct.Server.html) instance carries one endpoint
//! and all of the connect-side state attached to it: the socket handle,
//! the resolved candidate addresses and a cursor into them, the lifecycle
//! state, the consecutive-failure counter, and the most recent error. A
//! [`Client`](client/struct.Client.html) is the root those instances hang
//! off; it owns the shared [`ClientConfig`](config/struct.ClientConfig.html)
//! and the behavior hooks, and it drives the connect attempts:
//!
//! * [`Client::connect`](client/struct.Client.html#method.connect) --
//!   connect and update the failure accounting.
//! * [`Client::connect_try`](client/struct.Client.html#method.connect_try)
//!   -- connect without recording a failure as the last disconnect.
//! * [`Client::connect_new_ipaddress`](client/struct.Client.html#method.connect_new_ipaddress)
//!   -- force a fresh lookup first, for servers whose address changed.
//!
//! ## Connecting
//!
//! TCP and UDP endpoints are resolved through a pluggable
//! [`HostResolver`](resolver/trait.HostResolver.html) and each candidate
//! address is tried in order: create a socket, apply the configured
//! tuning, flip it non-blocking, and connect. An in-progress non-blocking
//! connect is waited on with a readiness poll bounded by the configured
//! connect timeout; an interrupted connect retries the same candidate; any
//! other failure releases the socket and advances to the next candidate.
//! Hostnames beginning with `/` are treated as Unix socket paths and
//! connected directly.
//!
//! ## Backoff
//!
//! Every attempt is screened against the server's failure history first.
//! A server that has crossed `server_failure_limit` either enters a
//! cooldown window (`ServerTemporarilyDisabled` until `next_retry`
//! passes), or -- when `auto_eject_hosts` is set -- is ejected from the
//! key distribution: the client's
//! [`Distribution`](distribution/trait.Distribution.html) hook is run, the
//! failure counter is pinned so the server gets exactly one retry after
//! `dead_timeout`, and the attempt fails with `ServerMarkedDead`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use breakshot::client::Client;
//! use breakshot::config::ClientConfig;
//! use breakshot::server::Server;
//!
//! let mut config = ClientConfig::default();
//! config.connect_timeout = 1000;
//!
//! let mut client = Client::new(config);
//! let mut server = Server::new("cache-1.example.com", 11211);
//!
//! match client.connect(&mut server) {
//!     Ok(()) => {
//!         // server.socket() is connected, tuned, and non-blocking.
//!     }
//!     Err(e) => {
//!         // The error is also queryable as server.error(), and
//!         // client.last_disconnected_host() names the failed server.
//!         eprintln!("connect failed: {}", e);
//!     }
//! }
//! ```

#![allow(missing_docs)]

pub mod client;
pub mod config;
mod connect;
pub mod distribution;
pub mod error;
pub mod resolver;
pub mod sasl;
pub mod server;
mod socket;
