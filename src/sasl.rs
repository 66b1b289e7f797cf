// Copyright 2020 Joyent, Inc.

use crate::error::ConnectResult;
use crate::server::Server;

/// SASL challenge/response handshake over an established socket.
///
/// When an authenticator is installed on the client, every successful
/// TCP connect runs the handshake before the server is considered usable;
/// a handshake failure closes the socket. Credential handling is entirely
/// the implementor's concern. The datagram transport cannot carry the
/// handshake, so installing an authenticator on a UDP client makes every
/// connect fail with `InvalidHostProtocol`.
pub trait SaslAuthenticator: Send + Sync {
    fn authenticate(&self, server: &mut Server) -> ConnectResult<()>;
}
