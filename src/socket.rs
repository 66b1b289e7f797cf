// Copyright 2020 Joyent, Inc.

use std::io;
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use slog::{warn, Logger};

use crate::config::ClientConfig;
use crate::server::{Server, Transport};

/// Apply the configured transport tuning to a freshly created socket, then
/// flip it to non-blocking mode.
///
/// Tuning is best effort; a refused option leaves the kernel default in
/// place. Correctness hinges only on non-blocking mode, whose failure is
/// recorded as the server's last error.
pub(crate) fn set_socket_options(server: &mut Server, config: &ClientConfig, log: &Logger) {
    debug_assert!(
        server.socket.is_some(),
        "invalid socket passed to set_socket_options"
    );

    // Datagram sockets take no stream tuning.
    if server.transport == Transport::Udp {
        set_socket_nonblocking(server, log);
        return;
    }

    if let Some(socket) = &server.socket {
        if config.snd_timeout > 0 {
            let waittime = Duration::from_micros(config.snd_timeout);
            let error = socket.set_write_timeout(Some(waittime));
            debug_assert!(error.is_ok());
        }

        if config.rcv_timeout > 0 {
            let waittime = Duration::from_micros(config.rcv_timeout);
            let error = socket.set_read_timeout(Some(waittime));
            debug_assert!(error.is_ok());
        }

        #[cfg(target_vendor = "apple")]
        {
            // Not considered a fatal error.
            if let Err(error) = socket.set_nosigpipe(true) {
                warn!(log, "setsockopt(SO_NOSIGPIPE) failed: {}", error);
            }
        }

        if config.flags.no_block {
            // Drop the socket on close instead of draining it.
            let error = socket.set_linger(Some(Duration::from_secs(0)));
            debug_assert!(error.is_ok());
        }

        if config.flags.tcp_nodelay {
            let error = socket.set_nodelay(true);
            debug_assert!(error.is_ok());
        }

        if config.flags.tcp_keepalive {
            let error = socket.set_keepalive(true);
            debug_assert!(error.is_ok());
        }

        if config.tcp_keepidle > 0 {
            let keepalive = socket2::TcpKeepalive::new()
                .with_time(Duration::from_secs(config.tcp_keepidle));
            let error = socket.set_tcp_keepalive(&keepalive);
            debug_assert!(error.is_ok());
        }

        if config.send_size > 0 {
            let error = socket.set_send_buffer_size(config.send_size);
            debug_assert!(error.is_ok());
        }

        if config.recv_size > 0 {
            let error = socket.set_recv_buffer_size(config.recv_size);
            debug_assert!(error.is_ok());
        }
    }

    // Nonblocking IO is always used to avoid write deadlocks.
    set_socket_nonblocking(server, log);
}

/// Switch the server's socket to non-blocking mode.
///
/// The F_GETFL/F_SETFL sequence is retried while interrupted. A failure is
/// recorded as the server's last error but does not abort the connect.
pub(crate) fn set_socket_nonblocking(server: &mut Server, log: &Logger) {
    let fd = match &server.socket {
        Some(socket) => socket.as_raw_fd(),
        None => return,
    };

    let mut flags;
    loop {
        flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        if flags == -1 && fcntl_interrupted() {
            continue;
        }
        break;
    }

    if flags == -1 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        warn!(log, "fcntl(F_GETFL) failed (os error {})", errno);
        server.set_errno(errno);
        return;
    }

    if (flags & libc::O_NONBLOCK) == 0 {
        let mut rval;
        loop {
            rval = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            if rval == -1 && fcntl_interrupted() {
                continue;
            }
            break;
        }

        if rval == -1 {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            warn!(log, "fcntl(F_SETFL) failed (os error {})", errno);
            server.set_errno(errno);
        }
    }
}

fn fcntl_interrupted() -> bool {
    matches!(
        io::Error::last_os_error().raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN)
    )
}
