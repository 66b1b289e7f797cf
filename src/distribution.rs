// Copyright 2020 Joyent, Inc.

use crate::error::ConnectResult;

/// Recomputation hook for the key-to-server distribution.
///
/// When backoff auto-ejects a dead server the live server set changes, and
/// whatever owns the consistent-hash ring must rebuild it. The connect
/// subsystem invokes this exactly once per ejection; a failure propagates
/// to the caller with the ejected server's error context.
pub trait Distribution: Send {
    fn run_distribution(&mut self) -> ConnectResult<()>;
}

/// Distribution hook for clients that do not maintain a ring.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDistribution;

impl Distribution for NoopDistribution {
    fn run_distribution(&mut self) -> ConnectResult<()> {
        Ok(())
    }
}
