// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::time::Duration;

/// Recognized configuration for the core (§6). Sourcing these values from a file, flags, or
/// the environment is an external collaborator's job (spec.md §1 names configuration loading
/// as out of scope) -- the core only ever consumes an already-built value of this type, the
/// same posture `task_executor::Executor` takes toward an already-resolved thread count.
#[derive(Clone, Debug)]
pub struct SessionManagerConfig {
    /// Upper bound on a single Session Ref load. Default 5 seconds.
    pub session_load_timeout: Duration,
    /// Liveness Sweeper period. Default 30 seconds.
    pub session_check_interval: Duration,
}

impl SessionManagerConfig {
    pub fn new(session_load_timeout: Duration, session_check_interval: Duration) -> Self {
        Self {
            session_load_timeout,
            session_check_interval,
        }
    }
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            session_load_timeout: Duration::from_secs(5),
            session_check_interval: Duration::from_secs(30),
        }
    }
}
