// Copyright the device gateway fleet contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;
use std::sync::Arc;

/// The key every Session Ref, registry entry, and event is addressed by.
///
/// Backed by `Arc<str>` rather than `String` so that it is cheap to clone across the
/// registry, the event bus, and the parent/child back-edges without re-allocating.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        DeviceId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        DeviceId(Arc::from(s))
    }
}

impl From<String> for DeviceId {
    fn from(s: String) -> Self {
        DeviceId(Arc::from(s.as_str()))
    }
}
