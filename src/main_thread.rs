//! Guard for entry points that must run on the thread owning the manager.

use std::thread::{self, ThreadId};

use crate::error::{Error, Result};

/// The thread that built a [`DeviceManager`](crate::DeviceManager).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainThread(ThreadId);

impl MainThread {
    /// Bind to the calling thread.
    pub fn capture() -> Self {
        Self(thread::current().id())
    }

    /// Check if the calling thread is the bound one.
    pub fn is_current(&self) -> bool {
        thread::current().id() == self.0
    }

    /// Fail with [`Error::NotOnMainThread`] when called from another thread.
    pub fn check(&self) -> Result<()> {
        if self.is_current() {
            return Ok(());
        }
        let current = thread::current();
        let thread = current
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        Err(Error::NotOnMainThread { thread })
    }
}
