//! Scoped teardown of partially-built device stacks.
//!
//! Multi-step mapping operations create several devices and images that
//! depend on each other. Whenever one is created, it is pushed onto a
//! `ScopedCleanup`; if the operation fails partway, dropping the list tears
//! everything down in reverse creation order. On success, `release()`
//! clears the list so the devices are kept.

use crate::error::Result;

type CleanupFn<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Stack of deferred destructors, run in reverse order on drop.
#[derive(Default)]
pub struct ScopedCleanup<'a> {
    entries: Vec<(String, CleanupFn<'a>)>,
}

impl<'a> ScopedCleanup<'a> {
    pub fn new() -> Self {
        ScopedCleanup::default()
    }

    /// Register a destructor for `name`. The closure captures whatever
    /// back-reference (mapper, image manager, or manager + lock) deleting
    /// the resource needs.
    pub fn push(&mut self, name: impl Into<String>, destroy: impl FnOnce() -> Result<()> + 'a) {
        self.entries.push((name.into(), Box::new(destroy)));
    }

    /// Success path: keep all registered resources.
    pub fn release(&mut self) {
        self.entries.clear();
    }
}

impl Drop for ScopedCleanup<'_> {
    fn drop(&mut self) {
        // Newer devices may depend on older ones, so destroy in reverse.
        for (name, destroy) in self.entries.drain(..).rev() {
            if let Err(e) = destroy() {
                tracing::error!(resource = %name, error = %e, "Scoped cleanup failed");
            }
        }
    }
}
