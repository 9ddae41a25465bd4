//! Hermetic build sandboxes: toolchain lookup, scratch-directory
//! provisioning, user-namespaced sandbox construction and the archive
//! plumbing that feeds it.

pub mod archive;
pub mod paths;
pub mod pipeline;
pub mod sandbox;
pub mod workdir;

/// Serializes tests that mutate process-global environment variables.
#[cfg(test)]
pub(crate) fn env_lock() -> std::sync::MutexGuard<'static, ()> {
    static LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}
