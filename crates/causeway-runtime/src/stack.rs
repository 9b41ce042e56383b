//! Host stack sizing for guest-created threads.
//!
//! Guest code sizes its thread stacks for guest needs only. Host frames
//! produced while translating and marshalling on that same stack need extra
//! room, so every intercepted thread-creation request enlarges the stack to
//! at least the configured reserve.

/// Default translation reserve in bytes (2 MiB).
pub const DEFAULT_TRANSLATION_RESERVE: usize = 2 * 1024 * 1024;

/// Effective host stack size for a guest thread-creation request.
///
/// The guest-requested size wins only when it already covers the reserve; a
/// request of zero (platform default) still gets the full reserve.
pub fn effective_stack_size(requested: usize, translation_reserve: usize) -> usize {
    requested.max(translation_reserve)
}
