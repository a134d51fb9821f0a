//! Opaque transport handles attached to live sessions.

use std::sync::Arc;

/// A per-session transport resource owned by the protocol driver.
///
/// The registry only stores handles and closes them when they are replaced
/// or when their session is evicted.
pub trait SessionHandle: Send + Sync {
    /// Release the underlying transport. Must be safe to call more than once.
    fn close(&self);
}

/// Identity comparison for trait-object handles (data pointer only).
pub(crate) fn same_handle(a: &Arc<dyn SessionHandle>, b: &Arc<dyn SessionHandle>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
