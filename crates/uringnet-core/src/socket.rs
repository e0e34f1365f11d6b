//! The capability set a proactor-driven socket implements.
//!
//! The proactor dispatches every completion through this trait, never to
//! a concrete socket type. Datagram, listener, and stream variants differ
//! only in which callbacks they expect to fire; a variant leaves the
//! callbacks it never uses at their defaults.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use crate::blob::Blob;
use crate::error::{Error, Result};
use crate::options::{ReceiveContext, SendContext};

/// A socket attached to a proactor.
///
/// All callbacks are invoked from proactor waiter threads with no locks
/// held by the proactor; implementations take their own mutex and must
/// release it before invoking user callbacks.
pub trait ProactorSocket: Send + Sync {
    /// The OS handle, or -1 once detached.
    fn handle(&self) -> RawFd;

    /// Install or clear the proactor's per-socket context. The proactor
    /// stores its `SocketContext` here at attach time and clears it at
    /// detach time.
    fn set_proactor_context(&self, context: Option<Arc<dyn Any + Send + Sync>>);

    /// The context installed by `set_proactor_context`, if any.
    fn proactor_context(&self) -> Option<Arc<dyn Any + Send + Sync>>;

    /// An accept completed: `result` carries the accepted handle.
    fn process_accepted(self: Arc<Self>, result: Result<RawFd>) {
        let _ = result;
    }

    /// A connect completed.
    fn process_connected(self: Arc<Self>, result: Result<()>) {
        let _ = result;
    }

    /// A send completed. `context.bytes_sent` is hydrated on success.
    fn process_sent(self: Arc<Self>, result: Result<()>, context: SendContext) {
        let _ = (result, context);
    }

    /// A receive completed. On success `blob` holds the datagram with its
    /// readable length committed.
    fn process_received(
        self: Arc<Self>,
        result: Result<()>,
        blob: Option<Blob>,
        context: ReceiveContext,
    ) {
        let _ = (result, blob, context);
    }

    /// The kernel finished the zero-copy transmission tagged `counter`.
    /// `copied` reports that the kernel fell back to copying the pages.
    fn process_zero_copy(self: Arc<Self>, counter: u64, copied: bool) {
        let _ = (counter, copied);
    }

    /// A fatal socket error was observed outside a specific operation.
    fn process_error(self: Arc<Self>, error: Error) {
        let _ = error;
    }

    /// Detachment from the proactor finished; the socket may now close or
    /// export its handle.
    fn process_detached(self: Arc<Self>) {}
}
