//! Lifecycle Manager - lock counting and idle close
//!
//! Every operation holds a [`Lease`] while it runs, and a non-lazy client
//! holds one for its whole lifetime. When the last lease is released the
//! socket is closed with 1000, right away or after `keep_alive` if the
//! connection is still unused by then.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::connection::Connection;
use crate::protocol::CloseCode;

/// One lock on the shared connection.
///
/// Releasing is idempotent; dropping an unreleased lease releases it.
pub struct Lease {
    connection: Arc<Connection>,
    released: AtomicBool,
}

impl Lease {
    pub fn release(&self) -> bool {
        self.release_with(|| {})
    }

    /// Release, running `cleanup` first. Only the first call has an effect.
    pub fn release_with<F: FnOnce()>(&self, cleanup: F) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        cleanup();
        self.connection.unlock();
        true
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release();
    }
}

impl Connection {
    /// Take a lock; the connection stays open while any lock is held.
    pub(crate) fn acquire(self: &Arc<Self>) -> Lease {
        let locks = {
            let mut state = self.lock_state();
            state.locks += 1;
            state.locks
        };
        debug!(locks = locks, "Lock acquired");
        Lease {
            connection: Arc::clone(self),
            released: AtomicBool::new(false),
        }
    }

    fn unlock(self: &Arc<Self>) {
        let locks = {
            let mut state = self.lock_state();
            state.locks = state.locks.saturating_sub(1);
            state.locks
        };
        debug!(locks = locks, "Lock released");
        if locks == 0 {
            self.schedule_idle_close();
        }
    }

    /// Close the socket once it is unused, now or after `keep_alive`.
    ///
    /// The delayed close skips sockets still handshaking; the ack of such a
    /// socket schedules it again.
    pub(crate) fn schedule_idle_close(self: &Arc<Self>) {
        let keep_alive = self.options.keep_alive;
        if !keep_alive.is_zero() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let connection = Arc::downgrade(self);
                runtime.spawn(async move {
                    tokio::time::sleep(keep_alive).await;
                    if let Some(connection) = connection.upgrade() {
                        connection.close_if_idle(true);
                    }
                });
                return;
            }
        }
        self.close_if_idle(false);
    }

    /// Close the socket if nothing holds a lock. With `ready_only`, sockets
    /// still handshaking are left alone.
    fn close_if_idle(&self, ready_only: bool) {
        let mut state = self.lock_state();
        if state.locks > 0 || (ready_only && !state.is_ready()) {
            return;
        }
        if state.close_socket(CloseCode::NormalClosure.into(), "Normal Closure") {
            state.idle_closed = Some(state.generation);
            debug!("Closing idle connection");
        }
    }
}
