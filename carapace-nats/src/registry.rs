//! Process-wide registry of live clients, used to invalidate them in a
//! forked child.
//!
//! A child process inherits the parent's sockets but none of its tasks. The
//! child must not write to those sockets, so [`after_fork`] marks every
//! client created by another pid as closed without sending anything and
//! without firing callbacks.

use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use crate::connection::Shared;

static CLIENTS: Lazy<Mutex<HashMap<u64, Weak<Shared>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

pub(crate) fn register(shared: &Arc<Shared>) {
    CLIENTS.lock().insert(shared.id, Arc::downgrade(shared));
}

pub(crate) fn deregister(id: u64) {
    CLIENTS.lock().remove(&id);
}

/// Invalidate every client inherited from the parent process.
///
/// Call this in the child right after `fork()`. Returns the number of
/// clients that were invalidated. Clients created in the child itself are
/// left alone.
pub fn after_fork() -> usize {
    after_fork_from(std::process::id())
}

#[doc(hidden)]
pub fn after_fork_from(current_pid: u32) -> usize {
    let inherited: Vec<Arc<Shared>> = {
        let mut clients = CLIENTS.lock();
        let mut inherited = Vec::new();
        clients.retain(|_, weak| match weak.upgrade() {
            Some(shared) if shared.pid != current_pid => {
                inherited.push(shared);
                false
            }
            Some(_) => true,
            None => false,
        });
        inherited
    };
    for shared in &inherited {
        debug!("[Registry] Invalidating inherited client {}", shared.id);
        shared.invalidate_after_fork();
    }
    inherited.len()
}
