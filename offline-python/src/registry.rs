//! Process registry
//!
//! Maps a handler identity to its long-lived process so repeated
//! invocations reuse one child. A handle leaves the registry as soon as its
//! child is gone.

use crate::codec::{LineCodec, LineTerminator};
use crate::invoker::ProcessHandle;
use crate::lifecycle::{ProcessSupervisor, SpawnError};
use crate::runtime::RuntimeDescriptor;
use crate::sink::OutputSink;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use offline_core::HandlerIdentity;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

type Handles = DashMap<HandlerIdentity, Arc<ProcessHandle>>;

pub struct ProcessRegistry {
    handles: Arc<Handles>,
    supervisor: Arc<ProcessSupervisor>,
    sink: Arc<dyn OutputSink>,
    terminator: LineTerminator,
}

impl ProcessRegistry {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        sink: Arc<dyn OutputSink>,
        terminator: LineTerminator,
    ) -> Self {
        Self {
            handles: Arc::new(DashMap::new()),
            supervisor,
            sink,
            terminator,
        }
    }

    /// Return the live process for `identity`, starting one if needed.
    ///
    /// A stored handle whose child has exited is replaced, or dropped if the
    /// replacement fails to start. Concurrent calls for the same identity
    /// start at most one process.
    pub fn acquire(
        &self,
        identity: &HandlerIdentity,
        descriptor: &RuntimeDescriptor,
        env: &HashMap<String, String>,
    ) -> Result<Arc<ProcessHandle>, SpawnError> {
        let handle = match self.handles.entry(identity.clone()) {
            Entry::Occupied(entry) if entry.get().is_alive() => {
                debug!(handler = %identity, pid = ?entry.get().pid(), "Reusing handler process");
                return Ok(entry.get().clone());
            }
            Entry::Occupied(mut entry) => {
                info!(handler = %identity, "Handler process is gone, starting a replacement");
                match self.start(identity, descriptor, env) {
                    Ok(handle) => {
                        entry.insert(handle.clone());
                        handle
                    }
                    Err(e) => {
                        entry.remove();
                        return Err(e);
                    }
                }
            }
            Entry::Vacant(entry) => {
                let handle = self.start(identity, descriptor, env)?;
                entry.insert(handle.clone());
                handle
            }
        };

        self.evict_when_stopped(identity.clone(), &handle);
        Ok(handle)
    }

    /// Remove `handle` once its worker stops, unless it was replaced first
    fn evict_when_stopped(&self, identity: HandlerIdentity, handle: &Arc<ProcessHandle>) {
        let handles: Weak<Handles> = Arc::downgrade(&self.handles);
        let watched = Arc::downgrade(handle);
        let stopped = handle.stopped();

        tokio::spawn(async move {
            stopped.await;
            let Some(handles) = handles.upgrade() else {
                return;
            };
            let evicted = handles
                .remove_if(&identity, |_, current| {
                    std::ptr::eq(Arc::as_ptr(current), watched.as_ptr())
                })
                .is_some();
            if evicted {
                debug!(handler = %identity, "Evicted stopped handler process");
            }
        });
    }

    fn start(
        &self,
        identity: &HandlerIdentity,
        descriptor: &RuntimeDescriptor,
        env: &HashMap<String, String>,
    ) -> Result<Arc<ProcessHandle>, SpawnError> {
        let child = self.supervisor.spawn(descriptor, identity, env)?;
        let codec = LineCodec::new(self.terminator, descriptor.platform);
        Ok(ProcessHandle::start(
            identity.clone(),
            child,
            codec,
            self.sink.clone(),
        ))
    }

    /// Handle currently registered for `identity`, alive or not
    pub fn get(&self, identity: &HandlerIdentity) -> Option<Arc<ProcessHandle>> {
        self.handles.get(identity).map(|h| h.clone())
    }

    /// Drop handles whose child has exited, returning how many were evicted
    pub fn prune(&self) -> usize {
        let before = self.handles.len();
        self.handles.retain(|_, handle| handle.is_alive());
        let evicted = before.saturating_sub(self.handles.len());
        if evicted > 0 {
            debug!(evicted, "Evicted dead handler processes");
        }
        evicted
    }

    /// Release the handle for `identity`.
    ///
    /// The child sees end of input once no invocation holds the handle.
    pub fn release(&self, identity: &HandlerIdentity) -> bool {
        self.handles.remove(identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }
}
