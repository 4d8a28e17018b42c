// src/session/pump.rs

//! `SharedSession`: the lock-at-boundary wrapper giving the two execution
//! modes. Either the caller dispatches itself, or `start_pump` spawns a
//! thread that repeatedly dispatches in the background.
//!
//! Deliveries always happen outside the lock, so a callback may re-enter the
//! session API without deadlocking.

use super::dispatch::DispatchResult;
use super::{ClientRef, Session};
use crate::core::client::{ErrorClient, Handle};
use crate::core::errors::SessionError;
use crate::core::protocol::{DomainType, GenericMsg, PostMsg, RequestMsg};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error};

/// A clonable, thread-safe session reference.
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<Session>>,
}

impl SharedSession {
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    pub fn register_client(
        &self,
        request: RequestMsg,
        domain: DomainType,
        client: ClientRef,
        closure: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<Handle, SessionError> {
        self.inner.lock().register_client(request, domain, client, closure)
    }

    pub fn reissue(&self, handle: Handle, request: RequestMsg) -> Result<(), SessionError> {
        self.inner.lock().reissue(handle, request)
    }

    pub fn unregister(&self, handle: Handle) -> Result<(), SessionError> {
        self.inner.lock().unregister(handle)
    }

    pub fn submit_generic(&self, handle: Handle, msg: GenericMsg) -> Result<(), SessionError> {
        self.inner.lock().submit_generic(handle, msg)
    }

    pub fn submit_post(&self, handle: Handle, msg: PostMsg) -> Result<(), SessionError> {
        self.inner.lock().submit_post(handle, msg)
    }

    pub fn set_error_client(&self, client: Arc<dyn ErrorClient>) {
        self.inner.lock().set_error_client(client);
    }

    pub fn state(&self) -> super::SessionState {
        self.inner.lock().state()
    }

    pub fn item_count(&self) -> usize {
        self.inner.lock().item_count()
    }

    pub fn is_dictionary_ready(&self) -> bool {
        self.inner.lock().is_dictionary_ready()
    }

    pub fn uninitialize(&self) {
        self.inner.lock().uninitialize();
    }

    /// Runs one dispatch iteration. The lock is held only for the mutation
    /// half; callbacks run after it is released.
    pub fn dispatch(&self, timeout: Duration) -> Result<DispatchResult, SessionError> {
        let (result, deliveries) = {
            let mut session = self.inner.lock();
            let result = session.dispatch_collect(timeout)?;
            (result, session.take_deliveries())
        };
        for delivery in deliveries {
            delivery.deliver();
        }
        Ok(result)
    }

    /// Spawns the background pump thread. Dropping or stopping the returned
    /// handle ends the loop.
    pub fn start_pump(&self) -> PumpHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let inner = self.inner.clone();
        let timeout = inner.lock().config.pump_timeout;
        let thread = std::thread::spawn(move || {
            debug!("Session pump started");
            while !flag.load(Ordering::Relaxed) {
                let collected = {
                    let mut session = inner.lock();
                    match session.dispatch_collect(timeout) {
                        Ok(_) => session.take_deliveries(),
                        Err(e) => {
                            error!("Dispatch failed in pump thread: {e}");
                            break;
                        }
                    }
                };
                for delivery in collected {
                    delivery.deliver();
                }
            }
            debug!("Session pump stopped");
        });
        PumpHandle {
            stop,
            thread: Some(thread),
        }
    }
}

/// Controls the background pump thread.
pub struct PumpHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl PumpHandle {
    /// Signals the pump to stop and waits for the thread to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for PumpHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}
