//! Exclusive access to the microphone.
//!
//! Active-turn capture and background wake-word scanning share one input device.
//! Capture waits for the lock and signals any background holder to yield; the
//! background scanner only ever `try`-acquires, and never while a capture is waiting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicHolder {
    Background,
    Capture,
}

struct MicInner {
    device: Arc<Mutex<()>>,
    capture_waiting: AtomicUsize,
    preempt: Notify,
    holder: StdMutex<Option<MicHolder>>,
}

#[derive(Clone)]
pub struct MicrophoneLock {
    inner: Arc<MicInner>,
}

impl Default for MicrophoneLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Held while a component reads from the microphone. Releases on drop.
pub struct MicGuard {
    _device: OwnedMutexGuard<()>,
    inner: Arc<MicInner>,
    holder: MicHolder,
}

impl MicGuard {
    pub fn holder(&self) -> MicHolder {
        self.holder
    }
}

impl Drop for MicGuard {
    fn drop(&mut self) {
        let mut holder = self
            .inner
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *holder = None;
    }
}

/// Counts a pending capture; decremented even if the acquiring future is dropped.
struct WaitingTicket<'a>(&'a AtomicUsize);

impl Drop for WaitingTicket<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MicrophoneLock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MicInner {
                device: Arc::new(Mutex::new(())),
                capture_waiting: AtomicUsize::new(0),
                preempt: Notify::new(),
                holder: StdMutex::new(None),
            }),
        }
    }

    fn set_holder(&self, holder: MicHolder) {
        let mut slot = self
            .inner
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(holder);
    }

    /// Wait for the microphone on behalf of an active turn, pre-empting background scanning.
    pub async fn acquire_capture(&self) -> MicGuard {
        self.inner.capture_waiting.fetch_add(1, Ordering::SeqCst);
        let _ticket = WaitingTicket(&self.inner.capture_waiting);
        self.inner.preempt.notify_waiters();
        let device = Arc::clone(&self.inner.device).lock_owned().await;
        self.set_holder(MicHolder::Capture);
        debug!("microphone acquired for capture");
        MicGuard {
            _device: device,
            inner: Arc::clone(&self.inner),
            holder: MicHolder::Capture,
        }
    }

    /// Non-blocking acquisition for background scanning. `None` if busy or a capture is waiting.
    pub fn try_acquire_background(&self) -> Option<MicGuard> {
        if self.capture_pending() {
            return None;
        }
        let device = Arc::clone(&self.inner.device).try_lock_owned().ok()?;
        self.set_holder(MicHolder::Background);
        Some(MicGuard {
            _device: device,
            inner: Arc::clone(&self.inner),
            holder: MicHolder::Background,
        })
    }

    pub fn capture_pending(&self) -> bool {
        self.inner.capture_waiting.load(Ordering::SeqCst) > 0
    }

    /// Resolves once a capture asks for the microphone. Background holders race their
    /// scan window against this and yield when it fires.
    pub async fn preempted(&self) {
        loop {
            let notified = self.inner.preempt.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.capture_pending() {
                return;
            }
            notified.await;
        }
    }

    pub fn holder(&self) -> Option<MicHolder> {
        *self
            .inner
            .holder
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
