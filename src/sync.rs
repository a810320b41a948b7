use core::{
    cell::UnsafeCell,
    future::poll_fn,
    ops::{Deref, DerefMut},
    task::Poll,
};

use portable_atomic::{AtomicU8, AtomicUsize, Ordering};

use atomic_waker::AtomicWaker;

/// One of the two processors sharing the memory region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Processor {
    /// The processor owning the radio and running the link layer.
    Radio,
    /// The processor running the application.
    Host,
}
impl Processor {
    const fn lock_word(self) -> u8 {
        match self {
            Self::Radio => Spinlock::<()>::RADIO,
            Self::Host => Spinlock::<()>::HOST,
        }
    }
}

/// A two party lock over a single word, which never waits.
///
/// Acquiring a busy lock fails immediately. The caller is expected to drop whatever it was
/// doing and try again on a later tick, since the two processors have no way of signalling
/// each other and no fairness guarantee.
pub struct Spinlock<T> {
    owner: AtomicU8,
    value: UnsafeCell<T>,
}
unsafe impl<T: Send> Sync for Spinlock<T> {}
impl<T> Spinlock<T> {
    const FREE: u8 = 0;
    const RADIO: u8 = 1;
    const HOST: u8 = 2;
    /// Number of compare-and-swap attempts, in case the CAS fails spuriously while the lock is
    /// observed as free.
    const ACQUIRE_ATTEMPTS: usize = 3;

    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicU8::new(Self::FREE),
            value: UnsafeCell::new(value),
        }
    }
    /// Try to acquire the lock on behalf of `processor`.
    ///
    /// Returns [None], if the lock is currently held by anyone, including the caller itself.
    pub fn try_lock(&self, processor: Processor) -> Option<SpinlockGuard<'_, T>> {
        let word = processor.lock_word();
        for _ in 0..Self::ACQUIRE_ATTEMPTS {
            match self.owner.compare_exchange_weak(
                Self::FREE,
                word,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(SpinlockGuard { lock: self }),
                // Somebody actually holds the lock, so retrying won't help.
                Err(current) if current != Self::FREE => return None,
                Err(_) => {}
            }
        }
        None
    }
    /// Run `f` with the lock held, or return [None] if it's busy.
    pub fn try_with<R>(&self, processor: Processor, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        self.try_lock(processor).map(|mut guard| f(&mut guard))
    }
    /// Returns the processor currently holding the lock.
    pub fn owner(&self) -> Option<Processor> {
        match self.owner.load(Ordering::Relaxed) {
            Self::RADIO => Some(Processor::Radio),
            Self::HOST => Some(Processor::Host),
            _ => None,
        }
    }
    /// Access the value without locking, which is fine, since we have exclusive access.
    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }
}

/// Proof of holding a [Spinlock]. The lock is released once this is dropped.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
}
impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.value.get() }
    }
}
impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.value.get() }
    }
}
impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner.store(Spinlock::<T>::FREE, Ordering::Release);
    }
}

/// A synchronization primitive, which allows queueing a number signals, to be awaited.
///
/// The producer of a ring rings this after every commit, so the consumer can either poll
/// [Doorbell::try_take] from its loop or await [Doorbell::wait].
pub struct Doorbell {
    waker: AtomicWaker,
    queued_signals: AtomicUsize,
}
impl Doorbell {
    pub const fn new() -> Self {
        Self {
            waker: AtomicWaker::new(),
            queued_signals: AtomicUsize::new(0),
        }
    }
    /// Increments the queued signals by one.
    pub fn ring(&self) {
        self.queued_signals.fetch_add(1, Ordering::Release);
        self.waker.wake();
    }
    /// Reset the amount of signals in the queue back to zero.
    pub fn reset(&self) {
        self.queued_signals.store(0, Ordering::Relaxed);
    }
    /// Returns the number of signals, that haven't been taken yet.
    pub fn pending(&self) -> usize {
        self.queued_signals.load(Ordering::Relaxed)
    }
    /// Take one signal, if there is one.
    pub fn try_take(&self) -> bool {
        self.queued_signals
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |queued| {
                queued.checked_sub(1)
            })
            .is_ok()
    }
    /// Asynchronously wait for the next signal.
    pub async fn wait(&self) {
        poll_fn(|cx| {
            if self.try_take() {
                return Poll::Ready(());
            }
            self.waker.register(cx.waker());
            // A signal may have arrived between the check and the registration.
            if self.try_take() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}
impl Default for Doorbell {
    fn default() -> Self {
        Self::new()
    }
}
