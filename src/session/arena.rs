// SPDX-License-Identifier: MIT
//! Preallocated single-writer append log.
//!
//! Slots are allocated once up front. The writer fills the slot at `len` and
//! then publishes it with a release store; readers only ever touch slots below
//! an acquire load of `len`, so a slot is never read while it is being written.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slots<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    len: AtomicUsize,
}

// SAFETY: slot access is partitioned by `len`. Only the unique `LogWriter`
// writes, and only to the slot at `len` before publishing it. Published slots
// are immutable and `T: Copy` means no destructor ever runs on them.
unsafe impl<T: Copy + Send> Send for Slots<T> {}
unsafe impl<T: Copy + Send + Sync> Sync for Slots<T> {}

/// Creates an empty log with room for `capacity` entries.
#[must_use]
pub fn append_log<T: Copy>(capacity: usize) -> (LogWriter<T>, LogReader<T>) {
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let shared = Arc::new(Slots {
        slots,
        len: AtomicUsize::new(0),
    });
    (
        LogWriter {
            shared: Arc::clone(&shared),
        },
        LogReader { shared },
    )
}

/// The only handle able to append. Deliberately not `Clone`.
pub struct LogWriter<T> {
    shared: Arc<Slots<T>>,
}

impl<T: Copy> LogWriter<T> {
    /// Appends `value`, returning its index, or gives the value back when the
    /// log is full.
    ///
    /// # Errors
    ///
    /// Returns `Err(value)` if every slot is already in use.
    pub fn push(&mut self, value: T) -> Result<usize, T> {
        let index = self.shared.len.load(Ordering::Relaxed);
        let Some(slot) = self.shared.slots.get(index) else {
            return Err(value);
        };
        // SAFETY: `index` is not yet published, so no reader can observe this
        // slot, and `&mut self` rules out a concurrent push.
        unsafe {
            (*slot.get()).write(value);
        }
        self.shared.len.store(index + 1, Ordering::Release);
        Ok(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.len() >= self.shared.slots.len()
    }

    #[must_use]
    pub fn last(&self) -> Option<T> {
        self.len().checked_sub(1).and_then(|i| read_slot(&self.shared, i))
    }
}

#[derive(Clone)]
pub struct LogReader<T> {
    shared: Arc<Slots<T>>,
}

impl<T: Copy> LogReader<T> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<T> {
        if index < self.len() {
            read_slot(&self.shared, index)
        } else {
            None
        }
    }

    #[must_use]
    pub fn last(&self) -> Option<T> {
        self.len().checked_sub(1).and_then(|i| read_slot(&self.shared, i))
    }

    /// Copies every published entry out of the log.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        (0..self.len()).filter_map(|i| self.get(i)).collect()
    }
}

fn read_slot<T: Copy>(shared: &Slots<T>, index: usize) -> Option<T> {
    let slot = shared.slots.get(index)?;
    // SAFETY: callers only pass indices below a published `len`, and
    // published slots are initialized and never written again.
    Some(unsafe { (*slot.get()).assume_init() })
}
