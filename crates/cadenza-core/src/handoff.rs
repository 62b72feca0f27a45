//! Lock-free next/current/old publication slot.
//!
//! Any object whose destruction is forbidden on the audio thread is handed
//! over through a [`Handoff`]: a control thread publishes a new value into
//! the **next** slot; the audio thread performs exactly one swap step per
//! block, moving next into **current** and the previous current into
//! **old**; the control thread reaps **old** between publishes and drops it
//! there.
//!
//! The load-bearing invariant is that **old** is empty whenever a value sits
//! in **next**. [`publish`](Handoff::publish) enforces it by draining old
//! (and any stale, never-activated next) before storing, so the audio-side
//! swap step never has anything to drop.
//!
//! All slot exchanges are release/acquire atomics via `arc_swap`; neither
//! side takes a lock.

use std::sync::Arc;

use arc_swap::ArcSwapOption;

/// Three-slot generational handoff between a control thread and the audio
/// thread.
pub struct Handoff<T> {
    next: ArcSwapOption<T>,
    current: ArcSwapOption<T>,
    old: ArcSwapOption<T>,
}

impl<T> Handoff<T> {
    pub fn new() -> Self {
        Self {
            next: ArcSwapOption::const_empty(),
            current: ArcSwapOption::const_empty(),
            old: ArcSwapOption::const_empty(),
        }
    }

    /// Publish a new value (control thread).
    ///
    /// Discards a previously published value the audio thread never picked
    /// up, and reaps the retired value if one is pending. Both are dropped
    /// here, on the calling thread.
    pub fn publish(&self, value: T) {
        drop(self.next.swap(None));
        drop(self.old.swap(None));
        self.next.store(Some(Arc::new(value)));
    }

    /// Perform one swap step and return the active value (audio thread).
    ///
    /// If a published value is waiting it becomes current and the previous
    /// current is parked in the old slot; nothing is dropped on this path.
    pub fn activate(&self) -> Option<Arc<T>> {
        if let Some(next) = self.next.swap(None) {
            let retired = self.current.swap(Some(next));
            let displaced = self.old.swap(retired);
            debug_assert!(
                displaced.is_none(),
                "old slot not reaped before a publish reached the audio thread"
            );
            drop(displaced);
        }
        self.current.load_full()
    }

    /// The active value without a swap step.
    pub fn current(&self) -> Option<Arc<T>> {
        self.current.load_full()
    }

    /// Take the retired value, if any (control thread). The caller drops it.
    pub fn reap(&self) -> Option<Arc<T>> {
        self.old.swap(None)
    }

    /// Whether a published value is waiting for the audio thread.
    pub fn has_pending(&self) -> bool {
        self.next.load().is_some()
    }

    /// Drain all three slots (teardown, no audio thread running).
    pub fn clear(&self) {
        drop(self.next.swap(None));
        drop(self.current.swap(None));
        drop(self.old.swap(None));
    }
}

impl<T> Default for Handoff<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_empty_handoff() {
        let h: Handoff<u32> = Handoff::new();
        assert!(h.activate().is_none());
        assert!(h.current().is_none());
        assert!(h.reap().is_none());
    }

    #[test]
    fn test_publish_activate_reap() {
        let h = Handoff::new();
        h.publish(1u32);
        assert!(h.has_pending());

        let active = h.activate().unwrap();
        assert_eq!(*active, 1);
        assert!(!h.has_pending());
        // Nothing retired yet
        assert!(h.reap().is_none());

        h.publish(2u32);
        let active = h.activate().unwrap();
        assert_eq!(*active, 2);
        // The first value is now retired
        assert_eq!(*h.reap().unwrap(), 1);
        assert!(h.reap().is_none());
    }

    #[test]
    fn test_stale_next_is_discarded() {
        let h = Handoff::new();
        h.publish(1u32);
        h.publish(2u32);
        // The audio thread only ever sees the latest publish
        assert_eq!(*h.activate().unwrap(), 2);
        assert!(h.reap().is_none());
    }

    #[test]
    fn test_activate_without_publish_keeps_current() {
        let h = Handoff::new();
        h.publish(7u32);
        assert_eq!(*h.activate().unwrap(), 7);
        assert_eq!(*h.activate().unwrap(), 7);
        assert!(h.reap().is_none());
    }

    struct DropCounter<'a>(&'a AtomicUsize);

    impl Drop for DropCounter<'_> {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_publish_drains_old_and_stale() {
        let drops = AtomicUsize::new(0);
        let h = Handoff::new();

        h.publish(DropCounter(&drops));
        h.activate();
        h.publish(DropCounter(&drops));
        h.activate();
        // First value is parked in old; the next publish must reap it
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        h.publish(DropCounter(&drops));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        // Stale next (never activated) is discarded by a further publish
        h.publish(DropCounter(&drops));
        assert_eq!(drops.load(Ordering::SeqCst), 2);

        h.clear();
        assert_eq!(drops.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_concurrent_publish_and_activate() {
        let h = Arc::new(Handoff::new());
        let publisher = {
            let h = Arc::clone(&h);
            std::thread::spawn(move || {
                for i in 0..1000u64 {
                    h.publish(i);
                    h.reap();
                }
            })
        };

        let mut last_seen = 0u64;
        for _ in 0..1000 {
            if let Some(v) = h.activate() {
                // Versions are observed in non-decreasing order
                assert!(*v >= last_seen);
                last_seen = *v;
            }
        }
        publisher.join().unwrap();
    }
}
