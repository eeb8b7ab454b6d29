use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out strictly increasing identifiers from any thread.
///
/// Used for outbound message sequence numbers and for breakpoint ids, so a
/// value is never issued twice within one session.
#[derive(Debug)]
pub struct SequenceAllocator {
    next: AtomicU64,
    step: u64,
}

impl SequenceAllocator {
    pub fn new(start: u64, step: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
            step: step.max(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(self.step, Ordering::Relaxed)
    }
}

impl Default for SequenceAllocator {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_monotonic_with_step() {
        let seq = SequenceAllocator::new(2, 2);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.next(), 4);
        assert_eq!(seq.next(), 6);
    }

    #[test]
    fn test_unique_across_threads() {
        let seq = Arc::new(SequenceAllocator::default());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let seq = Arc::clone(&seq);
                thread::spawn(move || (0..250).map(|_| seq.next()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 1000);
    }
}
