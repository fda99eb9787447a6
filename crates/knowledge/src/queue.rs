//! In-flight file tracking.
//!
//! A process-wide set of file ids currently being ingested. A record left in
//! `processing` whose id is not here belongs to a run that died.

use std::collections::HashSet;
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct ProcessingQueue {
    in_flight: Mutex<HashSet<String>>,
}

impl ProcessingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_started(&self, file_id: &str) {
        self.lock().insert(file_id.to_string());
        tracing::debug!("Processing started: {}", file_id);
    }

    pub fn mark_finished(&self, file_id: &str) {
        self.lock().remove(file_id);
        tracing::debug!("Processing finished: {}", file_id);
    }

    pub fn is_in_flight(&self, file_id: &str) -> bool {
        self.lock().contains(file_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Removes a file from the queue when dropped, so early returns and
/// cancellation never leave it marked in flight.
pub(crate) struct InFlightGuard<'q> {
    queue: &'q ProcessingQueue,
    file_id: String,
}

impl<'q> InFlightGuard<'q> {
    pub(crate) fn new(queue: &'q ProcessingQueue, file_id: &str) -> Self {
        queue.mark_started(file_id);
        Self {
            queue,
            file_id: file_id.to_string(),
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.queue.mark_finished(&self.file_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_finish() {
        let queue = ProcessingQueue::new();
        queue.mark_started("f1");
        assert!(queue.is_in_flight("f1"));
        assert_eq!(queue.len(), 1);
        queue.mark_finished("f1");
        assert!(!queue.is_in_flight("f1"));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_guard_clears_on_drop() {
        let queue = ProcessingQueue::new();
        {
            let _guard = InFlightGuard::new(&queue, "f2");
            assert!(queue.is_in_flight("f2"));
        }
        assert!(!queue.is_in_flight("f2"));
    }
}
