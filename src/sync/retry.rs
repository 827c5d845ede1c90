//! LIFO of sources that failed their first transfer attempt.

use parking_lot::Mutex;

#[derive(Debug, Default)]
pub struct RetryStack {
    items: Mutex<Vec<String>>,
}

impl RetryStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: impl Into<String>) {
        self.items.lock().push(item.into());
    }

    /// Most recently failed item first.
    pub fn pop(&self) -> Option<String> {
        self.items.lock().pop()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Drop everything still queued, returning how many items were discarded.
    pub fn clear(&self) -> usize {
        let mut items = self.items.lock();
        let n = items.len();
        items.clear();
        n
    }
}
