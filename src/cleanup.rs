//! Scoped compensation stack for multi-resource acquisition paths.

/// A stack of compensating actions executed in reverse order when the
/// guard is dropped, unless `release` was called first.
///
/// Used on every path that acquires several resources (lock, cgroup,
/// gofer process, host files) before reaching a committed state: each
/// acquisition pushes its undo, success releases the whole stack.
#[derive(Default)]
pub struct Cleanup {
    actions: Vec<Box<dyn FnOnce() + Send>>,
    released: bool,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a compensating action.
    pub fn push<F: FnOnce() + Send + 'static>(&mut self, f: F) {
        self.actions.push(Box::new(f));
    }

    /// Commits: no action will run.
    pub fn release(&mut self) {
        self.released = true;
        self.actions.clear();
    }

    /// Runs all pending actions immediately, newest first.
    pub fn run(&mut self) {
        while let Some(action) = self.actions.pop() {
            action();
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if !self.released {
            self.run();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_runs_in_reverse_on_drop() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        {
            let mut cu = Cleanup::new();
            for i in 0..3 {
                let order = Arc::clone(&order);
                cu.push(move || order.lock().unwrap().push(i));
            }
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_release_skips_actions() {
        let count = Arc::new(AtomicUsize::new(0));
        {
            let mut cu = Cleanup::new();
            let count = Arc::clone(&count);
            cu.push(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
            cu.release();
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
