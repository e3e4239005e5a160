use std::fmt;
use std::sync::Arc;

/// Callback receiving (finished units, total units, message) as a batch of
/// queries advances.
#[derive(Clone)]
pub struct ProgressReporter {
    handler: Arc<dyn Fn(u64, u64, &str) + Sync + Send>,
}

impl ProgressReporter {
    pub fn new(handler: Arc<dyn Fn(u64, u64, &str) + Sync + Send>) -> Self {
        Self { handler }
    }

    pub fn noop() -> Self {
        Self::new(Arc::new(|_, _, _| {}))
    }

    pub fn report(&self, processed_count: u64, total_count: u64, message: &str) {
        let h = &self.handler;
        h(processed_count, total_count, message);
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressReporter")
    }
}
