use crate::error::McmError;

/// Fold the errors of a fan-out into one.
///
/// Returns `None` when nothing failed. Sub-errors are kept whole so callers
/// can still inspect their kinds.
pub fn aggregate(errors: Vec<McmError>) -> Option<McmError> {
    if errors.is_empty() {
        None
    } else {
        Some(McmError::PartialFailure(errors))
    }
}

/// Outcome of a fan-out: every input lands in exactly one of the two lists.
#[derive(Debug)]
pub struct BatchResult<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<McmError>,
}

impl<T> Default for BatchResult<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }
}

impl<T> BatchResult<T> {
    pub fn success_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    pub fn total(&self) -> usize {
        self.success_count() + self.failure_count()
    }

    pub fn record(&mut self, outcome: Result<T, McmError>) {
        match outcome {
            Ok(v) => self.succeeded.push(v),
            Err(e) => self.failed.push(e),
        }
    }

    pub fn merge(&mut self, other: BatchResult<T>) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }

    /// Split into the successes and the aggregated error, if any.
    pub fn into_parts(self) -> (Vec<T>, Option<McmError>) {
        (self.succeeded, aggregate(self.failed))
    }
}

impl<T> FromIterator<Result<T, McmError>> for BatchResult<T> {
    fn from_iter<I: IntoIterator<Item = Result<T, McmError>>>(iter: I) -> Self {
        let mut batch = Self::default();
        for outcome in iter {
            batch.record(outcome);
        }
        batch
    }
}
