//! Weighted progress reporting for download/unpack phases.

/// Receives progress increments. The sum of all deltas reported to one sink
/// over one operation does not exceed 100.
pub trait Progress: Send + Sync {
    fn advance(&self, percent_delta: f64);
}

/// Scales a child phase into a fraction of the parent operation.
pub struct SubProgress<'a> {
    parent: &'a dyn Progress,
    weight: f64,
}

impl<'a> SubProgress<'a> {
    pub fn new(parent: &'a dyn Progress, weight: f64) -> Self {
        Self { parent, weight }
    }
}

impl Progress for SubProgress<'_> {
    fn advance(&self, percent_delta: f64) {
        self.parent.advance(percent_delta * self.weight);
    }
}

/// Discards all reports. Used when the caller did not ask for progress.
pub struct NoProgress;

impl Progress for NoProgress {
    fn advance(&self, _percent_delta: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<f64>);

    impl Progress for Recorder {
        fn advance(&self, percent_delta: f64) {
            *self.0.lock().expect("recorder lock") += percent_delta;
        }
    }

    #[test]
    fn sub_progress_scales_into_parent() {
        let parent = Recorder(Mutex::new(0.0));
        {
            let download = SubProgress::new(&parent, 0.8);
            let unpack = SubProgress::new(&parent, 0.2);
            download.advance(100.0);
            unpack.advance(100.0);
        }
        let total = *parent.0.lock().expect("recorder lock");
        assert!((total - 100.0).abs() < 1e-9);
    }
}
