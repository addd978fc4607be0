//! Scale reading stability check.

/// Accepts a reading once two consecutive samples agree within `tolerance` grams.
#[derive(Debug, Clone)]
pub struct StabilityFilter {
    tolerance: f64,
    last: Option<f64>,
}

impl StabilityFilter {
    #[must_use]
    pub fn new(tolerance: f64) -> Self {
        Self {
            tolerance,
            last: None,
        }
    }

    /// Feed one sample. Returns the stable weight once the previous sample agrees.
    pub fn push(&mut self, grams: f64) -> Option<f64> {
        if !grams.is_finite() {
            self.last = None;
            return None;
        }
        let stable = self
            .last
            .is_some_and(|previous| (grams - previous).abs() <= self.tolerance);
        self.last = Some(grams);
        stable.then_some(grams)
    }

    /// Forget the previous sample, e.g. after a missed reading.
    pub fn reset(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_equal_samples_are_stable() {
        let mut filter = StabilityFilter::new(0.02);
        assert_eq!(filter.push(12.4), None);
        assert_eq!(filter.push(12.4), Some(12.4));
    }

    #[test]
    fn test_drift_outside_tolerance() {
        let mut filter = StabilityFilter::new(0.02);
        assert_eq!(filter.push(11.0), None);
        assert_eq!(filter.push(12.0), None);
        assert_eq!(filter.push(12.05), None);
        assert_eq!(filter.push(12.06), Some(12.06));
    }

    #[test]
    fn test_reset_requires_two_fresh_samples() {
        let mut filter = StabilityFilter::new(0.5);
        filter.push(3.0);
        filter.reset();
        assert_eq!(filter.push(3.0), None);
        assert_eq!(filter.push(3.1), Some(3.1));
    }

    #[test]
    fn test_non_finite_sample_breaks_the_pair() {
        let mut filter = StabilityFilter::new(0.5);
        filter.push(3.0);
        assert_eq!(filter.push(f64::NAN), None);
        assert_eq!(filter.push(3.0), None);
    }
}
