/// Flags negative readings and sudden spikes against a client's recent history.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyDetector {
    spike_threshold: f64,
    min_data_points: usize,
}

impl AnomalyDetector {
    pub fn new(spike_threshold: f64, min_data_points: usize) -> Self {
        Self {
            spike_threshold,
            min_data_points,
        }
    }

    /// Returns the anomaly reason, or `None` when `value` looks normal.
    ///
    /// `history` is the most recent valid values for the same client and
    /// metric; selecting them is the caller's job.
    pub fn detect(&self, value: f64, history: &[f64]) -> Option<String> {
        if value < 0.0 {
            return Some("negative value".to_string());
        }

        if history.is_empty() || history.len() < self.min_data_points {
            return None;
        }

        let average = history.iter().sum::<f64>() / history.len() as f64;

        // Idle or zero baselines would flag every non-zero reading.
        if average <= 0.0 {
            return None;
        }

        if value > self.spike_threshold * average {
            return Some(format!(
                "sudden spike detected: value {value:.2} exceeds {:.1}x rolling average {average:.2}",
                self.spike_threshold
            ));
        }

        None
    }
}
