use serde::{Deserialize, Serialize};

/// Per-parameter metadata as the minimizer sees it.
///
/// Identity of a parameter is its index in the settings list; the order is
/// fixed once the first job is registered.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterSettings {
    pub value: f64,
    pub step_size: f64,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
    pub is_constant: bool,
}

impl ParameterSettings {
    pub fn new(value: f64, step_size: f64) -> Self {
        Self {
            value,
            step_size,
            lower_bound: None,
            upper_bound: None,
            is_constant: false,
        }
    }

    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower_bound = Some(lower);
        self.upper_bound = Some(upper);
        self
    }

    pub fn fixed(value: f64) -> Self {
        Self {
            value,
            step_size: 0.0,
            lower_bound: None,
            upper_bound: None,
            is_constant: true,
        }
    }

    pub fn has_limits(&self) -> bool {
        self.lower_bound.is_some() || self.upper_bound.is_some()
    }
}

/// Indices of the floating parameters, in settings order.
pub fn free_indices(settings: &[ParameterSettings]) -> Vec<usize> {
    settings
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_constant)
        .map(|(ix, _)| ix)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_indices_skip_constants() {
        let settings = vec![
            ParameterSettings::new(0.0, 0.1),
            ParameterSettings::fixed(1.0),
            ParameterSettings::new(2.0, 0.1).with_bounds(-3.0, 3.0),
        ];
        assert_eq!(free_indices(&settings), vec![0, 2]);
        assert!(settings[2].has_limits());
        assert!(!settings[0].has_limits());
    }
}
