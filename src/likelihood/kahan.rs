use serde::{Deserialize, Serialize};

/// Compensated floating-point accumulator.
///
/// Tracks a running low-order correction so that adding many terms of
/// disparate magnitude loses as little precision as possible. The carry is
/// part of the value: partition results ship `(sum, carry)` pairs so the
/// master-side reduction can continue the compensated sum exactly where a
/// task left off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct KahanSum {
    sum: f64,
    carry: f64,
}

impl KahanSum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume an accumulation from a previously produced `(sum, carry)`.
    pub fn from_parts(sum: f64, carry: f64) -> Self {
        Self { sum, carry }
    }

    pub fn add(&mut self, term: f64) {
        let y = term - self.carry;
        let t = self.sum + y;
        self.carry = (t - self.sum) - y;
        self.sum = t;
    }

    /// Fold in another partial sum together with its own carry.
    pub fn add_carried(&mut self, sum: f64, carry: f64) {
        let y = sum - (self.carry + carry);
        let t = self.sum + y;
        self.carry = (t - self.sum) - y;
        self.sum = t;
    }

    /// Subtract an offset that carries its own compensation term.
    pub fn subtract_carried(&mut self, sum: f64, carry: f64) {
        let y = -sum - (self.carry + carry);
        let t = self.sum + y;
        self.carry = (t - self.sum) - y;
        self.sum = t;
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn carry(&self) -> f64 {
        self.carry
    }
}
