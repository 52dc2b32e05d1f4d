// SPDX-License-Identifier: MIT

//! Small pieces shared by every canopy crate: error conversion and test assertion macros,
//! plus a constant-memory running average.

pub mod macros;

#[derive(Debug, Clone, Default)]
/// A simple fraction struct that allows adding numbers to the numerator and denominator
///
/// If we want compute a rolling-average, we would naively hold all elements in a list and
/// compute the average from it. Instead we keep the sum of all elements and how many there
/// are, which is O(1) in both time and memory. Peers use this to average ping round trips.
pub struct FractionAvg {
    numerator: u64,
    denominator: u64,
}

impl FractionAvg {
    /// Creates a new fraction with the given numerator and denominator
    pub fn new(numerator: u64, denominator: u64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Adds a number to the numerator and increments the denominator
    pub fn add(&mut self, other: u64) {
        self.numerator = self.numerator.saturating_add(other);
        self.denominator += 1;
    }

    /// How many samples were added so far
    pub fn samples(&self) -> u64 {
        self.denominator
    }

    /// Returns the average of the fraction
    pub fn value(&self) -> f64 {
        if self.denominator == 0 {
            return 0.0;
        }

        self.numerator as f64 / self.denominator as f64
    }
}
