//! Quality diagnostics for sortings, rendered into preview bundles.

pub mod autocorrelogram;
pub mod separation;

pub use autocorrelogram::{autocorrelogram_counts, unit_autocorrelograms, Autocorrelogram};
pub use separation::{cluster_separation, SeparationItem, SEPARATION_NEIGHBORS};
