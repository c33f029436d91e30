//! Regime classifier.
//!
//! Scores each non-normal regime with a weighted rule table over typed
//! features, then shapes the winner's confidence with agreement and
//! stability adjustments.

pub mod classifier;
pub mod features;
pub mod rules;

pub use classifier::RegimeClassifier;
pub use features::RegimeFeatures;
pub use rules::{rule_table, Rule, RuleSet};
