//! Strategy — chase stake sizing and race eligibility rules.
//!
//! Both halves are pure: no I/O beyond loading rule files at startup.

pub mod eligibility;
pub mod stake;

pub use eligibility::{should_skip, EligibilityFilter, SkipReason};
pub use stake::{ceil_penny, StakeCalculator, StakeConfig};
