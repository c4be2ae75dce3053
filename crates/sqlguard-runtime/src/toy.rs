//! Toy replay: feed a fixed fragment sequence to one validator.
//!
//! Useful as a smoke test of a guard configuration without any model.

use serde::{Deserialize, Serialize};
use sqlguard_core::{ConstraintValidator, GuardConfig, GuardError, GuardSpec, Reason};
use std::collections::BTreeMap;
use std::time::Instant;

/// A statement that must survive the guard fragment by fragment.
pub const GOOD_SEQUENCE: &[&str] = &["SELECT ", "* ", "FROM ", "author", ";"];

/// A statement the guard must stop at its terminator.
pub const BAD_SEQUENCE: &[&str] = &["SELECT ", "FROM ", ";"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToyReport {
    pub name: String,
    pub n_steps: usize,
    pub ok_steps: usize,
    pub rejected_steps: usize,
    pub avg_step_ms: f64,
    pub reasons: BTreeMap<Reason, usize>,
}

/// Good and bad replays side by side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToyComparison {
    pub engine: String,
    pub dialect: String,
    pub good: ToyReport,
    pub bad: ToyReport,
}

/// Step through `fragments`, stopping at the first rejection.
pub fn replay(spec: &GuardSpec, name: &str, fragments: &[&str]) -> Result<ToyReport, GuardError> {
    let mut validator = spec.build()?;
    validator.reset();

    let mut ok_steps = 0;
    let mut rejected_steps = 0;
    let mut reasons = BTreeMap::new();

    let timer = Instant::now();
    for fragment in fragments {
        let outcome = validator.step(fragment)?;
        *reasons.entry(outcome.reason).or_insert(0) += 1;
        if outcome.accepted {
            ok_steps += 1;
        } else {
            rejected_steps += 1;
            break;
        }
    }
    let elapsed_ms = timer.elapsed().as_secs_f64() * 1000.0;

    Ok(ToyReport {
        name: name.to_string(),
        n_steps: fragments.len(),
        ok_steps,
        rejected_steps,
        avg_step_ms: elapsed_ms / fragments.len().max(1) as f64,
        reasons,
    })
}

/// Replay [`GOOD_SEQUENCE`] and [`BAD_SEQUENCE`] through a grammar guard.
pub fn compare(config: &GuardConfig) -> Result<ToyComparison, GuardError> {
    let spec = GuardSpec::Grammar(config.clone());
    Ok(ToyComparison {
        engine: "sqlguard".to_string(),
        dialect: config.dialect.clone(),
        good: replay(&spec, "sqlguard", GOOD_SEQUENCE)?,
        bad: replay(&spec, "sqlguard", BAD_SEQUENCE)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_comparison() {
        let comparison = compare(&GuardConfig::default()).unwrap();

        assert_eq!(comparison.dialect, "sqlite");

        let good = &comparison.good;
        assert_eq!(good.n_steps, 5);
        assert_eq!(good.ok_steps, 5);
        assert_eq!(good.rejected_steps, 0);
        assert_eq!(good.reasons.get(&Reason::ParseError), None);

        let bad = &comparison.bad;
        assert_eq!(bad.ok_steps, 2);
        assert_eq!(bad.rejected_steps, 1);
        assert_eq!(bad.reasons[&Reason::Incomplete], 2);
        assert_eq!(bad.reasons[&Reason::ParseError], 1);
    }

    #[test]
    fn test_replay_stops_at_first_rejection() {
        let spec = GuardSpec::Grammar(GuardConfig::default());
        let report = replay(&spec, "early", &["SELECT FROM ;", "ignored"]).unwrap();
        assert_eq!(report.n_steps, 2);
        assert_eq!(report.ok_steps, 0);
        assert_eq!(report.rejected_steps, 1);
    }

    #[test]
    fn test_replay_of_nothing() {
        let report = replay(&GuardSpec::default(), "empty", &[]).unwrap();
        assert_eq!(report.n_steps, 0);
        assert_eq!(report.avg_step_ms, 0.0);
    }
}
