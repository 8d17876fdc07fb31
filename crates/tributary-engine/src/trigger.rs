//! Batch flush triggers: count, timeout, and a boolean condition, OR-combined.

use std::fmt;

use serde::{Deserialize, Serialize};

use tributary_expr::{Condition, Value, ValueType};
use tributary_types::{Result, TributaryError};

use crate::canonical::finite_f64;
use crate::clock::SharedClock;

/// Variables a trigger condition may reference.
pub const CONDITION_VARIABLES: &[(&str, ValueType)] = &[
    ("batch_count", ValueType::Number),
    ("batch_age_seconds", ValueType::Number),
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl TriggerSettings {
    pub fn count(count: usize) -> Self {
        Self {
            count: Some(count),
            ..Self::default()
        }
    }

    pub fn timeout(seconds: f64) -> Self {
        Self {
            timeout_seconds: Some(seconds),
            ..Self::default()
        }
    }

    pub fn condition(source: impl Into<String>) -> Self {
        Self {
            condition: Some(source.into()),
            ..Self::default()
        }
    }

    /// Check thresholds and compile the condition, if any.
    pub fn compile(&self) -> Result<Option<Condition>> {
        if self.count == Some(0) {
            return Err(TributaryError::ValidationError(
                "trigger count must be at least 1".into(),
            ));
        }
        if let Some(t) = self.timeout_seconds {
            if finite_f64("trigger timeout_seconds", t)? <= 0.0 {
                return Err(TributaryError::ValidationError(format!(
                    "trigger timeout_seconds must be positive, got {t}"
                )));
            }
        }
        self.condition
            .as_deref()
            .map(|src| Condition::compile(src, CONDITION_VARIABLES))
            .transpose()
    }
}

/// Which configured condition fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Count,
    Timeout,
    Condition,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TriggerType::Count => "count",
            TriggerType::Timeout => "timeout",
            TriggerType::Condition => "condition",
        })
    }
}

/// Decides when one aggregation batch should flush.
///
/// The owner must call [`reset`](Self::reset) after every flush, including
/// flushes it forces itself at end of source.
pub struct TriggerEvaluator {
    settings: TriggerSettings,
    condition: Option<Condition>,
    clock: SharedClock,
    batch_count: usize,
    batch_started_at: Option<f64>,
    last_triggered: Option<TriggerType>,
}

impl TriggerEvaluator {
    pub fn new(settings: TriggerSettings, clock: SharedClock) -> Result<Self> {
        let condition = settings.compile()?;
        Ok(Self {
            settings,
            condition,
            clock,
            batch_count: 0,
            batch_started_at: None,
            last_triggered: None,
        })
    }

    pub fn settings(&self) -> &TriggerSettings {
        &self.settings
    }

    /// Count one accepted row; the first row of a batch starts its age.
    pub fn record_accept(&mut self) {
        self.batch_count += 1;
        if self.batch_started_at.is_none() {
            self.batch_started_at = Some(self.clock.now());
        }
    }

    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// Seconds since the first row of the current batch, or 0 for an empty batch.
    pub fn batch_age_seconds(&self) -> f64 {
        self.batch_started_at
            .map(|start| (self.clock.now() - start).max(0.0))
            .unwrap_or(0.0)
    }

    /// Evaluate count, then timeout, then condition; the first that holds wins.
    pub fn should_trigger(&mut self) -> bool {
        self.last_triggered = self.evaluate();
        self.last_triggered.is_some()
    }

    fn evaluate(&self) -> Option<TriggerType> {
        if let Some(count) = self.settings.count {
            if self.batch_count >= count {
                return Some(TriggerType::Count);
            }
        }
        let age = self.batch_age_seconds();
        if let Some(timeout) = self.settings.timeout_seconds {
            if self.batch_started_at.is_some() && age >= timeout {
                return Some(TriggerType::Timeout);
            }
        }
        if let Some(condition) = &self.condition {
            let count = self.batch_count as f64;
            let fired = condition.evaluate(&|name: &str| match name {
                "batch_count" => Some(Value::Number(count)),
                "batch_age_seconds" => Some(Value::Number(age)),
                _ => None,
            });
            if fired {
                return Some(TriggerType::Condition);
            }
        }
        None
    }

    pub fn which_triggered(&self) -> Option<TriggerType> {
        self.last_triggered
    }

    pub fn reset(&mut self) {
        self.batch_count = 0;
        self.batch_started_at = None;
        self.last_triggered = None;
    }

    /// Reinstate a batch captured in a checkpoint.
    ///
    /// The age is restored relative to this evaluator's clock, so the batch
    /// keeps aging from where it was when the checkpoint was taken.
    pub fn restore_batch(&mut self, count: usize, elapsed_age_seconds: f64) {
        self.batch_count = count;
        self.batch_started_at = (count > 0).then(|| self.clock.now() - elapsed_age_seconds);
        self.last_triggered = None;
    }
}

impl fmt::Debug for TriggerEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerEvaluator")
            .field("settings", &self.settings)
            .field("batch_count", &self.batch_count)
            .field("batch_started_at", &self.batch_started_at)
            .field("last_triggered", &self.last_triggered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::Arc;

    fn evaluator(settings: TriggerSettings) -> (Arc<MockClock>, TriggerEvaluator) {
        let clock = Arc::new(MockClock::new(1_000.0));
        let eval = TriggerEvaluator::new(settings, clock.clone()).unwrap();
        (clock, eval)
    }

    #[test]
    fn count_trigger_fires_at_threshold() {
        let (_clock, mut eval) = evaluator(TriggerSettings::count(3));
        for _ in 0..2 {
            eval.record_accept();
        }
        assert!(!eval.should_trigger());
        assert_eq!(eval.which_triggered(), None);

        eval.record_accept();
        assert!(eval.should_trigger());
        assert_eq!(eval.which_triggered(), Some(TriggerType::Count));

        eval.reset();
        assert_eq!(eval.batch_count(), 0);
        assert_eq!(eval.batch_age_seconds(), 0.0);
        assert_eq!(eval.which_triggered(), None);
    }

    #[test]
    fn age_is_measured_from_first_accept() {
        let (clock, mut eval) = evaluator(TriggerSettings::timeout(10.0));
        clock.advance(100.0);
        assert_eq!(eval.batch_age_seconds(), 0.0);
        assert!(!eval.should_trigger());

        eval.record_accept();
        clock.advance(9.0);
        eval.record_accept();
        assert!(!eval.should_trigger());
        clock.advance(1.0);
        assert!(eval.should_trigger());
        assert_eq!(eval.which_triggered(), Some(TriggerType::Timeout));
    }

    #[test]
    fn reset_prevents_age_compounding_across_batches() {
        let (clock, mut eval) = evaluator(TriggerSettings::timeout(10.0));
        eval.record_accept();
        clock.advance(12.0);
        assert!(eval.should_trigger());
        eval.reset();

        eval.record_accept();
        clock.advance(3.0);
        assert!((eval.batch_age_seconds() - 3.0).abs() < 1e-9);
        assert!(!eval.should_trigger());
    }

    #[test]
    fn count_wins_over_timeout_in_the_same_call() {
        let mut settings = TriggerSettings::count(2);
        settings.timeout_seconds = Some(1.0);
        settings.condition = Some("batch_count >= 1".into());
        let (clock, mut eval) = evaluator(settings);
        eval.record_accept();
        eval.record_accept();
        clock.advance(5.0);
        assert!(eval.should_trigger());
        assert_eq!(eval.which_triggered(), Some(TriggerType::Count));
    }

    #[test]
    fn timeout_wins_over_condition() {
        let mut settings = TriggerSettings::timeout(1.0);
        settings.condition = Some("batch_count >= 1".into());
        let (clock, mut eval) = evaluator(settings);
        eval.record_accept();
        clock.advance(2.0);
        assert!(eval.should_trigger());
        assert_eq!(eval.which_triggered(), Some(TriggerType::Timeout));
    }

    #[test]
    fn condition_sees_count_and_age() {
        let (clock, mut eval) =
            evaluator(TriggerSettings::condition("batch_count >= 2 and batch_age_seconds > 0.5"));
        eval.record_accept();
        eval.record_accept();
        assert!(!eval.should_trigger());
        clock.advance(0.75);
        assert!(eval.should_trigger());
        assert_eq!(eval.which_triggered(), Some(TriggerType::Condition));
    }

    #[test]
    fn nothing_configured_never_fires() {
        let (clock, mut eval) = evaluator(TriggerSettings::default());
        eval.record_accept();
        clock.advance(1e6);
        assert!(!eval.should_trigger());
        assert_eq!(eval.which_triggered(), None);
    }

    #[test]
    fn invalid_settings_rejected() {
        let clock = Arc::new(MockClock::default());
        assert!(TriggerEvaluator::new(TriggerSettings::count(0), clock.clone()).is_err());
        assert!(TriggerEvaluator::new(TriggerSettings::timeout(-1.0), clock.clone()).is_err());
        assert!(matches!(
            TriggerEvaluator::new(TriggerSettings::timeout(f64::NAN), clock.clone()),
            Err(TributaryError::NonFiniteValue { .. })
        ));
        assert!(matches!(
            TriggerEvaluator::new(TriggerSettings::condition("rows > 1"), clock),
            Err(TributaryError::ExpressionError { .. })
        ));
    }

    #[test]
    fn restore_batch_continues_aging() {
        let (clock, mut eval) = evaluator(TriggerSettings::timeout(10.0));
        eval.restore_batch(4, 8.0);
        assert_eq!(eval.batch_count(), 4);
        assert!((eval.batch_age_seconds() - 8.0).abs() < 1e-9);
        clock.advance(2.0);
        assert!(eval.should_trigger());

        eval.restore_batch(0, 3.0);
        assert_eq!(eval.batch_age_seconds(), 0.0);
    }
}
