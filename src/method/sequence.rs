//! Ordered, validated list of method steps.

use super::step::{EndAction, MethodStep};
use crate::error::{AppResult, FplcError};
use serde::{Deserialize, Serialize};

/// A chromatography method: steps executed in order.
///
/// Every step is validated on the way in, so a sequence handed to the execution engine
/// never contains a step that cannot be turned into a run command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MethodSequence {
    steps: Vec<MethodStep>,
}

impl MethodSequence {
    /// Empty method.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from steps, validating each.
    pub fn from_steps(steps: Vec<MethodStep>) -> AppResult<Self> {
        for (index, step) in steps.iter().enumerate() {
            step.validate().map_err(|e| at_step(index, e))?;
        }
        Ok(Self { steps })
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the method has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Step at `index`.
    pub fn get(&self, index: usize) -> Option<&MethodStep> {
        self.steps.get(index)
    }

    /// All steps in order.
    pub fn steps(&self) -> &[MethodStep] {
        &self.steps
    }

    /// Iterate the steps in order.
    pub fn iter(&self) -> std::slice::Iter<'_, MethodStep> {
        self.steps.iter()
    }

    /// Total volume the method delivers (ml).
    pub fn total_volume(&self) -> f64 {
        self.steps.iter().map(|s| s.target_volume).sum()
    }

    /// Append a step.
    pub fn push(&mut self, step: MethodStep) -> AppResult<()> {
        step.validate()?;
        self.steps.push(step);
        Ok(())
    }

    /// Insert a step directly after `index`. On an empty method `index` is ignored.
    pub fn insert_after(&mut self, index: usize, step: MethodStep) -> AppResult<()> {
        step.validate()?;
        if self.steps.is_empty() {
            self.steps.push(step);
            return Ok(());
        }
        self.check_index(index)?;
        self.steps.insert(index + 1, step);
        Ok(())
    }

    /// Replace the step at `index`, returning the old one.
    pub fn replace(&mut self, index: usize, step: MethodStep) -> AppResult<MethodStep> {
        step.validate()?;
        self.check_index(index)?;
        Ok(std::mem::replace(&mut self.steps[index], step))
    }

    /// Remove the step at `index`.
    pub fn remove(&mut self, index: usize) -> AppResult<MethodStep> {
        self.check_index(index)?;
        Ok(self.steps.remove(index))
    }

    /// Change what happens after the step at `index`.
    pub fn set_end_action(&mut self, index: usize, end_action: EndAction) -> AppResult<()> {
        self.check_index(index)?;
        self.steps[index].end_action = end_action;
        Ok(())
    }

    /// Remove every step.
    pub fn clear(&mut self) {
        self.steps.clear();
    }

    fn check_index(&self, index: usize) -> AppResult<()> {
        if index >= self.steps.len() {
            return Err(FplcError::Validation(format!(
                "step {} does not exist (method has {} steps)",
                index + 1,
                self.steps.len()
            )));
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a MethodSequence {
    type Item = &'a MethodStep;
    type IntoIter = std::slice::Iter<'a, MethodStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

pub(crate) fn at_step(index: usize, error: FplcError) -> FplcError {
    match error {
        FplcError::Validation(msg) => FplcError::Validation(format!("step {}: {msg}", index + 1)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::protocol::ValvePosition;

    fn step(volume: f64) -> MethodStep {
        MethodStep::isocratic(ValvePosition::Load, 1.0, volume).unwrap()
    }

    #[test]
    fn insert_after_places_step_behind_index() {
        let mut method = MethodSequence::new();
        method.insert_after(0, step(1.0)).unwrap();
        method.push(step(3.0)).unwrap();
        method.insert_after(0, step(2.0)).unwrap();

        let volumes: Vec<f64> = method.iter().map(|s| s.target_volume).collect();
        assert_eq!(volumes, vec![1.0, 2.0, 3.0]);
        assert_eq!(method.total_volume(), 6.0);
    }

    #[test]
    fn edits_reject_out_of_range_indices() {
        let mut method = MethodSequence::from_steps(vec![step(1.0)]).unwrap();
        assert!(method.insert_after(1, step(2.0)).is_err());
        assert!(method.replace(3, step(2.0)).is_err());
        assert!(method.remove(1).is_err());
        assert!(method.set_end_action(1, EndAction::Stop).is_err());
        assert_eq!(method.len(), 1);
    }

    #[test]
    fn replace_remove_and_end_action() {
        let mut method = MethodSequence::from_steps(vec![step(1.0), step(2.0)]).unwrap();
        let old = method.replace(1, step(4.0)).unwrap();
        assert_eq!(old.target_volume, 2.0);

        method.set_end_action(0, EndAction::Pause).unwrap();
        assert_eq!(method.get(0).unwrap().end_action, EndAction::Pause);

        let removed = method.remove(0).unwrap();
        assert_eq!(removed.end_action, EndAction::Pause);
        assert_eq!(method.len(), 1);

        method.clear();
        assert!(method.is_empty());
    }

    #[test]
    fn invalid_step_is_not_inserted() {
        let mut method = MethodSequence::new();
        let mut bad = step(1.0);
        bad.flow_rate = 0.0;
        assert!(method.push(bad.clone()).is_err());
        let err = MethodSequence::from_steps(vec![step(1.0), bad]).unwrap_err();
        assert!(err.to_string().contains("step 2"));
        assert!(method.is_empty());
    }
}
