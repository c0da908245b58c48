use std::collections::VecDeque;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PredictionError {
    #[error(
        "acknowledgement {count} is below the trimmed history (counter {counter}, {pending} pending)"
    )]
    InvalidAcknowledgement {
        count: u32,
        counter: u32,
        pending: usize,
    },
}

type Action<S> = Box<dyn Fn(&mut S) + Send>;

/// Client-side inputs applied speculatively and replayed on top of every
/// authoritative state until the server acknowledges them.
pub struct InputPrediction<S> {
    actions: VecDeque<Action<S>>,
    counter: u32,
}

impl<S> Default for InputPrediction<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for InputPrediction<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputPrediction")
            .field("pending", &self.actions.len())
            .field("counter", &self.counter)
            .finish()
    }
}

impl<S> InputPrediction<S> {
    pub fn new() -> Self {
        Self {
            actions: VecDeque::new(),
            counter: 0,
        }
    }

    /// Queues `action` and returns the counter value the server will echo
    /// back once it has applied the same input.
    pub fn predict<F>(&mut self, action: F) -> u32
    where
        F: Fn(&mut S) + Send + 'static,
    {
        self.actions.push_back(Box::new(action));
        self.counter = self.counter.wrapping_add(1);
        self.counter
    }

    /// Drops every action issued at or before `count`.
    pub fn acknowledge(&mut self, count: u32) -> Result<(), PredictionError> {
        let Some(remaining) = self.counter.checked_sub(count) else {
            self.counter = count;
            self.actions.clear();
            return Ok(());
        };

        let remaining = remaining as usize;
        if remaining > self.actions.len() {
            return Err(PredictionError::InvalidAcknowledgement {
                count,
                counter: self.counter,
                pending: self.actions.len(),
            });
        }

        let acknowledged = self.actions.len() - remaining;
        self.actions.drain(..acknowledged);
        Ok(())
    }

    /// Re-applies every pending action, oldest first.
    pub fn replay(&self, state: &mut S) {
        for action in &self.actions {
            action(state);
        }
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }
}
