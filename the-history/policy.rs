//! Grouping policy for the undo history.
//!
//! A [`Policy`] decides how long the history keeps events, when adjacent
//! edits fold into one undo step, and which host input may trigger undo.
//! Several policies can be merged with [`Policy::combine`]; numeric limits
//! take the smaller value and predicates are OR-ed.
//!
//! The numeric part is plain configuration and can be read from TOML:
//!
//! ```toml
//! min_depth = 200
//! new_group_delay_ms = 300
//! ```

use std::{
  fmt,
  sync::Arc,
  time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
  effect::EffectInverter,
  transaction::Transaction,
};

pub const DEFAULT_MIN_DEPTH: usize = 100;
pub const DEFAULT_NEW_GROUP_DELAY_MS: u64 = 500;

/// Decides whether a transaction joins the newest undo event. The flag says
/// whether its changes touch the ranges changed by that event.
pub type JoinPredicate = Arc<dyn Fn(&Transaction, bool) -> bool + Send + Sync>;

/// Returns true to veto host input before it reaches the history.
pub type InputFilter = Arc<dyn Fn(InputKind) -> bool + Send + Sync>;

/// Host input events the history reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
  HistoryUndo,
  HistoryRedo,
  Other,
}

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to parse history config: {0}")]
  Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
  /// The minimum amount of events to keep.
  pub min_depth:          usize,
  /// The longest gap, in milliseconds, between edits that still join.
  pub new_group_delay_ms: u64,
}

impl Default for HistoryConfig {
  fn default() -> Self {
    Self {
      min_depth:          DEFAULT_MIN_DEPTH,
      new_group_delay_ms: DEFAULT_NEW_GROUP_DELAY_MS,
    }
  }
}

impl HistoryConfig {
  pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
    Ok(toml::from_str(source)?)
  }
}

#[derive(Clone)]
pub struct Policy {
  min_depth:     usize,
  group_delay:   Duration,
  join_to_event: Option<JoinPredicate>,
  input_filter:  Option<InputFilter>,
  inverters:     Vec<Arc<dyn EffectInverter>>,
}

impl Default for Policy {
  fn default() -> Self {
    Self::from(HistoryConfig::default())
  }
}

impl From<HistoryConfig> for Policy {
  fn from(config: HistoryConfig) -> Self {
    let min_depth = if config.min_depth == 0 {
      tracing::warn!("history min_depth of 0 keeps nothing, using 1");
      1
    } else {
      config.min_depth
    };
    Self {
      min_depth,
      group_delay: Duration::from_millis(config.new_group_delay_ms),
      join_to_event: None,
      input_filter: None,
      inverters: Vec::new(),
    }
  }
}

impl fmt::Debug for Policy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Policy")
      .field("min_depth", &self.min_depth)
      .field("group_delay", &self.group_delay)
      .field("join_to_event", &self.join_to_event.is_some())
      .field("input_filter", &self.input_filter.is_some())
      .field("inverters", &self.inverters)
      .finish()
  }
}

impl Policy {
  pub fn min_depth(&self) -> usize {
    self.min_depth
  }

  pub fn group_delay(&self) -> Duration {
    self.group_delay
  }

  pub fn inverters(&self) -> &[Arc<dyn EffectInverter>] {
    &self.inverters
  }

  pub fn with_join_to_event(
    mut self,
    predicate: impl Fn(&Transaction, bool) -> bool + Send + Sync + 'static,
  ) -> Self {
    self.join_to_event = Some(Arc::new(predicate));
    self
  }

  pub fn with_input_filter(
    mut self,
    filter: impl Fn(InputKind) -> bool + Send + Sync + 'static,
  ) -> Self {
    self.input_filter = Some(Arc::new(filter));
    self
  }

  pub fn with_inverter(mut self, inverter: Arc<dyn EffectInverter>) -> Self {
    self.inverters.push(inverter);
    self
  }

  /// Whether `transaction` may join the newest event. Without a custom
  /// predicate only adjacent changes join.
  pub fn join_to_event(&self, transaction: &Transaction, adjacent: bool) -> bool {
    match &self.join_to_event {
      Some(predicate) => predicate(transaction, adjacent),
      None => adjacent,
    }
  }

  pub fn ignores_input(&self, input: InputKind) -> bool {
    self.input_filter.as_ref().is_some_and(|filter| filter(input))
  }

  /// Merge two policies. Limits take the smaller value, predicates accept
  /// when either accepts and inverters run in order, `self`'s first.
  pub fn combine(self, other: Policy) -> Policy {
    let join_to_event = match (self.join_to_event, other.join_to_event) {
      (Some(a), Some(b)) => {
        Some(Arc::new(move |tr: &Transaction, adjacent: bool| {
          a(tr, adjacent) || b(tr, adjacent)
        }) as JoinPredicate)
      },
      (a, b) => a.or(b),
    };
    let input_filter = match (self.input_filter, other.input_filter) {
      (Some(a), Some(b)) => Some(Arc::new(move |input: InputKind| a(input) || b(input)) as InputFilter),
      (a, b) => a.or(b),
    };
    let mut inverters = self.inverters;
    inverters.extend(other.inverters);

    Policy {
      min_depth: self.min_depth.min(other.min_depth),
      group_delay: self.group_delay.min(other.group_delay),
      join_to_event,
      input_filter,
      inverters,
    }
  }
}
