//! Auxiliary effects replayed by undo/redo.
//!
//! The history treats effects as opaque. It only needs to map them through
//! later document changes and to ask registered [`EffectInverter`]s which
//! effects undo a given transaction. Hosts implement both traits for
//! whatever non-text state they want the history to restore.

use std::{
  any::Any,
  borrow::Cow,
  fmt,
  sync::Arc,
};

use crate::{
  history::State,
  transaction::{
    ChangeSet,
    Transaction,
  },
};

pub type EffectRef = Arc<dyn Effect>;

pub trait Effect: fmt::Debug + Send + Sync {
  /// Re-express the effect after `changes`. `None` drops it.
  fn map(&self, changes: &ChangeSet) -> Option<EffectRef>;

  fn as_any(&self) -> &dyn Any;
}

/// Produces the effects that revert a transaction's effects.
///
/// Inverters run in registration order and their results are concatenated.
pub trait EffectInverter: Send + Sync {
  fn name(&self) -> Cow<'_, str>;

  /// `start` is the document state the transaction was applied to.
  fn invert(&self, transaction: &Transaction, start: &State) -> Vec<EffectRef>;
}

impl fmt::Debug for dyn EffectInverter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_tuple("EffectInverter").field(&self.name()).finish()
  }
}

pub(crate) fn invert_effects(
  inverters: &[Arc<dyn EffectInverter>],
  transaction: &Transaction,
  start: &State,
) -> Vec<EffectRef> {
  inverters
    .iter()
    .flat_map(|inverter| inverter.invert(transaction, start))
    .collect()
}

pub(crate) fn map_effects(effects: &[EffectRef], changes: &ChangeSet) -> Vec<EffectRef> {
  if changes.is_empty() {
    return effects.to_vec();
  }
  effects
    .iter()
    .filter_map(|effect| effect.map(changes))
    .collect()
}
