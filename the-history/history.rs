//! The undo history.
//!
//! [`HistoryState`] keeps two branches of [`HistoryEvent`]s: `done`, the
//! events undo walks back through, and `undone`, the events redo replays.
//! Every transaction applied to the document is fed to
//! [`HistoryState::apply`] together with the state it was applied to:
//!
//! - recorded transactions become a new event, or fold into the newest one
//!   when the [`Policy`] says they belong to the same edit;
//! - selection-only transactions append their start selection to the newest
//!   event so that selection undo can walk back through cursor moves;
//! - transactions kept out of the history rebase every stored event over their
//!   changes (lazily, see below);
//! - undo/redo transactions, produced by [`HistoryState::pop`], carry a
//!   [`Replay`] marker and move one event between the branches.
//!
//! Events store the *inverse* of the changes they recorded, so popping an
//! event yields the transaction that reverts it.
//!
//! # Pending remaps
//!
//! Rebasing every stored event on each unrecorded transaction would cost
//! O(depth) per keystroke. Instead only the newest event is rebased and the
//! mapping that was applied to it is kept in its `mapped` field. When that
//! event is popped, the next one down is rebased over the stored mapping.
//! Events whose changes map to nothing are dropped, and their selections are
//! carried over to the event below.
//!
//! Branches are immutable `Arc` slices of `Arc`ed events. Cloning a
//! [`HistoryState`] is cheap and states share unchanged events.

use std::{
  sync::Arc,
  time::{
    Duration,
    Instant,
  },
};

use ropey::Rope;
use serde::{
  Deserialize,
  Serialize,
};
use thiserror::Error;
use tracing::{
  debug,
  trace,
};

use crate::{
  Tendril,
  effect::{
    EffectInverter,
    EffectRef,
    invert_effects,
    map_effects,
  },
  policy::Policy,
  selection::{
    Selection,
    SelectionError,
  },
  transaction::{
    ChangeSet,
    Isolation,
    Transaction,
    TransactionError,
    user_event_is,
  },
};

/// Result type for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Selections kept per event, oldest dropped first.
pub const MAX_SELECTIONS_PER_EVENT: usize = 200;

/// How far past the minimum depth a branch may grow before it is cut back.
pub const DEPTH_OVERFLOW: usize = 20;

/// Errors that can occur during history operations.
#[derive(Debug, Error)]
pub enum HistoryError {
  #[error("transaction error: {0}")]
  Transaction(#[from] TransactionError),
  #[error("selection error: {0}")]
  Selection(#[from] SelectionError),
  #[error("{branch} event {index} is empty")]
  EmptyEvent { branch: Side, index: usize },
  #[error("invalid {branch} event {index}: {reason}")]
  InvalidEvent {
    branch: Side,
    index:  usize,
    reason: &'static str,
  },
  #[error("history json error: {0}")]
  Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct State {
  pub doc:       Rope,
  pub selection: Selection,
}

/// One of the two history branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
  Done,
  Undone,
}

impl Side {
  pub fn opposite(self) -> Self {
    match self {
      Side::Done => Side::Undone,
      Side::Undone => Side::Done,
    }
  }

  fn user_event(self) -> &'static str {
    match self {
      Side::Done => "undo",
      Side::Undone => "redo",
    }
  }

  fn selection_user_event(self) -> &'static str {
    match self {
      Side::Done => "select.undo",
      Side::Undone => "select.redo",
    }
  }
}

impl std::fmt::Display for Side {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(match self {
      Side::Done => "done",
      Side::Undone => "undone",
    })
  }
}

/// Marks a transaction produced by [`HistoryState::pop`]. Feeding the
/// transaction back to [`HistoryState::apply`] installs `rest` as the popped
/// branch and records the transaction on the opposite one.
#[derive(Debug, Clone)]
pub struct Replay {
  side:      Side,
  rest:      Branch,
  selection: Selection,
}

impl Replay {
  /// The branch the event was popped from.
  pub fn side(&self) -> Side {
    self.side
  }

  /// What is left of that branch.
  pub fn rest(&self) -> &Branch {
    &self.rest
  }

  /// The selection to restore when the replay itself is reverted.
  pub fn selection(&self) -> &Selection {
    &self.selection
  }
}

/// A single undo step.
///
/// An event without changes only carries selections. Such placeholders only
/// ever sit at the bottom of a branch, recording cursor moves made before the
/// first edit.
#[derive(Debug, Clone)]
pub struct HistoryEvent {
  /// Inverse of the recorded changes. Applies to the document as it was right
  /// after the event, rebased over `mapped` if set.
  changes:          Option<ChangeSet>,
  effects:          Vec<EffectRef>,
  /// Unrecorded changes made since the event, still to be applied to the
  /// events below it.
  mapped:           Option<ChangeSet>,
  /// The selection before the event. Set whenever `changes` is.
  start_selection:  Option<Selection>,
  /// Selections the user moved through after the event, oldest first.
  selections_after: Vec<Selection>,
}

impl HistoryEvent {
  fn selection(selections_after: Vec<Selection>) -> Self {
    Self {
      changes: None,
      effects: Vec::new(),
      mapped: None,
      start_selection: None,
      selections_after,
    }
  }

  /// Build the event reverting `transaction`, which was applied to `start`.
  /// Returns `None` for transactions without changes or invertible effects.
  fn from_transaction(
    transaction: &Transaction,
    start: &State,
    selection: Option<&Selection>,
    inverters: &[Arc<dyn EffectInverter>],
  ) -> Result<Option<Self>> {
    let effects = invert_effects(inverters, transaction, start);
    if effects.is_empty() && transaction.changes().is_empty() {
      return Ok(None);
    }

    let changes = if transaction.changes().is_empty() {
      ChangeSet::identity(start.doc.len_chars())
    } else {
      transaction.changes().invert(&start.doc)?
    };

    Ok(Some(Self {
      changes: Some(changes),
      effects,
      mapped: None,
      start_selection: Some(selection.unwrap_or(&start.selection).clone()),
      selections_after: Vec::new(),
    }))
  }

  pub fn changes(&self) -> Option<&ChangeSet> {
    self.changes.as_ref()
  }

  pub fn effects(&self) -> &[EffectRef] {
    &self.effects
  }

  pub fn mapped(&self) -> Option<&ChangeSet> {
    self.mapped.as_ref()
  }

  pub fn start_selection(&self) -> Option<&Selection> {
    self.start_selection.as_ref()
  }

  pub fn selections_after(&self) -> &[Selection] {
    &self.selections_after
  }

  /// Whether undoing this event would change anything.
  fn is_live(&self) -> bool {
    self.changes.as_ref().is_some_and(|changes| !changes.is_empty()) || !self.effects.is_empty()
  }

  fn with_selections_after(&self, selections_after: Vec<Selection>) -> Self {
    Self {
      selections_after,
      ..self.clone()
    }
  }

  /// Rebase the event over `mapping`, a change set applying to the document
  /// the event's changes apply to. `extra` selections, already expressed in
  /// the mapped document, are appended to the mapped selections.
  fn map(&self, mapping: &ChangeSet, extra: Vec<Selection>) -> Result<Self> {
    let mut selections = self
      .selections_after
      .iter()
      .map(|selection| selection.clone().map(mapping))
      .collect::<std::result::Result<Vec<_>, _>>()?;
    selections.extend(extra);

    let Some(changes) = &self.changes else {
      return Ok(Self::selection(selections));
    };

    let mapped_changes = changes.map(mapping, false)?;
    let before = mapping.map(changes, true)?;
    let start_selection = self
      .start_selection
      .clone()
      .map(|selection| selection.map(&before))
      .transpose()?;
    let mapped = match &self.mapped {
      Some(mapped) => mapped.clone().compose(before)?,
      None => before,
    };

    Ok(Self {
      changes: Some(mapped_changes),
      effects: map_effects(&self.effects, mapping),
      mapped: Some(mapped),
      start_selection,
      selections_after: selections,
    })
  }
}

/// An immutable list of events, oldest first.
#[derive(Debug, Clone)]
pub struct Branch {
  events: Arc<[Arc<HistoryEvent>]>,
}

impl Default for Branch {
  fn default() -> Self {
    Self {
      events: Arc::from(Vec::new()),
    }
  }
}

impl From<Vec<Arc<HistoryEvent>>> for Branch {
  fn from(events: Vec<Arc<HistoryEvent>>) -> Self {
    Self {
      events: Arc::from(events),
    }
  }
}

impl Branch {
  pub fn len(&self) -> usize {
    self.events.len()
  }

  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }

  pub fn events(&self) -> &[Arc<HistoryEvent>] {
    &self.events
  }

  pub fn last(&self) -> Option<&HistoryEvent> {
    self.events.last().map(Arc::as_ref)
  }

  /// Number of undoable events, not counting a selection placeholder.
  pub fn depth(&self) -> usize {
    let placeholder = self
      .events
      .first()
      .is_some_and(|event| event.changes.is_none());
    self.len() - usize::from(placeholder)
  }

  fn has_changes(&self) -> bool {
    self.events.iter().any(|event| event.changes.is_some())
  }

  /// The first `to` events plus `event`, cut back to `min_depth` events once
  /// the branch outgrows it by more than [`DEPTH_OVERFLOW`].
  fn update(&self, to: usize, min_depth: usize, event: HistoryEvent) -> Self {
    let start = if to + 1 > min_depth + DEPTH_OVERFLOW {
      to + 1 - min_depth
    } else {
      0
    };
    if start > 0 {
      debug!(dropped = start, "history branch outgrew its depth");
    }
    let mut events = self.events[start..to].to_vec();
    events.push(Arc::new(event));
    Self::from(events)
  }

  fn replace_last(&self, event: HistoryEvent) -> Self {
    let mut events = self.events.to_vec();
    match events.last_mut() {
      Some(last) => *last = Arc::new(event),
      None => events.push(Arc::new(event)),
    }
    Self::from(events)
  }

  fn add_selection(&self, selection: &Selection) -> Self {
    let Some(last) = self.last() else {
      return Self::from(vec![Arc::new(HistoryEvent::selection(vec![
        selection.clone(),
      ]))]);
    };
    if last.selections_after.last() == Some(selection) {
      return self.clone();
    }

    let keep_from = last
      .selections_after
      .len()
      .saturating_sub(MAX_SELECTIONS_PER_EVENT - 1);
    let mut selections = last.selections_after[keep_from..].to_vec();
    selections.push(selection.clone());
    self.replace_last(last.with_selections_after(selections))
  }

  fn pop_selection(&self) -> Self {
    let Some(last) = self.last() else {
      return self.clone();
    };
    let mut selections = last.selections_after.clone();
    selections.pop();
    self.replace_last(last.with_selections_after(selections))
  }

  /// Rebase the newest surviving event over `mapping`. Events mapped to
  /// nothing are dropped and their selections move to the event below.
  fn add_mapping(&self, mapping: &ChangeSet) -> Result<Self> {
    let mut mapping = mapping.clone();
    let mut selections = Vec::new();
    let mut length = self.len();

    while length > 0 {
      let event = self.events[length - 1].map(&mapping, selections)?;
      if event.is_live() {
        let mut events = self.events[..length - 1].to_vec();
        events.push(Arc::new(event));
        return Ok(Self::from(events));
      }

      trace!(index = length - 1, "history event mapped away");
      length -= 1;
      selections = event.selections_after;
      if let Some(mapped) = event.mapped {
        mapping = mapped;
      }
    }

    Ok(if selections.is_empty() {
      Self::default()
    } else {
      Self::from(vec![Arc::new(HistoryEvent::selection(selections))])
    })
  }
}

/// The undo history of one document.
#[derive(Debug, Clone, Default)]
pub struct HistoryState {
  done:            Branch,
  undone:          Branch,
  prev_time:       Option<Instant>,
  prev_user_event: Option<Tendril>,
}

impl HistoryState {
  pub fn done(&self) -> &Branch {
    &self.done
  }

  pub fn undone(&self) -> &Branch {
    &self.undone
  }

  pub fn branch(&self, side: Side) -> &Branch {
    match side {
      Side::Done => &self.done,
      Side::Undone => &self.undone,
    }
  }

  /// Record `transaction`, which was applied to `start`.
  pub fn apply(&self, transaction: &Transaction, start: &State, policy: &Policy) -> Result<Self> {
    if let Some(replay) = transaction.replay() {
      let event = HistoryEvent::from_transaction(
        transaction,
        start,
        Some(replay.selection()),
        policy.inverters(),
      )?;
      let other = self.branch(replay.side().opposite());
      let other = match event {
        Some(event) => other.update(other.len(), policy.min_depth(), event),
        None => other.add_selection(&start.selection),
      };
      trace!(side = %replay.side(), "replayed history event");

      let (done, undone) = match replay.side() {
        Side::Done => (replay.rest().clone(), other),
        Side::Undone => (other, replay.rest().clone()),
      };
      return Ok(Self {
        done,
        undone,
        prev_time: None,
        prev_user_event: None,
      });
    }

    let isolation = transaction.isolation();
    let mut state = if isolation.is_some_and(Isolation::before) {
      self.isolate()
    } else {
      self.clone()
    };

    if !transaction.add_to_history() {
      if transaction.changes().is_empty() {
        return Ok(state);
      }
      return state.add_mapping(transaction.changes());
    }

    let time = transaction.time();
    let user_event = transaction.user_event();
    match HistoryEvent::from_transaction(transaction, start, None, policy.inverters())? {
      Some(event) => {
        state = state.add_changes(event, time, user_event, policy, transaction)?;
      },
      None if transaction.selection().is_some() => {
        state = state.add_selection(&start.selection, time, user_event, policy.group_delay());
      },
      None => {},
    }

    if isolation.is_some_and(Isolation::after) {
      state = state.isolate();
    }
    Ok(state)
  }

  /// Forget the grouping context, so the next edit starts a new event.
  pub fn isolate(&self) -> Self {
    Self {
      done:            self.done.clone(),
      undone:          self.undone.clone(),
      prev_time:       None,
      prev_user_event: None,
    }
  }

  fn add_changes(
    self,
    event: HistoryEvent,
    time: Option<Instant>,
    user_event: Option<&str>,
    policy: &Policy,
    transaction: &Transaction,
  ) -> Result<Self> {
    let done = match self.done.last() {
      Some(last) if self.joins(last, &event, time, user_event, policy, transaction) => {
        let (Some(changes), Some(last_changes)) = (event.changes, &last.changes) else {
          unreachable!("joinable events carry changes");
        };
        let mut effects = event.effects;
        effects.extend(last.effects.iter().cloned());
        let joined = HistoryEvent {
          changes: Some(changes.compose(last_changes.clone())?),
          effects,
          mapped: last.mapped.clone(),
          start_selection: last.start_selection.clone(),
          selections_after: Vec::new(),
        };
        trace!(depth = self.done.len(), "joined edit with previous history event");
        self
          .done
          .update(self.done.len() - 1, policy.min_depth(), joined)
      },
      _ => {
        trace!(depth = self.done.len() + 1, "new history event");
        self.done.update(self.done.len(), policy.min_depth(), event)
      },
    };

    Ok(Self {
      done,
      undone: Branch::default(),
      prev_time: time,
      prev_user_event: user_event.map(Tendril::from),
    })
  }

  fn joins(
    &self,
    last: &HistoryEvent,
    event: &HistoryEvent,
    time: Option<Instant>,
    user_event: Option<&str>,
    policy: &Policy,
    transaction: &Transaction,
  ) -> bool {
    let (Some(last_changes), Some(changes)) = (&last.changes, &event.changes) else {
      return false;
    };
    if last_changes.is_empty() {
      return false;
    }
    if !user_event.is_none_or(|event| user_event_is(event, "input.type") || user_event_is(event, "delete")) {
      return false;
    }
    if user_event == Some("input.type.compose") {
      return true;
    }
    last.selections_after.is_empty()
      && within(time, self.prev_time, policy.group_delay())
      && policy.join_to_event(transaction, is_adjacent(last_changes, changes))
  }

  fn add_selection(
    self,
    selection: &Selection,
    time: Option<Instant>,
    user_event: Option<&str>,
    delay: Duration,
  ) -> Self {
    let coalesce = self
      .done
      .last()
      .and_then(|event| event.selections_after.last())
      .is_some_and(|last| {
        within(time, self.prev_time, delay)
          && user_event.is_some_and(|event| user_event_is(event, "select"))
          && user_event == self.prev_user_event.as_deref()
          && last.eq_shape(selection)
      });
    if coalesce {
      return self;
    }

    Self {
      done:            self.done.add_selection(selection),
      undone:          self.undone,
      prev_time:       time,
      prev_user_event: user_event.map(Tendril::from),
    }
  }

  /// Rebase both branches over changes kept out of the history.
  pub fn add_mapping(&self, mapping: &ChangeSet) -> Result<Self> {
    Ok(Self {
      done:            self.done.add_mapping(mapping)?,
      undone:          self.undone.add_mapping(mapping)?,
      prev_time:       self.prev_time,
      prev_user_event: self.prev_user_event.clone(),
    })
  }

  /// Build the transaction undoing (`Side::Done`) or redoing
  /// (`Side::Undone`) the newest event of `side`. With `only_selection` the
  /// newest recorded selection is restored instead, when there is one.
  ///
  /// The history itself is unchanged until the returned transaction is
  /// passed back through [`HistoryState::apply`].
  pub fn pop(&self, side: Side, state: &State, only_selection: bool) -> Result<Option<Transaction>> {
    let branch = self.branch(side);
    let Some(event) = branch.last() else {
      return Ok(None);
    };
    let selection = event
      .selections_after
      .first()
      .unwrap_or(&state.selection)
      .clone();

    if only_selection {
      if let Some(target) = event.selections_after.last() {
        let transaction = Transaction::new(&state.doc)
          .with_selection(target.clone())
          .with_user_event(side.selection_user_event())
          .with_replay(Replay {
            side,
            rest: branch.pop_selection(),
            selection,
          });
        return Ok(Some(transaction));
      }
    }

    let Some(changes) = &event.changes else {
      return Ok(None);
    };

    let mut rest = Branch::from(branch.events[..branch.len() - 1].to_vec());
    if let Some(mapped) = &event.mapped {
      rest = rest.add_mapping(mapped)?;
    }

    let mut transaction = Transaction::from(changes.clone())
      .with_effects(event.effects.iter().cloned())
      .with_user_event(side.user_event())
      .with_replay(Replay {
        side,
        rest,
        selection,
      });
    if let Some(start_selection) = &event.start_selection {
      transaction = transaction.with_selection(start_selection.clone());
    }
    debug!(%side, depth = branch.depth(), "popped history event");
    Ok(Some(transaction))
  }

  pub fn depth(&self, side: Side) -> usize {
    self.branch(side).depth()
  }

  pub fn undo_depth(&self) -> usize {
    self.done.depth()
  }

  pub fn redo_depth(&self) -> usize {
    self.undone.depth()
  }

  pub fn can_undo(&self) -> bool {
    self.done.has_changes()
  }

  pub fn can_redo(&self) -> bool {
    self.undone.has_changes()
  }

  /// Encode both branches as JSON. Effects are not encoded.
  pub fn to_json(&self) -> Result<serde_json::Value> {
    let json = HistoryJson {
      done:   self.done.events.iter().map(|e| EventJson::from(&**e)).collect(),
      undone: self.undone.events.iter().map(|e| EventJson::from(&**e)).collect(),
    };
    Ok(serde_json::to_value(json)?)
  }

  /// Decode branches written by [`HistoryState::to_json`]. The grouping
  /// context starts out empty.
  pub fn from_json(value: serde_json::Value) -> Result<Self> {
    let json: HistoryJson = serde_json::from_value(value)?;
    Ok(Self {
      done:            decode_branch(Side::Done, json.done)?,
      undone:          decode_branch(Side::Undone, json.undone)?,
      prev_time:       None,
      prev_user_event: None,
    })
  }
}

fn within(time: Option<Instant>, prev: Option<Instant>, delay: Duration) -> bool {
  match (time, prev) {
    (Some(time), Some(prev)) => time.saturating_duration_since(prev) < delay,
    _ => false,
  }
}

/// Whether the ranges touched by `b` touch the ranges touched by `a`. `a`
/// reverts the newest event and `b` reverts the incoming transaction, so the
/// document `b` applies to is the one `a` applies to.
fn is_adjacent(a: &ChangeSet, b: &ChangeSet) -> bool {
  let ranges: Vec<(usize, usize)> = a
    .iter_changed_ranges()
    .map(|(from, to, ..)| (from, to))
    .collect();
  b.iter_changed_ranges().any(|(_, _, from, to)| {
    ranges
      .iter()
      .any(|&(range_from, range_to)| to >= range_from && from <= range_to)
  })
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct HistoryJson {
  done:   Vec<EventJson>,
  undone: Vec<EventJson>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct EventJson {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  edit:             Option<ChangeSet>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pending_remap:    Option<ChangeSet>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  selection_before: Option<Selection>,
  selections_after: Vec<Selection>,
}

impl From<&HistoryEvent> for EventJson {
  fn from(event: &HistoryEvent) -> Self {
    Self {
      edit:             event.changes.clone(),
      pending_remap:    event.mapped.clone(),
      selection_before: event.start_selection.clone(),
      selections_after: event.selections_after.clone(),
    }
  }
}

fn decode_branch(side: Side, events: Vec<EventJson>) -> Result<Branch> {
  let invalid = |index, reason| {
    HistoryError::InvalidEvent {
      branch: side,
      index,
      reason,
    }
  };

  let mut branch = Vec::with_capacity(events.len());
  for (index, event) in events.into_iter().enumerate() {
    match (&event.edit, &event.selection_before) {
      (Some(_), None) => return Err(invalid(index, "edit without selectionBefore")),
      (None, Some(_)) => return Err(invalid(index, "selectionBefore without edit")),
      (None, _) if event.pending_remap.is_some() => {
        return Err(invalid(index, "pendingRemap without edit"));
      },
      // an empty bottom event is the placeholder left by selection undo
      (None, _) if index > 0 && event.selections_after.is_empty() => {
        return Err(HistoryError::EmptyEvent {
          branch: side,
          index,
        });
      },
      (None, _) if index > 0 => return Err(invalid(index, "selection-only event above the bottom")),
      _ => {},
    }
    if let (Some(edit), Some(mapped)) = (&event.edit, &event.pending_remap) {
      if mapped.len_after() != edit.len_after() {
        return Err(invalid(index, "pendingRemap does not end where edit ends"));
      }
    }

    let mut selections_after = event.selections_after;
    let overflow = selections_after
      .len()
      .saturating_sub(MAX_SELECTIONS_PER_EVENT);
    selections_after.drain(..overflow);

    branch.push(Arc::new(HistoryEvent {
      changes: event.edit,
      effects: Vec::new(),
      mapped: event.pending_remap,
      start_selection: event.selection_before,
      selections_after,
    }));
  }
  Ok(Branch::from(branch))
}

#[cfg(test)]
mod test {
  use quickcheck::quickcheck;

  use super::*;
  use crate::{
    effect::test::{
      Fold,
      FoldInverter,
      fold,
    },
    policy::HistoryConfig,
    transaction::Change,
  };

  struct Harness {
    state:   State,
    history: HistoryState,
    policy:  Policy,
    epoch:   Instant,
  }

  impl Harness {
    fn new(text: &str) -> Self {
      Self::with_policy(text, Policy::default())
    }

    fn with_policy(text: &str, policy: Policy) -> Self {
      Self {
        state: State {
          doc:       Rope::from(text),
          selection: Selection::point(0),
        },
        history: HistoryState::default(),
        policy,
        epoch: Instant::now(),
      }
    }

    fn at(&self, ms: u64) -> Instant {
      self.epoch + Duration::from_millis(ms)
    }

    fn dispatch(&mut self, transaction: Transaction) {
      let start = self.state.clone();
      transaction.apply(&mut self.state.doc).unwrap();
      self.state.selection = match transaction.selection() {
        Some(selection) => selection.clone(),
        None => start.selection.clone().map(transaction.changes()).unwrap(),
      };
      self.history = self
        .history
        .apply(&transaction, &start, &self.policy)
        .unwrap();
    }

    fn transaction(&self, changes: Vec<Change>, ms: u64) -> Transaction {
      Transaction::change(&self.state.doc, changes)
        .unwrap()
        .with_time(self.at(ms))
    }

    fn type_at(&mut self, pos: usize, text: &str, ms: u64) {
      let transaction = self
        .transaction(vec![(pos, pos, Some(text.into()))], ms)
        .with_user_event("input.type");
      self.dispatch(transaction);
    }

    fn select(&mut self, selection: Selection, event: &str, ms: u64) {
      let transaction = Transaction::new(&self.state.doc)
        .with_selection(selection)
        .with_user_event(event)
        .with_time(self.at(ms));
      self.dispatch(transaction);
    }

    fn select_untagged(&mut self, selection: Selection, ms: u64) {
      let transaction = Transaction::new(&self.state.doc)
        .with_selection(selection)
        .with_time(self.at(ms));
      self.dispatch(transaction);
    }

    fn pop(&mut self, side: Side, only_selection: bool) -> bool {
      match self.history.pop(side, &self.state, only_selection).unwrap() {
        Some(transaction) => {
          self.dispatch(transaction);
          true
        },
        None => false,
      }
    }

    fn undo(&mut self) -> bool {
      self.pop(Side::Done, false)
    }

    fn redo(&mut self) -> bool {
      self.pop(Side::Undone, false)
    }

    fn text(&self) -> String {
      self.state.doc.to_string()
    }
  }

  #[test]
  fn typing_within_delay_is_one_event() {
    let mut h = Harness::new("");
    h.type_at(0, "a", 0);
    h.type_at(1, "b", 50);
    assert_eq!(h.text(), "ab");
    assert_eq!(h.history.undo_depth(), 1);

    assert!(h.undo());
    assert_eq!(h.text(), "");
    assert_eq!(h.history.undo_depth(), 0);
    assert_eq!(h.history.redo_depth(), 1);

    assert!(h.redo());
    assert_eq!(h.text(), "ab");
    assert_eq!(h.state.selection, Selection::point(2));
  }

  #[test]
  fn typing_after_delay_starts_new_event() {
    let mut h = Harness::new("");
    h.type_at(0, "a", 0);
    h.type_at(1, "b", 600);
    assert_eq!(h.history.undo_depth(), 2);

    assert!(h.undo());
    assert_eq!(h.text(), "a");
    assert!(h.undo());
    assert_eq!(h.text(), "");
    assert!(!h.undo());
  }

  #[test]
  fn distant_edits_do_not_join() {
    let mut h = Harness::new("hello world");
    h.type_at(0, ">", 0);
    h.type_at(12, "!", 10);
    assert_eq!(h.history.undo_depth(), 2);
  }

  #[test]
  fn deleting_backwards_joins() {
    let mut h = Harness::new("abc");
    for (i, ms) in [(3, 0), (2, 40), (1, 80)] {
      let transaction = h
        .transaction(vec![(i - 1, i, None)], ms)
        .with_user_event("delete.backward");
      h.dispatch(transaction);
    }
    assert_eq!(h.text(), "");
    assert_eq!(h.history.undo_depth(), 1);
    assert!(h.undo());
    assert_eq!(h.text(), "abc");
  }

  #[test]
  fn other_user_events_never_join() {
    let mut h = Harness::new("aaa");
    h.type_at(3, "b", 0);
    let transaction = h
      .transaction(vec![(0, 3, Some("c".into()))], 10)
      .with_user_event("replace-all");
    h.dispatch(transaction);
    assert_eq!(h.text(), "cb");
    assert_eq!(h.history.undo_depth(), 2);
  }

  #[test]
  fn composition_always_joins() {
    let mut h = Harness::new("");
    h.type_at(0, "k", 0);
    let transaction = h
      .transaction(vec![(1, 1, Some("a".into()))], 5_000)
      .with_user_event("input.type.compose");
    h.dispatch(transaction);
    assert_eq!(h.history.undo_depth(), 1);
  }

  #[test]
  fn isolation_splits_events() {
    let mut h = Harness::new("");
    h.type_at(0, "a", 0);
    let transaction = h
      .transaction(vec![(1, 1, Some("b".into()))], 10)
      .with_user_event("input.type")
      .with_isolation(Isolation::After);
    h.dispatch(transaction);
    h.type_at(2, "c", 20);
    assert_eq!(h.history.undo_depth(), 2);

    let transaction = h
      .transaction(vec![(3, 3, Some("d".into()))], 30)
      .with_user_event("input.type")
      .with_isolation(Isolation::Before);
    h.dispatch(transaction);
    assert_eq!(h.history.undo_depth(), 3);

    assert!(h.undo());
    assert_eq!(h.text(), "abc");
    assert!(h.undo());
    assert_eq!(h.text(), "ab");
  }

  #[test]
  fn join_predicate_overrides_adjacency() {
    let policy = Policy::default().with_join_to_event(|_, _| true);
    let mut h = Harness::with_policy("hello world", policy);
    h.type_at(0, ">", 0);
    h.type_at(12, "!", 10);
    assert_eq!(h.history.undo_depth(), 1);
  }

  #[test]
  fn new_edit_clears_redo() {
    let mut h = Harness::new("");
    h.type_at(0, "a", 0);
    assert!(h.undo());
    assert!(h.history.can_redo());

    h.type_at(0, "b", 2_000);
    assert!(!h.history.can_redo());
    assert!(!h.redo());
    assert_eq!(h.text(), "b");
  }

  #[test]
  fn branch_is_cut_back_to_min_depth() {
    let policy = Policy::from(HistoryConfig {
      min_depth:          10,
      new_group_delay_ms: 0,
    });
    let mut h = Harness::with_policy("", policy);
    for i in 0..30 {
      h.type_at(i, "x", i as u64);
      assert!(h.history.done().len() <= 10 + DEPTH_OVERFLOW);
    }
    assert_eq!(h.history.undo_depth(), 30);

    h.type_at(30, "x", 30);
    assert_eq!(h.history.undo_depth(), 10);

    for i in 31..40 {
      h.type_at(i, "x", i as u64);
    }
    assert_eq!(h.history.undo_depth(), 19);

    let mut undone = 0;
    while h.undo() {
      undone += 1;
    }
    assert_eq!(undone, 19);
    assert_eq!(h.text(), "x".repeat(21));
  }

  #[test]
  fn selection_history_is_capped() {
    let mut h = Harness::new(&"x".repeat(300));
    h.type_at(0, "a", 0);
    assert_eq!(h.state.selection, Selection::point(1));

    for pos in 2..=251 {
      h.select(Selection::point(pos), "select", pos as u64 * 1_000);
    }

    let selections = h.history.done().last().unwrap().selections_after();
    assert_eq!(selections.len(), MAX_SELECTIONS_PER_EVENT);
    assert_eq!(selections.first(), Some(&Selection::point(51)));
    assert_eq!(selections.last(), Some(&Selection::point(250)));
  }

  #[test]
  fn selection_undo_walks_cursor_moves() {
    let mut h = Harness::new("hello world");
    h.type_at(0, ">", 0);
    h.select(Selection::point(4), "select", 1_000);
    h.select(Selection::single(6, 12), "select", 2_000);

    assert!(h.pop(Side::Done, true));
    assert_eq!(h.state.selection, Selection::point(4));
    assert_eq!(h.text(), ">hello world");

    assert!(h.pop(Side::Done, true));
    assert_eq!(h.state.selection, Selection::point(1));

    // no selections left, so the edit itself is undone
    assert!(h.pop(Side::Done, true));
    assert_eq!(h.text(), "hello world");

    assert!(h.redo());
    assert_eq!(h.text(), ">hello world");
    assert!(h.pop(Side::Undone, true));
    assert_eq!(h.state.selection, Selection::point(4));
  }

  #[test]
  fn selection_undo_before_any_edit() {
    let mut h = Harness::new("hello");
    h.select(Selection::point(3), "select", 0);
    assert_eq!(h.history.undo_depth(), 0);
    assert!(!h.history.can_undo());

    assert!(h.pop(Side::Done, true));
    assert_eq!(h.state.selection, Selection::point(0));
    assert!(!h.pop(Side::Done, true));
    assert!(!h.undo());
  }

  #[test]
  fn pointer_selections_coalesce() {
    let mut h = Harness::new("hello world");
    h.type_at(0, ">", 0);
    h.select(Selection::point(3), "select.pointer", 1_000);
    h.select(Selection::point(5), "select.pointer", 1_050);
    h.select(Selection::point(7), "select.pointer", 1_100);
    assert_eq!(h.history.done().last().unwrap().selections_after(), &[
      Selection::point(1)
    ]);

    // the recorded selection is the one being left, still a point here
    h.select(Selection::single(2, 8), "select.pointer", 1_150);
    assert_eq!(h.history.done().last().unwrap().selections_after().len(), 1);

    // leaving a range, which has another shape
    h.select(Selection::point(9), "select.pointer", 1_200);
    assert_eq!(h.history.done().last().unwrap().selections_after().len(), 2);

    // untagged selections never coalesce
    h.select_untagged(Selection::point(4), 1_250);
    h.select_untagged(Selection::point(5), 1_300);
    assert_eq!(h.history.done().last().unwrap().selections_after().len(), 4);
  }

  #[test]
  fn unrecorded_change_remaps_events() {
    let mut h = Harness::new("a");
    h.state.selection = Selection::point(1);
    h.type_at(1, "b", 0);
    assert_eq!(h.text(), "ab");

    let transaction = h
      .transaction(vec![(0, 0, Some("zz".into()))], 10)
      .skip_history();
    h.dispatch(transaction);
    assert_eq!(h.text(), "zzab");
    assert_eq!(h.history.undo_depth(), 1);

    assert!(h.undo());
    assert_eq!(h.text(), "zza");
    assert_eq!(h.state.selection, Selection::point(3));

    assert!(h.redo());
    assert_eq!(h.text(), "zzab");
  }

  #[test]
  fn remap_drops_deleted_event_and_keeps_selections() {
    let mut h = Harness::new("hello");
    h.type_at(0, "X", 0);
    h.state.selection = Selection::point(6);
    h.type_at(6, " world", 1_000);
    assert_eq!(h.text(), "Xhello world");
    assert_eq!(h.state.selection, Selection::point(12));
    h.select(Selection::point(2), "select", 2_000);

    let transaction = h.transaction(vec![(6, 12, None)], 3_000).skip_history();
    h.dispatch(transaction);
    assert_eq!(h.text(), "Xhello");

    assert_eq!(h.history.undo_depth(), 1);
    let event = h.history.done().last().unwrap();
    assert_eq!(event.selections_after(), &[Selection::point(6)]);

    assert!(h.undo());
    assert_eq!(h.text(), "hello");
    assert!(!h.undo());
  }

  #[test]
  fn pending_remap_reaches_older_events() {
    let mut h = Harness::new("one two");
    h.state.selection = Selection::point(3);
    h.type_at(3, "!", 0);
    h.state.selection = Selection::point(8);
    h.type_at(8, "?", 1_000);
    assert_eq!(h.text(), "one! two?");

    let transaction = h
      .transaction(vec![(0, 0, Some(">> ".into()))], 2_000)
      .skip_history();
    h.dispatch(transaction);
    // only the newest event is rebased right away
    assert!(h.history.done().events()[0].mapped().is_none());
    assert!(h.history.done().events()[1].mapped().is_some());

    assert!(h.undo());
    assert_eq!(h.text(), ">> one! two");
    assert!(h.history.done().events()[0].mapped().is_some());
    assert!(h.undo());
    assert_eq!(h.text(), ">> one two");

    assert!(h.redo());
    assert!(h.redo());
    assert_eq!(h.text(), ">> one! two?");
  }

  #[test]
  fn unrecorded_change_without_history_is_noop() {
    let mut h = Harness::new("abc");
    let transaction = h
      .transaction(vec![(0, 3, None)], 0)
      .skip_history();
    h.dispatch(transaction);
    assert!(h.history.done().is_empty());
    assert!(h.history.undone().is_empty());
  }

  #[test]
  fn effects_are_inverted_and_replayed() {
    let policy = Policy::default().with_inverter(Arc::new(FoldInverter));
    let mut h = Harness::with_policy("fn main() {}", policy);
    let transaction = Transaction::new(&h.state.doc).with_effect(Arc::new(Fold {
      pos:    10,
      folded: true,
    }));
    h.dispatch(transaction);
    assert_eq!(h.history.undo_depth(), 1);
    assert!(h.history.can_undo());

    let undo = h.history.pop(Side::Done, &h.state, false).unwrap().unwrap();
    assert_eq!(undo.effects().len(), 1);
    assert_eq!(fold(&undo.effects()[0]), Some(&Fold {
      pos:    10,
      folded: false,
    }));
    h.dispatch(undo);

    let redo = h.history.pop(Side::Undone, &h.state, false).unwrap().unwrap();
    assert_eq!(fold(&redo.effects()[0]).map(|f| f.folded), Some(true));
  }

  #[test]
  fn effects_follow_remaps() {
    let policy = Policy::default().with_inverter(Arc::new(FoldInverter));
    let mut h = Harness::with_policy("fn main() {}", policy);
    let transaction = h
      .transaction(vec![(0, 0, Some("pub ".into()))], 0)
      .with_effect(Arc::new(Fold {
        pos:    10,
        folded: true,
      }));
    h.dispatch(transaction);

    let transaction = h
      .transaction(vec![(0, 0, Some("// x\n".into()))], 10)
      .skip_history();
    h.dispatch(transaction);

    let event = h.history.done().last().unwrap();
    assert_eq!(fold(&event.effects()[0]).map(|f| f.pos), Some(15));
  }

  #[test]
  fn pop_leaves_history_untouched() {
    let mut h = Harness::new("");
    h.type_at(0, "a", 0);
    let before = h.history.clone();
    let _ = h.history.pop(Side::Done, &h.state, false).unwrap();
    assert_eq!(before.undo_depth(), h.history.undo_depth());
    assert_eq!(h.text(), "a");
  }

  #[test]
  fn json_round_trip() {
    let mut h = Harness::new("hello");
    h.select(Selection::point(2), "select", 0);
    h.type_at(5, "!", 1_000);
    h.type_at(0, ">", 2_000);
    h.select(Selection::single(0, 3), "select", 3_000);
    let transaction = h
      .transaction(vec![(1, 1, Some(" ".into()))], 4_000)
      .skip_history();
    h.dispatch(transaction);
    assert!(h.undo());

    let json = h.history.to_json().unwrap();
    assert_eq!(json["done"].as_array().map(Vec::len), Some(2));
    assert_eq!(json["undone"].as_array().map(Vec::len), Some(1));
    assert!(json["done"][0].get("edit").is_none());

    let decoded = HistoryState::from_json(json.clone()).unwrap();
    assert_eq!(decoded.to_json().unwrap(), json);
    assert_eq!(decoded.undo_depth(), h.history.undo_depth());
    assert_eq!(decoded.redo_depth(), h.history.redo_depth());

    h.history = decoded;
    assert!(h.undo());
    assert_eq!(h.text(), " hello");
    assert!(h.redo());
    assert!(h.redo());
    assert_eq!(h.text(), "> hello!");
  }

  #[test]
  fn json_keys_are_camel_case() {
    let mut h = Harness::new("hello");
    h.type_at(5, "!", 0);
    h.select(Selection::point(1), "select", 1_000);
    let transaction = h
      .transaction(vec![(0, 0, Some(">".into()))], 2_000)
      .skip_history();
    h.dispatch(transaction);

    let json = h.history.to_json().unwrap();
    let event = json["done"][0].as_object().unwrap();
    let mut keys: Vec<_> = event.keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(keys, [
      "edit",
      "pendingRemap",
      "selectionBefore",
      "selectionsAfter"
    ]);
  }

  #[test]
  fn selection_undo_placeholder_round_trips() {
    let mut h = Harness::new("hello");
    h.select(Selection::point(3), "select", 0);
    assert!(h.pop(Side::Done, true));
    assert_eq!(h.state.selection, Selection::point(0));

    let json = h.history.to_json().unwrap();
    assert_eq!(json["done"], serde_json::json!([{ "selectionsAfter": [] }]));

    let decoded = HistoryState::from_json(json.clone()).unwrap();
    assert_eq!(decoded.to_json().unwrap(), json);
    assert_eq!(decoded.undo_depth(), 0);
    assert_eq!(decoded.redo_depth(), h.history.redo_depth());

    h.history = decoded;
    assert!(h.pop(Side::Undone, true));
    assert_eq!(h.state.selection, Selection::point(3));
  }

  #[test]
  fn json_rejects_malformed_events() {
    let missing_selection = serde_json::json!({
      "done": [{ "edit": [{ "retain": 1 }], "selectionsAfter": [] }],
      "undone": [],
    });
    assert!(matches!(
      HistoryState::from_json(missing_selection),
      Err(HistoryError::InvalidEvent {
        branch: Side::Done,
        index:  0,
        ..
      })
    ));

    let point = serde_json::json!({ "ranges": [{ "anchor": 0, "head": 0 }], "primary": 0 });
    let empty = serde_json::json!({
      "done": [],
      "undone": [
        { "edit": [{ "retain": 1 }], "selectionBefore": point, "selectionsAfter": [] },
        { "selectionsAfter": [] },
      ],
    });
    assert!(matches!(
      HistoryState::from_json(empty),
      Err(HistoryError::EmptyEvent {
        branch: Side::Undone,
        index:  1,
      })
    ));

    let snake_case = serde_json::json!({
      "done": [{ "selections_after": [point] }],
      "undone": [],
    });
    assert!(matches!(
      HistoryState::from_json(snake_case),
      Err(HistoryError::Json(_))
    ));

    let not_history = serde_json::json!({ "done": 3 });
    assert!(matches!(
      HistoryState::from_json(not_history),
      Err(HistoryError::Json(_))
    ));
  }

  #[test]
  fn adjacency() {
    let doc = Rope::from("hello world");
    let invert = |changes: Vec<Change>| {
      Transaction::change(&doc, changes)
        .unwrap()
        .changes()
        .invert(&doc)
        .unwrap()
    };
    let last = invert(vec![(5, 5, Some("!".into()))]);
    let mid = Transaction::change(&doc, vec![(5, 5, Some("!".into()))])
      .unwrap()
      .apply_to(&doc)
      .unwrap();
    let next = |changes: Vec<Change>| {
      Transaction::change(&mid, changes)
        .unwrap()
        .changes()
        .invert(&mid)
        .unwrap()
    };

    assert!(is_adjacent(&last, &next(vec![(6, 6, Some("?".into()))])));
    assert!(is_adjacent(&last, &next(vec![(5, 6, None)])));
    assert!(!is_adjacent(&last, &next(vec![(9, 9, Some("?".into()))])));
  }

  fn random_edits(h: &mut Harness, edits: &[(u8, u8, String, u8)]) {
    let mut ms = 0;
    for (from, len, text, gap) in edits {
      let doc_len = h.state.doc.len_chars();
      let from = *from as usize % (doc_len + 1);
      let to = from + *len as usize % (doc_len - from + 1);
      ms += *gap as u64 * 5;
      let text: Tendril = text.chars().take(8).collect();
      let transaction = h
        .transaction(vec![(from, to, Some(text))], ms)
        .with_user_event("input.type");
      h.dispatch(transaction);
    }
  }

  fn deep_policy() -> Policy {
    Policy::from(HistoryConfig {
      min_depth:          10_000,
      new_group_delay_ms: 500,
    })
  }

  quickcheck! {
    fn depth_stays_bounded(count: u8, min_depth: u8) -> bool {
      let min_depth = min_depth as usize % 16 + 1;
      let policy = Policy::from(HistoryConfig {
        min_depth,
        new_group_delay_ms: 0,
      });
      let mut h = Harness::with_policy("", policy);
      (0..count as usize).all(|i| {
        h.type_at(i, "x", i as u64);
        let len = h.history.done().len();
        len <= min_depth + DEPTH_OVERFLOW && len >= min_depth.min(i + 1)
      })
    }

    fn undo_everything_restores_the_document(edits: Vec<(u8, u8, String, u8)>) -> bool {
      let mut h = Harness::with_policy("quick brown fox", deep_policy());
      random_edits(&mut h, &edits);
      let edited = h.text();
      while h.undo() {}
      let restored = h.text() == "quick brown fox";
      while h.redo() {}
      restored && h.text() == edited && !h.history.can_redo()
    }

    fn undo_then_redo_is_identity(edits: Vec<(u8, u8, String, u8)>) -> bool {
      let mut h = Harness::with_policy("lorem ipsum", deep_policy());
      random_edits(&mut h, &edits);
      let text = h.text();
      let selection = h.state.selection.clone();
      if !h.undo() {
        return h.history.undo_depth() == 0;
      }
      h.redo();
      h.text() == text && h.state.selection == selection
    }

    fn grouping_is_deterministic(edits: Vec<(u8, u8, String, u8)>) -> bool {
      let adjacent = || deep_policy().with_join_to_event(|_, adjacent| adjacent);
      let even = || deep_policy().with_join_to_event(|tr: &Transaction, _| tr.changes().len_after() % 2 == 0);

      let mut a = Harness::with_policy("grouped text", adjacent().combine(even()));
      let mut b = Harness::with_policy("grouped text", even().combine(adjacent()));
      random_edits(&mut a, &edits);
      random_edits(&mut b, &edits);

      let json = a.history.to_json().unwrap();
      a.text() == b.text() && json == b.history.to_json().unwrap()
    }

    fn unrecorded_prefix_keeps_undo_valid(edits: Vec<(u8, u8, String, u8)>, prefix: String) -> bool {
      let mut h = Harness::with_policy("some text", deep_policy());
      random_edits(&mut h, &edits);
      let prefix: Tendril = prefix.chars().take(4).collect();
      let prefix_len = prefix.chars().count();
      let transaction = h.transaction(vec![(0, 0, Some(prefix.clone()))], 0).skip_history();
      h.dispatch(transaction);
      while h.undo() {}
      let text = h.text();
      text.starts_with(prefix.as_str()) && text.chars().skip(prefix_len).collect::<String>() == "some text"
    }
  }
}
