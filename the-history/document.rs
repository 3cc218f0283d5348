//! Document state wired to the undo history.
//!
//! [`Document`] owns the text, the selection and the [`HistoryState`], and
//! feeds every transaction it applies through the history. It is where the
//! undo/redo commands live.
//!
//! # Example
//!
//! ```no_run
//! use ropey::Rope;
//! use the_history::{
//!   document::Document,
//!   transaction::Transaction,
//! };
//!
//! let mut doc = Document::new(Rope::from("hello"));
//!
//! let tx = Transaction::change(doc.text(), vec![(5, 5, Some(" world".into()))]).unwrap();
//! doc.dispatch(tx).unwrap();
//! assert!(doc.undo().unwrap());
//! assert_eq!(doc.text().to_string(), "hello");
//! ```

use std::time::Instant;

use ropey::Rope;
use thiserror::Error;
use tracing::{
  debug,
  warn,
};

use crate::{
  Tendril,
  history::{
    HistoryError,
    HistoryState,
    Side,
    State,
  },
  policy::{
    InputKind,
    Policy,
  },
  selection::{
    Range,
    Selection,
    SelectionError,
  },
  transaction::{
    Transaction,
    TransactionError,
  },
};

#[derive(Debug, Error)]
pub enum DocumentError {
  #[error("document is readonly")]
  Readonly,
  #[error(transparent)]
  Transaction(#[from] TransactionError),
  #[error(transparent)]
  Selection(#[from] SelectionError),
  #[error(transparent)]
  History(#[from] HistoryError),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

#[derive(Debug)]
pub struct Document {
  text:      Rope,
  selection: Selection,
  history:   HistoryState,
  policy:    Policy,
  /// Text at the last clean point.
  clean:     Rope,
  version:   u64,
  readonly:  bool,
}

impl Document {
  pub fn new(text: Rope) -> Self {
    Self::with_policy(text, Policy::default())
  }

  pub fn with_policy(text: Rope, policy: Policy) -> Self {
    Self {
      clean: text.clone(),
      text,
      selection: Selection::point(0),
      history: HistoryState::default(),
      policy,
      version: 0,
      readonly: false,
    }
  }

  pub fn text(&self) -> &Rope {
    &self.text
  }

  pub fn selection(&self) -> &Selection {
    &self.selection
  }

  pub fn history(&self) -> &HistoryState {
    &self.history
  }

  /// Replace the history, e.g. with one restored through
  /// [`HistoryState::from_json`].
  pub fn set_history(&mut self, history: HistoryState) {
    self.history = history;
  }

  pub fn policy(&self) -> &Policy {
    &self.policy
  }

  pub fn version(&self) -> u64 {
    self.version
  }

  pub fn is_readonly(&self) -> bool {
    self.readonly
  }

  pub fn set_readonly(&mut self, readonly: bool) {
    self.readonly = readonly;
  }

  /// Apply `transaction` and record it in the history. Transactions without
  /// a timestamp are stamped with the current time.
  ///
  /// Nothing changes when any step fails.
  pub fn dispatch(&mut self, transaction: Transaction) -> Result<()> {
    if self.readonly && !transaction.changes().is_empty() {
      return Err(DocumentError::Readonly);
    }
    let transaction = match transaction.time() {
      Some(_) => transaction,
      None => transaction.with_time(Instant::now()),
    };

    let start = State {
      doc:       self.text.clone(),
      selection: self.selection.clone(),
    };
    // op-less transactions may not know the document length
    let text = if transaction.changes().changes().is_empty() {
      self.text.clone()
    } else {
      transaction.apply_to(&self.text)?
    };
    let selection = match transaction.selection() {
      Some(selection) => selection.clone(),
      None => self.selection.clone().map(transaction.changes())?,
    };
    let history = self.history.apply(&transaction, &start, &self.policy)?;

    if !transaction.changes().is_empty() {
      self.version = self.version.saturating_add(1);
    }
    self.text = text;
    self.selection = selection;
    self.history = history;
    Ok(())
  }

  /// Move the selection. Selection changes are recorded so they can be
  /// walked back with [`Document::undo_selection`].
  pub fn set_selection(&mut self, selection: Selection) -> Result<()> {
    self.dispatch(
      Transaction::new(&self.text)
        .with_selection(selection)
        .with_user_event("select"),
    )
  }

  pub fn replace_range(&mut self, range: Range, text: impl Into<Tendril>) -> Result<()> {
    let tx = Transaction::change(&self.text, vec![(
      range.from(),
      range.to(),
      Some(text.into()),
    )])?;
    self.dispatch(tx)
  }

  pub fn undo(&mut self) -> Result<bool> {
    self.pop(Side::Done, false)
  }

  pub fn redo(&mut self) -> Result<bool> {
    self.pop(Side::Undone, false)
  }

  /// Restore the previous selection, or undo the newest edit when no
  /// selection change was recorded after it.
  pub fn undo_selection(&mut self) -> Result<bool> {
    self.pop(Side::Done, true)
  }

  pub fn redo_selection(&mut self) -> Result<bool> {
    self.pop(Side::Undone, true)
  }

  fn pop(&mut self, side: Side, only_selection: bool) -> Result<bool> {
    if self.readonly && !only_selection {
      debug!(%side, "refusing to undo on a readonly document");
      return Ok(false);
    }
    let state = State {
      doc:       self.text.clone(),
      selection: self.selection.clone(),
    };
    let Some(transaction) = self.history.pop(side, &state, only_selection)? else {
      debug!(%side, "nothing to pop from history");
      return Ok(false);
    };
    if self.readonly && !transaction.changes().is_empty() {
      debug!(%side, "refusing to change a readonly document");
      return Ok(false);
    }
    self.dispatch(transaction)?;
    Ok(true)
  }

  pub fn undo_depth(&self) -> usize {
    self.history.undo_depth()
  }

  pub fn redo_depth(&self) -> usize {
    self.history.redo_depth()
  }

  pub fn can_undo(&self) -> bool {
    self.history.can_undo()
  }

  pub fn can_redo(&self) -> bool {
    self.history.can_redo()
  }

  /// Host input routed to the history. Returns whether it changed anything.
  pub fn handle_input(&mut self, input: InputKind) -> Result<bool> {
    if self.policy.ignores_input(input) {
      warn!(?input, "history input vetoed by filter");
      return Ok(false);
    }
    match input {
      InputKind::HistoryUndo => self.undo(),
      InputKind::HistoryRedo => self.redo(),
      InputKind::Other => Ok(false),
    }
  }

  pub fn mark_clean(&mut self) {
    self.clean = self.text.clone();
  }

  /// Whether the text differs from the last clean point.
  pub fn is_dirty(&self) -> bool {
    self.text != self.clean
  }
}
