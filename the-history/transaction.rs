//! Change sets and transactions.
//!
//! A [`ChangeSet`] is a list of [`Operation`]s that turns a document of one
//! length into a document of another. It is the edit descriptor the history
//! stores: change sets compose, invert against the document they were made
//! for, map positions and can be rebased over a concurrent change set with
//! [`ChangeSet::map`].
//!
//! A [`Transaction`] wraps a change set together with an optional new
//! selection and the metadata the history looks at when recording it:
//! effects, whether it is recorded at all, [`Isolation`], the user event tag,
//! the time it happened, and the replay marker set on undo/redo transactions.
//!
//! # Operations
//!
//! - **Retain(n)** - Keep `n` characters unchanged
//! - **Delete(n)** - Remove `n` characters
//! - **Insert(s)** - Insert string `s`
//!
//! ```ignore
//! use the_history::transaction::Transaction;
//! use ropey::Rope;
//!
//! let mut doc = Rope::from("hello world");
//! let tx = Transaction::change(&doc, vec![(6, 11, Some("rust".into()))]).unwrap();
//! tx.apply(&mut doc).unwrap();
//! assert_eq!(doc.to_string(), "hello rust");
//! ```
//!
//! # Rebasing
//!
//! Given two change sets `a` and `b` made against the same document,
//! `a.map(&b, before)` yields `a'` which applies to the document produced by
//! `b`. When both insert at the same position, `before` decides whether the
//! text of `a` lands before the text of `b`.

use std::{
  borrow::Cow,
  iter::once,
  sync::Arc,
  time::Instant,
};

use ropey::{
  Rope,
  RopeBuilder,
};
use serde::{
  Deserialize,
  Serialize,
};
use thiserror::Error;

use crate::{
  Tendril,
  effect::EffectRef,
  history::Replay,
  selection::Selection,
};

pub type Result<T> = std::result::Result<T, TransactionError>;

/// (from, to) replacement.
pub type Change = (usize, usize, Option<Tendril>);

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum TransactionError {
  #[error("changeset length mismatch: expected {expected}, got {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error(
    "changeset compose length mismatch: left output {left_len_after}, right input {right_len}"
  )]
  ComposeLengthMismatch {
    left_len_after: usize,
    right_len:      usize,
  },
  #[error("changeset map length mismatch: changes cover {len}, mapping covers {mapping_len}")]
  MapLengthMismatch { len: usize, mapping_len: usize },
  #[error("invalid change range: start {from} is after end {to}")]
  InvalidRange { from: usize, to: usize },
  #[error("change range {from}..{to} is out of bounds for document length {len}")]
  RangeOutOfBounds {
    from: usize,
    to:   usize,
    len:  usize,
  },
  #[error("change range {from}..{to} overlaps previous end {prev_end}")]
  OverlappingRange {
    prev_end: usize,
    from:     usize,
    to:       usize,
  },
  #[error("positions {positions:?} are out of bounds for changeset length {len}")]
  PositionsOutOfBounds {
    positions: Vec<usize>,
    len:       usize,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
  /// Move cursor by n characters.
  Retain(usize),

  /// Delete n characters.
  Delete(usize),

  /// Insert text at position.
  Insert(Tendril),
}

impl Operation {
  pub fn len_chars(&self) -> usize {
    match self {
      Operation::Retain(n) | Operation::Delete(n) => *n,
      Operation::Insert(s) => s.chars().count(),
    }
  }

  /// What is left of a retain or delete after consuming `n` characters.
  fn consume(self, n: usize) -> Option<Self> {
    match self {
      Operation::Retain(len) if len > n => Some(Operation::Retain(len - n)),
      Operation::Delete(len) if len > n => Some(Operation::Delete(len - n)),
      _ => None,
    }
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Assoc {
  Before,
  After,

  /// Acts like `Before` but if the position is within an exact replacement
  /// (exact size) the offset to the start of the replacement is kept
  BeforeSticky,

  /// Acts like `After` but if the position is within an exact replacement
  /// (exact size) the offset to the start of the replacement is kept
  AfterSticky,
}

impl Assoc {
  fn insert_offset(self, s: &str) -> usize {
    match self {
      Assoc::After | Assoc::AfterSticky => s.chars().count(),
      Assoc::Before | Assoc::BeforeSticky => 0,
    }
  }

  pub fn sticky(self) -> bool {
    matches!(self, Assoc::BeforeSticky | Assoc::AfterSticky)
  }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Operation>", into = "Vec<Operation>")]
pub struct ChangeSet {
  pub(crate) changes: Vec<Operation>,
  /// The required document length. Will refuse to apply changes unless it
  /// matches.
  len:                usize,
  len_after:          usize,
}

impl From<Vec<Operation>> for ChangeSet {
  fn from(operations: Vec<Operation>) -> Self {
    let mut changes = Self::with_capacity(operations.len());
    for operation in operations {
      match operation {
        Operation::Retain(n) => changes.retain(n),
        Operation::Delete(n) => changes.delete(n),
        Operation::Insert(s) => changes.insert(s),
      }
    }
    changes
  }
}

impl From<ChangeSet> for Vec<Operation> {
  fn from(changes: ChangeSet) -> Self {
    // An op-less set still has to remember the length it covers.
    if changes.changes.is_empty() && changes.len > 0 {
      return vec![Operation::Retain(changes.len)];
    }
    changes.changes
  }
}

impl ChangeSet {
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      changes:   Vec::with_capacity(capacity),
      len:       0,
      len_after: 0,
    }
  }

  /// An op-less change set covering a document of `len` characters.
  #[must_use]
  pub fn identity(len: usize) -> Self {
    Self {
      changes: Vec::new(),
      len,
      len_after: len,
    }
  }

  pub fn changes(&self) -> &[Operation] {
    &self.changes
  }

  /// Returns the expected document length for this changeset
  pub fn len(&self) -> usize {
    self.len
  }

  /// Returns the document length after applying this changeset
  pub fn len_after(&self) -> usize {
    self.len_after
  }

  // Changeset builder operations: delete/insert/retain.
  //

  pub fn delete(&mut self, n: usize) {
    use Operation::*;

    if n == 0 {
      return;
    }

    self.len += n;

    if let Some(Delete(count)) = self.changes.last_mut() {
      *count += n;
    } else {
      self.changes.push(Delete(n))
    }
  }

  pub fn insert(&mut self, fragment: Tendril) {
    use Operation::*;

    if fragment.is_empty() {
      return;
    }

    self.len_after += fragment.chars().count();

    let new_last = match self.changes.as_mut_slice() {
      [.., Insert(prev)] | [.., Insert(prev), Delete(_)] => {
        prev.push_str(&fragment);
        return;
      },
      [.., last @ Delete(_)] => std::mem::replace(last, Insert(fragment)),
      _ => Insert(fragment),
    };

    self.changes.push(new_last);
  }

  pub fn retain(&mut self, n: usize) {
    use Operation::*;

    if n == 0 {
      return;
    }

    self.len += n;
    self.len_after += n;

    if let Some(Retain(count)) = self.changes.last_mut() {
      *count += n;
    } else {
      self.changes.push(Retain(n))
    }
  }

  /// Combine two `ChangeSet` together. Applying the result is equivalent to
  /// applying `self` then `other`.
  pub fn compose(self, other: Self) -> Result<Self> {
    // The output length of the first must match the input length of the second.
    if self.len_after != other.len {
      return Err(TransactionError::ComposeLengthMismatch {
        left_len_after: self.len_after,
        right_len:      other.len,
      });
    }

    // Composing fails in weird ways if one of the sets is empty
    if self.changes.is_empty() {
      return Ok(other);
    }
    if other.changes.is_empty() {
      return Ok(self);
    }

    let len = self.changes.len();

    let mut changes_a = self.changes.into_iter();
    let mut changes_b = other.changes.into_iter();

    let mut head_a = changes_a.next();
    let mut head_b = changes_b.next();

    let mut changes = Self::with_capacity(len);

    loop {
      use std::cmp::Ordering;

      use Operation::*;
      match (head_a, head_b) {
        // we are done
        (None, None) => {
          break;
        },
        // deletion in A
        (Some(Delete(i)), b) => {
          changes.delete(i);
          head_a = changes_a.next();
          head_b = b;
        },
        // insertion in B
        (a, Some(Insert(current))) => {
          changes.insert(current);
          head_a = a;
          head_b = changes_b.next();
        },
        (None, val) | (val, None) => unreachable!("({:?})", val),
        (Some(Retain(i)), Some(Retain(j))) => {
          match i.cmp(&j) {
            Ordering::Less => {
              changes.retain(i);
              head_a = changes_a.next();
              head_b = Some(Retain(j - i));
            },
            Ordering::Equal => {
              changes.retain(i);
              head_a = changes_a.next();
              head_b = changes_b.next();
            },
            Ordering::Greater => {
              changes.retain(j);
              head_a = Some(Retain(i - j));
              head_b = changes_b.next();
            },
          }
        },
        (Some(Insert(mut s)), Some(Delete(j))) => {
          let len = s.chars().count();
          match len.cmp(&j) {
            Ordering::Less => {
              head_a = changes_a.next();
              head_b = Some(Delete(j - len));
            },
            Ordering::Equal => {
              head_a = changes_a.next();
              head_b = changes_b.next();
            },
            Ordering::Greater => {
              // byte index of the end of the deleted prefix
              let pos = s.char_indices().nth(j).map_or(s.len(), |(pos, _)| pos);
              s.replace_range(0..pos, "");
              head_a = Some(Insert(s));
              head_b = changes_b.next();
            },
          }
        },
        (Some(Insert(s)), Some(Retain(j))) => {
          let len = s.chars().count();
          match len.cmp(&j) {
            Ordering::Less => {
              changes.insert(s);
              head_a = changes_a.next();
              head_b = Some(Retain(j - len));
            },
            Ordering::Equal => {
              changes.insert(s);
              head_a = changes_a.next();
              head_b = changes_b.next();
            },
            Ordering::Greater => {
              let pos = s.char_indices().nth(j).map_or(s.len(), |(pos, _)| pos);
              let mut before = s;
              let after = before.split_off(pos);

              changes.insert(before);
              head_a = Some(Insert(after));
              head_b = changes_b.next();
            },
          }
        },
        (Some(Retain(i)), Some(Delete(j))) => {
          match i.cmp(&j) {
            Ordering::Less => {
              changes.delete(i);
              head_a = changes_a.next();
              head_b = Some(Delete(j - i));
            },
            Ordering::Equal => {
              changes.delete(j);
              head_a = changes_a.next();
              head_b = changes_b.next();
            },
            Ordering::Greater => {
              changes.delete(j);
              head_a = Some(Retain(i - j));
              head_b = changes_b.next();
            },
          }
        },
      };
    }

    debug_assert!(changes.len == self.len);

    Ok(changes)
  }

  /// Rebase this changeset over `other`, a changeset made against the same
  /// document. The result applies to the document `other` produces.
  ///
  /// Text deleted by `other` is gone from the result. Where both insert at
  /// the same position, `before` places this changeset's text first.
  pub fn map(&self, other: &ChangeSet, before: bool) -> Result<Self> {
    if self.len != other.len {
      return Err(TransactionError::MapLengthMismatch {
        len:         self.len,
        mapping_len: other.len,
      });
    }

    if other.changes.is_empty() {
      return Ok(self.clone());
    }
    if self.changes.is_empty() {
      return Ok(Self::identity(other.len_after));
    }

    let mut changes_a = self.changes.iter().cloned();
    let mut changes_b = other.changes.iter().cloned();

    let mut head_a = changes_a.next();
    let mut head_b = changes_b.next();

    let mut mapped = Self::with_capacity(self.changes.len());

    loop {
      use Operation::*;
      match (head_a, head_b) {
        (None, None) => break,
        // both insert here, theirs goes first
        (Some(Insert(s)), Some(Insert(t))) if !before => {
          mapped.retain(t.chars().count());
          head_a = Some(Insert(s));
          head_b = changes_b.next();
        },
        (Some(Insert(s)), b) => {
          mapped.insert(s);
          head_a = changes_a.next();
          head_b = b;
        },
        (a, Some(Insert(t))) => {
          mapped.retain(t.chars().count());
          head_a = a;
          head_b = changes_b.next();
        },
        (None, val) | (val, None) => unreachable!("({:?})", val),
        (Some(a), Some(b)) => {
          let n = a.len_chars().min(b.len_chars());
          match (&a, &b) {
            (Retain(_), Retain(_)) => mapped.retain(n),
            (Delete(_), Retain(_)) => mapped.delete(n),
            // already removed by `other`
            _ => {},
          }
          head_a = a.consume(n).or_else(|| changes_a.next());
          head_b = b.consume(n).or_else(|| changes_b.next());
        },
      }
    }

    debug_assert!(mapped.len == other.len_after);

    Ok(mapped)
  }

  /// Returns a new changeset that reverts this one. Useful for `undo`
  /// implementation. The document parameter expects the original document
  /// before this change was applied.
  pub fn invert(&self, original_doc: &Rope) -> Result<Self> {
    if self.changes.is_empty() {
      return Ok(ChangeSet {
        changes:   Vec::new(),
        len:       self.len_after,
        len_after: self.len,
      });
    }

    self.ensure_len(original_doc.len_chars())?;

    let mut changes = Self::with_capacity(self.changes.len());
    let mut pos = 0;

    for change in &self.changes {
      use Operation::*;
      match change {
        Retain(n) => {
          changes.retain(*n);
          pos += n;
        },
        Delete(n) => {
          let text = Cow::from(original_doc.slice(pos..pos + *n));
          changes.insert(Tendril::from(text.as_ref()));
          pos += n;
        },
        Insert(s) => {
          let chars = s.chars().count();
          changes.delete(chars);
        },
      }
    }

    Ok(changes)
  }

  fn ensure_len(&self, text_len: usize) -> Result<()> {
    if text_len != self.len {
      return Err(TransactionError::LengthMismatch {
        expected: self.len,
        actual:   text_len,
      });
    }
    Ok(())
  }

  /// Apply this changeset in-place.
  pub fn apply(&self, text: &mut Rope) -> Result<()> {
    self.ensure_len(text.len_chars())?;
    let mut pos = 0;

    for change in &self.changes {
      use Operation::*;
      match change {
        Retain(n) => pos += n,
        Delete(n) => text.remove(pos..pos + *n),
        Insert(s) => {
          text.insert(pos, s);
          pos += s.chars().count();
        },
      }
    }

    Ok(())
  }

  /// Apply this changeset to a rope and return the updated rope.
  pub fn apply_to(&self, text: &Rope) -> Result<Rope> {
    self.ensure_len(text.len_chars())?;
    if self.is_empty() {
      return Ok(text.clone());
    }

    let mut builder = RopeBuilder::new();
    let mut pos = 0;

    let append_slice = |from: usize, to: usize, builder: &mut RopeBuilder| {
      if from >= to {
        return;
      }
      let slice = text.slice(from..to);
      for chunk in slice.chunks() {
        builder.append(chunk);
      }
    };

    for change in &self.changes {
      use Operation::*;
      match change {
        Retain(n) => {
          append_slice(pos, pos + *n, &mut builder);
          pos += n;
        },
        Delete(n) => {
          pos += n;
        },
        Insert(s) => {
          builder.append(s.as_str());
        },
      }
    }

    append_slice(pos, self.len, &mut builder);

    Ok(builder.finish())
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.changes.is_empty() || self.changes == [Operation::Retain(self.len)]
  }

  /// Map a (mostly) *sorted* list of positions through the changes.
  ///
  /// This is equivalent to updating each position with `map_pos`, but runs
  /// in `O(N+M)` for sorted input. Unsorted input falls back to rewinding
  /// the operation cursor.
  pub fn update_positions<'a>(
    &self,
    positions: impl Iterator<Item = (&'a mut usize, Assoc)>,
  ) -> Result<()> {
    use Operation::*;

    let mut positions = positions.peekable();

    let mut old_pos = 0;
    let mut new_pos = 0;
    let mut iter = self.changes.iter().enumerate().peekable();

    'outer: loop {
      macro_rules! map {
        ($map:expr, $i:expr) => {
          loop {
            let Some((pos, assoc)) = positions.peek_mut() else {
              return Ok(());
            };
            if **pos < old_pos {
              // Positions are not sorted, revert to the last Operation that
              // contains this position and continue iterating from there.
              for (i, change) in self.changes[..$i].iter().enumerate().rev() {
                match change {
                  Retain(i) => {
                    old_pos -= i;
                    new_pos -= i;
                  },
                  Delete(i) => {
                    old_pos -= i;
                  },
                  Insert(ins) => {
                    new_pos -= ins.chars().count();
                  },
                }
                if old_pos <= **pos {
                  iter = self.changes[i..].iter().enumerate().peekable();
                }
              }
              debug_assert!(old_pos <= **pos, "Reverse Iter across changeset works");
              continue 'outer;
            }
            #[allow(clippy::redundant_closure_call)]
            let Some(new_pos) = $map(**pos, *assoc) else {
              break;
            };
            **pos = new_pos;
            positions.next();
          }
        };
      }

      let Some((i, change)) = iter.next() else {
        map!(
          |pos, _| (old_pos == pos).then_some(new_pos),
          self.changes.len()
        );
        break;
      };

      let len = match change {
        Delete(i) | Retain(i) => *i,
        Insert(_) => 0,
      };
      let mut old_end = old_pos + len;

      match change {
        Retain(_) => {
          map!(
            |pos, _| (old_end > pos).then_some(new_pos + (pos - old_pos)),
            i
          );
          new_pos += len;
        },
        Delete(_) => {
          // in range
          map!(|pos, _| (old_end > pos).then_some(new_pos), i);
        },
        Insert(s) => {
          // a subsequent delete means a replace, consume it
          if let Some((_, Delete(len))) = iter.peek() {
            iter.next();

            old_end = old_pos + len;
            // in range of replaced text
            map!(
              |pos, assoc: Assoc| {
                (old_end > pos).then(|| {
                  // at point or tracking before
                  if pos == old_pos {
                    new_pos
                  } else {
                    let ins = assoc.insert_offset(s);
                    // if the deleted and inserted text have the exact same size
                    // keep the relative offset into the new text
                    if *len == ins && assoc.sticky() {
                      new_pos + (pos - old_pos)
                    } else {
                      new_pos + ins
                    }
                  }
                })
              },
              i
            );
          } else {
            // at insert point
            map!(
              |pos, assoc: Assoc| {
                (old_pos == pos).then(|| {
                  // return position before inserted text
                  new_pos + assoc.insert_offset(s)
                })
              },
              i
            );
          }

          new_pos += s.chars().count();
        },
      }
      old_pos = old_end;
    }
    let out_of_bounds: Vec<usize> = positions.map(|(pos, _)| *pos).collect();
    if out_of_bounds.is_empty() {
      Ok(())
    } else {
      Err(TransactionError::PositionsOutOfBounds {
        positions: out_of_bounds,
        len:       self.len,
      })
    }
  }

  /// Map a position through the changes.
  ///
  /// `assoc` indicates which side to associate the position with. `Before` will
  /// keep the position close to the character before, and will place it
  /// before insertions over that range, or at that point. `After` will move
  /// it forward, placing it at the end of such insertions.
  pub fn map_pos(&self, mut pos: usize, assoc: Assoc) -> Result<usize> {
    self.update_positions(once((&mut pos, assoc)))?;
    Ok(pos)
  }

  pub fn changes_iter(&self) -> ChangeIterator<'_> {
    ChangeIterator::new(self)
  }

  /// Iterate the replaced spans as `(from_a, to_a, from_b, to_b)`, where the
  /// `a` side is in the document before the change and the `b` side in the
  /// document after it. Touching replacements are reported as one span.
  pub fn iter_changed_ranges(&self) -> ChangedRanges<'_> {
    ChangedRanges {
      iter:  self.changes.iter().peekable(),
      pos_a: 0,
      pos_b: 0,
    }
  }
}

pub struct ChangeIterator<'a> {
  iter: std::iter::Peekable<std::slice::Iter<'a, Operation>>,
  pos:  usize,
}

impl<'a> ChangeIterator<'a> {
  fn new(changeset: &'a ChangeSet) -> Self {
    let iter = changeset.changes.iter().peekable();
    Self { iter, pos: 0 }
  }
}

impl Iterator for ChangeIterator<'_> {
  type Item = Change;

  fn next(&mut self) -> Option<Self::Item> {
    use Operation::*;

    loop {
      match self.iter.next()? {
        Retain(len) => {
          self.pos += len;
        },
        Delete(len) => {
          let start = self.pos;
          self.pos += len;
          return Some((start, self.pos, None));
        },
        Insert(s) => {
          let start = self.pos;
          // a subsequent delete means a replace, consume it
          if let Some(Delete(len)) = self.iter.peek() {
            self.iter.next();

            self.pos += len;
            return Some((start, self.pos, Some(s.clone())));
          } else {
            return Some((start, start, Some(s.clone())));
          }
        },
      }
    }
  }
}

pub struct ChangedRanges<'a> {
  iter:  std::iter::Peekable<std::slice::Iter<'a, Operation>>,
  pos_a: usize,
  pos_b: usize,
}

impl Iterator for ChangedRanges<'_> {
  type Item = (usize, usize, usize, usize);

  fn next(&mut self) -> Option<Self::Item> {
    use Operation::*;

    while let Some(Retain(n)) = self.iter.peek() {
      self.pos_a += n;
      self.pos_b += n;
      self.iter.next();
    }

    let (from_a, from_b) = (self.pos_a, self.pos_b);
    let mut touched = false;
    while let Some(op) = self.iter.next_if(|op| !matches!(op, Retain(_))) {
      touched = true;
      match op {
        Delete(n) => self.pos_a += n,
        Insert(s) => self.pos_b += s.chars().count(),
        Retain(_) => {},
      }
    }

    touched.then_some((from_a, self.pos_a, from_b, self.pos_b))
  }
}

fn validate_change_bounds(from: usize, to: usize, len: usize) -> Result<()> {
  if from > to {
    return Err(TransactionError::InvalidRange { from, to });
  }
  if to > len {
    return Err(TransactionError::RangeOutOfBounds { from, to, len });
  }
  Ok(())
}

/// Where a transaction stops the history from joining it with its
/// neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isolation {
  /// Never join with earlier transactions.
  Before,
  /// Never let later transactions join this one.
  After,
  /// Both.
  Full,
}

impl Isolation {
  pub fn before(self) -> bool {
    matches!(self, Isolation::Before | Isolation::Full)
  }

  pub fn after(self) -> bool {
    matches!(self, Isolation::After | Isolation::Full)
  }
}

impl From<ChangeSet> for Transaction {
  fn from(changes: ChangeSet) -> Self {
    Self {
      changes,
      ..Self::default()
    }
  }
}

#[derive(Debug, Clone)]
pub struct Transaction {
  changes:        ChangeSet,
  selection:      Option<Selection>,
  effects:        Vec<EffectRef>,
  add_to_history: bool,
  isolation:      Option<Isolation>,
  user_event:     Option<Tendril>,
  time:           Option<Instant>,
  replay:         Option<Arc<Replay>>,
}

impl Default for Transaction {
  fn default() -> Self {
    Self {
      changes:        ChangeSet::default(),
      selection:      None,
      effects:        Vec::new(),
      add_to_history: true,
      isolation:      None,
      user_event:     None,
      time:           None,
      replay:         None,
    }
  }
}

impl Transaction {
  pub fn new(doc: &Rope) -> Self {
    Self::from(ChangeSet::identity(doc.len_chars()))
  }

  /// Changes made to the buffer.
  pub fn changes(&self) -> &ChangeSet {
    &self.changes
  }

  /// When set, explicitly updates the selection.
  pub fn selection(&self) -> Option<&Selection> {
    self.selection.as_ref()
  }

  pub fn effects(&self) -> &[EffectRef] {
    &self.effects
  }

  /// Whether the history records this transaction.
  pub fn add_to_history(&self) -> bool {
    self.add_to_history
  }

  pub fn isolation(&self) -> Option<Isolation> {
    self.isolation
  }

  pub fn user_event(&self) -> Option<&str> {
    self.user_event.as_deref()
  }

  /// Whether the user event is `kind` or one of its sub-kinds, so
  /// `"input.type"` matches `"input"` and `"input.type"` but not `"inputs"`.
  pub fn is_user_event(&self, kind: &str) -> bool {
    self.user_event().is_some_and(|event| user_event_is(event, kind))
  }

  pub fn time(&self) -> Option<Instant> {
    self.time
  }

  /// Set on transactions produced by undo/redo.
  pub fn replay(&self) -> Option<&Replay> {
    self.replay.as_deref()
  }

  /// Apply this transaction in-place.
  pub fn apply(&self, doc: &mut Rope) -> Result<()> {
    self.changes.apply(doc)
  }

  /// Apply this transaction to a rope and return the updated rope.
  pub fn apply_to(&self, doc: &Rope) -> Result<Rope> {
    self.changes.apply_to(doc)
  }

  pub fn with_selection(mut self, selection: Selection) -> Self {
    self.selection = Some(selection);
    self
  }

  pub fn with_effect(mut self, effect: EffectRef) -> Self {
    self.effects.push(effect);
    self
  }

  pub fn with_effects(mut self, effects: impl IntoIterator<Item = EffectRef>) -> Self {
    self.effects.extend(effects);
    self
  }

  /// Keep this transaction out of the history. Stored events are remapped
  /// through its changes instead.
  pub fn skip_history(mut self) -> Self {
    self.add_to_history = false;
    self
  }

  pub fn with_isolation(mut self, isolation: Isolation) -> Self {
    self.isolation = Some(isolation);
    self
  }

  pub fn with_user_event(mut self, event: impl Into<Tendril>) -> Self {
    self.user_event = Some(event.into());
    self
  }

  pub fn with_time(mut self, time: Instant) -> Self {
    self.time = Some(time);
    self
  }

  pub(crate) fn with_replay(mut self, replay: Replay) -> Self {
    self.replay = Some(Arc::new(replay));
    self
  }

  /// Generate a transaction from a set of changes.
  pub fn change<I>(doc: &Rope, changes: I) -> Result<Self>
  where
    I: IntoIterator<Item = Change>,
  {
    let len = doc.len_chars();
    let changes = changes.into_iter();
    let (lower, upper) = changes.size_hint();
    let size = upper.unwrap_or(lower);
    let mut changeset = ChangeSet::with_capacity(2 * size + 1); // rough estimate

    let mut last = 0;
    for (from, to, tendril) in changes {
      validate_change_bounds(from, to, len)?;
      if from < last {
        return Err(TransactionError::OverlappingRange {
          prev_end: last,
          from,
          to,
        });
      }

      // Retain from last "to" to current "from"
      changeset.retain(from - last);
      let span = to - from;
      match tendril {
        Some(text) => {
          changeset.insert(text);
          changeset.delete(span);
        },
        None => changeset.delete(span),
      }
      last = to;
    }

    changeset.retain(len - last);

    Ok(Self::from(changeset))
  }

  pub fn changes_iter(&self) -> ChangeIterator<'_> {
    self.changes.changes_iter()
  }
}

pub(crate) fn user_event_is(event: &str, kind: &str) -> bool {
  event
    .strip_prefix(kind)
    .is_some_and(|rest| rest.is_empty() || rest.starts_with('.'))
}
