//! Cursor positions and multi-cursor selections.
//!
//! A [`Range`] has two positions: `anchor` and `head`. The `head` is where the
//! cursor visually appears, while the `anchor` is the other end of the
//! selection. When `anchor == head`, the range is a point (no selection).
//!
//! ```text
//! anchor=2, head=7: "he[llo w]orld"  (forward selection)
//! anchor=7, head=2: "he]llo w[orld"  (backward selection)
//! anchor=5, head=5: "hello|world"    (point/cursor)
//! ```
//!
//! A [`Selection`] is an immutable, ordered list of ranges with one of them
//! marked primary. Ranges are kept sorted and overlapping ranges are merged.
//! The history stores selections by value and compares them structurally,
//! or by shape (see [`Selection::eq_shape`]) when coalescing selection-only
//! changes.

use serde::{
  Deserialize,
  Serialize,
};
use smallvec::{
  SmallVec,
  smallvec,
};
use thiserror::Error;

use crate::transaction::{
  Assoc,
  ChangeSet,
  TransactionError,
};

pub type Result<T> = std::result::Result<T, SelectionError>;

#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum SelectionError {
  #[error("selection must contain at least one range")]
  EmptySelection,
  #[error("primary index {index} out of bounds for selection of length {len}")]
  PrimaryOutOfBounds { index: usize, len: usize },
  #[error(transparent)]
  Transaction(#[from] TransactionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
  pub anchor: usize,
  pub head:   usize,
}

impl Range {
  pub fn new(anchor: usize, head: usize) -> Self {
    Self { anchor, head }
  }

  #[inline]
  pub fn point(head: usize) -> Self {
    Self::new(head, head)
  }

  /// Start of the range
  #[inline]
  #[must_use]
  pub fn from(&self) -> usize {
    std::cmp::min(self.anchor, self.head)
  }

  /// End of the range
  #[inline]
  #[must_use]
  pub fn to(&self) -> usize {
    std::cmp::max(self.anchor, self.head)
  }

  #[inline]
  #[must_use]
  pub fn len(&self) -> usize {
    self.to() - self.from()
  }

  /// When the head and anchor are in the same position, we have no range.
  #[inline]
  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.anchor == self.head
  }

  /// Check if two `Ranges` overlap
  pub fn overlaps(&self, other: &Self) -> bool {
    self.from() == other.from() || (self.to() > other.from() && other.to() > self.from())
  }

  /// Returns a `Range` that encompasses both input ranges.
  pub fn merge(&self, other: Self) -> Self {
    if self.anchor > self.head && other.anchor > other.head {
      Self::new(self.anchor.max(other.anchor), self.head.min(other.head))
    } else {
      Self::new(self.from().min(other.from()), self.to().max(other.to()))
    }
  }

  /// Map a range through a set of changes.
  ///
  /// Use [`Selection::map`] for several ranges, it maps all positions in one
  /// pass over the changes.
  pub fn map(mut self, changes: &ChangeSet) -> Result<Self> {
    if changes.is_empty() {
      return Ok(self);
    }
    changes.update_positions(range_positions(&mut self).into_iter())?;
    Ok(self)
  }
}

/// Both ends of a range paired with the association that keeps it covering
/// text inserted inside it.
fn range_positions(range: &mut Range) -> [(&mut usize, Assoc); 2] {
  use std::cmp::Ordering;
  match range.anchor.cmp(&range.head) {
    Ordering::Equal => {
      [
        (&mut range.anchor, Assoc::AfterSticky),
        (&mut range.head, Assoc::AfterSticky),
      ]
    },
    Ordering::Less => {
      [
        (&mut range.anchor, Assoc::AfterSticky),
        (&mut range.head, Assoc::BeforeSticky),
      ]
    },
    Ordering::Greater => {
      [
        (&mut range.head, Assoc::AfterSticky),
        (&mut range.anchor, Assoc::BeforeSticky),
      ]
    },
  }
}

/// A selection is one or more ranges.
/// INVARIANT: A selection can never be empty (always contain at least one
/// range), and `primary_index` always points at one of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SelectionJson", into = "SelectionJson")]
pub struct Selection {
  ranges:        SmallVec<[Range; 1]>,
  primary_index: usize,
}

#[derive(Serialize, Deserialize)]
struct SelectionJson {
  ranges:  Vec<Range>,
  primary: usize,
}

impl TryFrom<SelectionJson> for Selection {
  type Error = SelectionError;

  fn try_from(json: SelectionJson) -> Result<Self> {
    Selection::new(json.ranges.into_iter().collect(), json.primary)
  }
}

impl From<Selection> for SelectionJson {
  fn from(selection: Selection) -> Self {
    Self {
      ranges:  selection.ranges.into_vec(),
      primary: selection.primary_index,
    }
  }
}

impl Selection {
  pub fn new(ranges: SmallVec<[Range; 1]>, primary_index: usize) -> Result<Self> {
    if ranges.is_empty() {
      return Err(SelectionError::EmptySelection);
    }
    if primary_index >= ranges.len() {
      return Err(SelectionError::PrimaryOutOfBounds {
        index: primary_index,
        len:   ranges.len(),
      });
    }
    Ok(
      Self {
        ranges,
        primary_index,
      }
      .normalize(),
    )
  }

  pub fn point(pos: usize) -> Self {
    Self::single(pos, pos)
  }

  #[must_use]
  /// Constructs a selection holding a single range.
  pub fn single(anchor: usize, head: usize) -> Self {
    Self {
      ranges:        smallvec![Range::new(anchor, head)],
      primary_index: 0,
    }
  }

  pub fn ranges(&self) -> &[Range] {
    &self.ranges
  }

  pub fn primary(&self) -> Range {
    self.ranges[self.primary_index]
  }

  pub fn primary_index(&self) -> usize {
    self.primary_index
  }

  #[inline(always)]
  pub fn iter(&self) -> std::slice::Iter<'_, Range> {
    self.ranges.iter()
  }

  /// Whether both selections have the same number of ranges and agree on
  /// which of them are empty. Positions are not compared.
  pub fn eq_shape(&self, other: &Selection) -> bool {
    self.ranges.len() == other.ranges.len()
      && self
        .ranges
        .iter()
        .zip(other.ranges.iter())
        .all(|(a, b)| a.is_empty() == b.is_empty())
  }

  /// Map selections over a set of changes. Useful for adjusting the selection
  /// position after applying changes to a document.
  pub fn map(mut self, changes: &ChangeSet) -> Result<Self> {
    if changes.is_empty() {
      return Ok(self);
    }
    changes.update_positions(self.ranges.iter_mut().flat_map(range_positions))?;
    Ok(self.normalize())
  }

  /// Ranges are sorted by [Range::from] with overlapping ranges merged. The
  /// primary index follows its range.
  fn normalize(mut self) -> Self {
    if self.ranges.len() < 2 {
      return self;
    }

    let primary = self.ranges[self.primary_index];
    let mut sorted = std::mem::take(&mut self.ranges);
    sorted.sort_by_key(Range::from);

    let mut ranges: SmallVec<[Range; 1]> = SmallVec::with_capacity(sorted.len());
    let mut primary_index = 0;
    for range in sorted {
      if let Some(prev) = ranges.last_mut() {
        if prev.overlaps(&range) {
          *prev = prev.merge(range);
          if range == primary {
            primary_index = ranges.len() - 1;
          }
          continue;
        }
      }
      if range == primary {
        primary_index = ranges.len();
      }
      ranges.push(range);
    }

    self.ranges = ranges;
    self.primary_index = primary_index;
    self
  }
}

impl<'a> IntoIterator for &'a Selection {
  type Item = &'a Range;
  type IntoIter = std::slice::Iter<'a, Range>;

  fn into_iter(self) -> std::slice::Iter<'a, Range> {
    self.ranges.iter()
  }
}

impl From<Range> for Selection {
  fn from(range: Range) -> Self {
    Self {
      ranges:        smallvec![range],
      primary_index: 0,
    }
  }
}
