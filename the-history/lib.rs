//! Undo/redo history for a live text-editing surface.
//!
//! Every document change arrives as a [`transaction::Transaction`]. The
//! [`history::HistoryState`] turns that stream into two branches of
//! invertible events (`done` and `undone`), groups rapid typing into single
//! undo steps and keeps stored events valid when edits that must not be
//! recorded shift the document underneath them.
//!
//! [`document::Document`] is a small holder tying text, selection and history
//! together and exposes the undo/redo commands.

use smartstring::{LazyCompact, SmartString};

pub mod document;
pub mod effect;
pub mod history;
pub mod policy;
pub mod selection;
pub mod transaction;

pub type Tendril = SmartString<LazyCompact>;
