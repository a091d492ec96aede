//! Operation components and the canonical component sequence.
//!
//! A [`TextOperation`] walks the whole base document from left to right:
//!
//! ```text
//! base:    H e l l o
//!          └─retain(5)─┘ insert(", world")
//! target:  H e l l o , _ w o r l d
//! ```
//!
//! Every character of the base document is covered by exactly one
//! `retain` or `delete`, so `base_len` is the sum of those and
//! `target_len` is the sum of `retain` and `insert`. Lengths count
//! Unicode scalar values, never bytes.

use serde::{Deserialize, Serialize};

use crate::error::OtError;

/// A single step of a text operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Keep the next `n` characters of the base document.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove the next `n` characters of the base document.
    Delete(usize),
}

/// Discriminant of a [`Component`], used by the pairwise walkers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    Retain,
    Insert,
    Delete,
}

impl Component {
    /// Length in characters (inserted characters for `Insert`).
    pub fn len(&self) -> usize {
        match self {
            Component::Retain(n) | Component::Delete(n) => *n,
            Component::Insert(text) => text.chars().count(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Component::Retain(n) | Component::Delete(n) => *n == 0,
            Component::Insert(text) => text.is_empty(),
        }
    }

    pub fn kind(&self) -> ComponentKind {
        match self {
            Component::Retain(_) => ComponentKind::Retain,
            Component::Insert(_) => ComponentKind::Insert,
            Component::Delete(_) => ComponentKind::Delete,
        }
    }
}

/// An ordered, canonical sequence of components.
///
/// The builder methods keep the sequence canonical: empty components are
/// dropped, adjacent components of the same kind are merged, and an insert
/// that follows a delete is moved in front of it. Two operations with the
/// same effect therefore compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "crate::codec::EncodedOperation", into = "crate::codec::EncodedOperation")]
pub struct TextOperation {
    components: Vec<Component>,
    base_len: usize,
    target_len: usize,
}

impl TextOperation {
    /// An empty operation against an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// The identity operation over a document of `len` characters.
    pub fn identity(len: usize) -> Self {
        let mut op = Self::new();
        op.retain(len);
        op
    }

    /// Insert `text` at character `pos` of a document of `base_len` characters.
    pub fn insert_at(base_len: usize, pos: usize, text: &str) -> Result<Self, OtError> {
        if pos > base_len {
            return Err(OtError::malformed(format!(
                "insert position {pos} is past the end of a {base_len}-character document"
            )));
        }
        let mut op = Self::new();
        op.retain(pos).insert(text).retain(base_len - pos);
        Ok(op)
    }

    /// Delete `len` characters starting at `pos` of a document of `base_len` characters.
    pub fn delete_at(base_len: usize, pos: usize, len: usize) -> Result<Self, OtError> {
        let end = pos.checked_add(len).filter(|end| *end <= base_len).ok_or_else(|| {
            OtError::malformed(format!(
                "delete range {pos}+{len} exceeds a {base_len}-character document"
            ))
        })?;
        let mut op = Self::new();
        op.retain(pos).delete(len).retain(base_len - end);
        Ok(op)
    }

    /// Append a retain, merging with a trailing retain.
    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Retain(n));
        }
        self
    }

    /// Append an insert, keeping inserts ahead of a trailing delete.
    pub fn insert(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        self.target_len += text.chars().count();
        match self.components.as_mut_slice() {
            [.., Component::Insert(prev)] | [.., Component::Insert(prev), Component::Delete(_)] => {
                prev.push_str(text);
            }
            [.., last @ Component::Delete(_)] => {
                let delete = std::mem::replace(last, Component::Insert(text.to_owned()));
                self.components.push(delete);
            }
            _ => self.components.push(Component::Insert(text.to_owned())),
        }
        self
    }

    /// Append a delete, merging with a trailing delete.
    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        if let Some(Component::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Delete(n));
        }
        self
    }

    /// Append an arbitrary component through the normalising builders.
    pub fn push(&mut self, component: Component) -> &mut Self {
        match component {
            Component::Retain(n) => self.retain(n),
            Component::Insert(text) => self.insert(&text),
            Component::Delete(n) => self.delete(n),
        }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn into_components(self) -> Vec<Component> {
        self.components
    }

    /// Length of the document this operation applies to.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the document after the operation is applied.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// True when applying the operation leaves every document unchanged.
    pub fn is_noop(&self) -> bool {
        self.components.iter().all(|c| matches!(c, Component::Retain(_)))
    }
}

impl FromIterator<Component> for TextOperation {
    fn from_iter<I: IntoIterator<Item = Component>>(iter: I) -> Self {
        let mut op = TextOperation::new();
        for component in iter {
            op.push(component);
        }
        op
    }
}

/// Character-granular reader over a component slice.
///
/// The pairwise algorithms consume two operations at different rates;
/// `Pieces` lets them take part of a component and come back for the rest.
pub(crate) struct Pieces<'a> {
    components: &'a [Component],
    index: usize,
    consumed: usize,
    current_len: usize,
}

impl<'a> Pieces<'a> {
    pub(crate) fn new(op: &'a TextOperation) -> Self {
        let current_len = op.components.first().map_or(0, Component::len);
        Self {
            components: &op.components,
            index: 0,
            consumed: 0,
            current_len,
        }
    }

    pub(crate) fn peek_kind(&self) -> Option<ComponentKind> {
        self.components.get(self.index).map(Component::kind)
    }

    /// Characters left in the current component.
    pub(crate) fn remaining(&self) -> usize {
        self.current_len - self.consumed
    }

    pub(crate) fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.consumed += n;
        if self.consumed == self.current_len {
            self.index += 1;
            self.consumed = 0;
            self.current_len = self.components.get(self.index).map_or(0, Component::len);
        }
    }

    /// Take up to `n` characters of the current insert.
    pub(crate) fn take_text(&mut self, n: usize) -> &'a str {
        let components: &'a [Component] = self.components;
        let text = match components.get(self.index) {
            Some(Component::Insert(text)) => text.as_str(),
            _ => "",
        };
        let n = n.min(self.remaining());
        let from = byte_offset(text, self.consumed);
        let to = byte_offset(text, self.consumed + n);
        self.advance(n);
        &text[from..to]
    }

    /// Take the rest of the current insert.
    pub(crate) fn take_insert(&mut self) -> &'a str {
        self.take_text(self.remaining())
    }
}

fn byte_offset(text: &str, chars: usize) -> usize {
    text.char_indices().nth(chars).map_or(text.len(), |(i, _)| i)
}
