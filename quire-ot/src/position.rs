//! Mapping positions and ranges through an accepted operation.
//!
//! Two kinds of position are mapped here:
//!
//! - **Character positions** (`project_position`, `project_range`) name a
//!   character of the base document. They follow that character and vanish
//!   when it is deleted. Comment anchors use these.
//! - **Gap positions** (`transform_cursor`) name the gap between two
//!   characters. They always survive; a gap inside a deleted span collapses
//!   to the deletion point. Live cursors use these.

use crate::component::{Component, TextOperation};

/// Map the character at `pos` through `op`.
///
/// `pos == op.base_len()` is the end-of-document position and maps to
/// `op.target_len()`. Returns `None` when the character was deleted or
/// `pos` lies past the end.
pub fn project_position(pos: usize, op: &TextOperation) -> Option<usize> {
    let mut old = 0;
    let mut new = 0;
    for component in op.components() {
        match component {
            Component::Retain(n) => {
                if pos < old + n {
                    return Some(new + (pos - old));
                }
                old += n;
                new += n;
            }
            Component::Insert(text) => new += text.chars().count(),
            Component::Delete(n) => {
                if pos < old + n {
                    return None;
                }
                old += n;
            }
        }
    }
    (pos == old).then_some(new)
}

/// Map the half-open range `[start, end)` through `op`.
///
/// The result spans from the first to the last surviving character of the
/// range, including anything inserted between them. Returns `None` when
/// every character of the range was deleted or the range is out of bounds.
/// An empty range maps like a cursor.
pub fn project_range(start: usize, end: usize, op: &TextOperation) -> Option<(usize, usize)> {
    if start > end || end > op.base_len() {
        return None;
    }
    if start == end {
        let at = transform_cursor(start, op, false);
        return Some((at, at));
    }

    let mut old = 0;
    let mut new = 0;
    let mut first = None;
    let mut last = None;
    for component in op.components() {
        if old >= end {
            break;
        }
        match component {
            Component::Retain(n) => {
                let lo = start.max(old);
                let hi = end.min(old + n);
                if lo < hi {
                    first.get_or_insert(new + (lo - old));
                    last = Some(new + (hi - 1 - old));
                }
                old += n;
                new += n;
            }
            Component::Insert(text) => new += text.chars().count(),
            Component::Delete(n) => old += n,
        }
    }

    Some((first?, last? + 1))
}

/// Map the cursor gap at `pos` through `op`.
///
/// An insert exactly at the cursor pushes it forward only when `own` is
/// true, i.e. the cursor belongs to the operation's author. Positions past
/// the end clamp to the end of the result.
pub fn transform_cursor(pos: usize, op: &TextOperation, own: bool) -> usize {
    let mut old = 0;
    let mut new = 0;
    for component in op.components() {
        match component {
            Component::Retain(n) => {
                if pos < old + n {
                    return new + (pos - old);
                }
                old += n;
                new += n;
            }
            Component::Insert(text) => {
                if old == pos && !own {
                    return new;
                }
                new += text.chars().count();
            }
            Component::Delete(n) => {
                if pos < old + n {
                    return new;
                }
                old += n;
            }
        }
    }
    new
}
