//! Application, composition and pairwise transformation.
//!
//! All functions here are pure. `transform` satisfies TP1:
//!
//! ```text
//!            local
//!     doc ────────────► doc·L
//!      │                  │
//!      │ remote           │ remote'
//!      ▼                  ▼
//!    doc·R ──────────► doc·L·R' == doc·R·L'
//!            local'
//! ```

use ropey::Rope;

use crate::component::{Component, ComponentKind, Pieces, TextOperation};
use crate::error::OtError;

/// Which side's insert goes first when both insert at the same position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tie {
    /// The local operation's insert lands before the remote one.
    LocalFirst,
    /// The remote operation's insert lands before the local one.
    RemoteFirst,
}

impl Tie {
    /// Lower author identifier wins; equal authors defer to the remote side.
    pub fn between<T: Ord + ?Sized>(local_author: &T, remote_author: &T) -> Self {
        if local_author < remote_author {
            Tie::LocalFirst
        } else {
            Tie::RemoteFirst
        }
    }
}

/// Apply `op` to `text`, producing the new document.
pub fn apply(text: &str, op: &TextOperation) -> Result<String, OtError> {
    let len = text.chars().count();
    if len != op.base_len() {
        return Err(OtError::LengthMismatch {
            expected: op.base_len(),
            actual: len,
        });
    }

    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    for component in op.components() {
        match component {
            Component::Retain(n) => out.extend(chars.by_ref().take(*n)),
            Component::Delete(n) => {
                chars.by_ref().take(*n).for_each(drop);
            }
            Component::Insert(insert) => out.push_str(insert),
        }
    }
    Ok(out)
}

/// Apply `op` to a rope in place.
pub fn apply_to_rope(rope: &mut Rope, op: &TextOperation) -> Result<(), OtError> {
    if rope.len_chars() != op.base_len() {
        return Err(OtError::LengthMismatch {
            expected: op.base_len(),
            actual: rope.len_chars(),
        });
    }

    let mut pos = 0;
    for component in op.components() {
        match component {
            Component::Retain(n) => pos += n,
            Component::Delete(n) => rope.remove(pos..pos + n),
            Component::Insert(text) => {
                rope.insert(pos, text);
                pos += text.chars().count();
            }
        }
    }
    Ok(())
}

/// Merge `first` followed by `second` into one equivalent operation.
pub fn compose(first: &TextOperation, second: &TextOperation) -> Result<TextOperation, OtError> {
    if first.target_len() != second.base_len() {
        return Err(OtError::LengthMismatch {
            expected: first.target_len(),
            actual: second.base_len(),
        });
    }

    let mut result = TextOperation::new();
    let mut a = Pieces::new(first);
    let mut b = Pieces::new(second);

    loop {
        match (a.peek_kind(), b.peek_kind()) {
            (None, None) => break,
            (Some(ComponentKind::Delete), _) => {
                let n = a.remaining();
                a.advance(n);
                result.delete(n);
            }
            (_, Some(ComponentKind::Insert)) => {
                result.insert(b.take_insert());
            }
            (None, _) | (_, None) => {
                return Err(OtError::malformed("composed operations cover different lengths"));
            }
            (Some(ka), Some(kb)) => {
                let n = a.remaining().min(b.remaining());
                match (ka, kb) {
                    (ComponentKind::Retain, ComponentKind::Retain) => {
                        a.advance(n);
                        b.advance(n);
                        result.retain(n);
                    }
                    (ComponentKind::Retain, ComponentKind::Delete) => {
                        a.advance(n);
                        b.advance(n);
                        result.delete(n);
                    }
                    (ComponentKind::Insert, ComponentKind::Retain) => {
                        let text = a.take_text(n);
                        b.advance(n);
                        result.insert(text);
                    }
                    (ComponentKind::Insert, ComponentKind::Delete) => {
                        a.advance(n);
                        b.advance(n);
                    }
                    (ComponentKind::Delete, _) | (_, ComponentKind::Insert) => {
                        unreachable!("deletes of the first and inserts of the second are consumed above")
                    }
                }
            }
        }
    }

    Ok(result)
}

/// Transform two operations authored against the same document.
///
/// Returns `(local', remote')` where `local'` applies after `remote` and
/// `remote'` applies after `local`; both orders converge.
pub fn transform(
    local: &TextOperation,
    remote: &TextOperation,
    tie: Tie,
) -> Result<(TextOperation, TextOperation), OtError> {
    if local.base_len() != remote.base_len() {
        return Err(OtError::LengthMismatch {
            expected: remote.base_len(),
            actual: local.base_len(),
        });
    }

    let mut local_prime = TextOperation::new();
    let mut remote_prime = TextOperation::new();
    let mut a = Pieces::new(local);
    let mut b = Pieces::new(remote);

    loop {
        let (ka, kb) = (a.peek_kind(), b.peek_kind());
        match (ka, kb) {
            (None, None) => break,
            (Some(ComponentKind::Insert), _)
                if tie == Tie::LocalFirst || kb != Some(ComponentKind::Insert) =>
            {
                let text = a.take_insert();
                remote_prime.retain(text.chars().count());
                local_prime.insert(text);
            }
            (_, Some(ComponentKind::Insert)) => {
                let text = b.take_insert();
                local_prime.retain(text.chars().count());
                remote_prime.insert(text);
            }
            (None, _) | (_, None) => {
                return Err(OtError::malformed("transformed operations cover different lengths"));
            }
            (Some(ka), Some(kb)) => {
                let n = a.remaining().min(b.remaining());
                a.advance(n);
                b.advance(n);
                match (ka, kb) {
                    (ComponentKind::Retain, ComponentKind::Retain) => {
                        local_prime.retain(n);
                        remote_prime.retain(n);
                    }
                    (ComponentKind::Delete, ComponentKind::Delete) => {}
                    (ComponentKind::Delete, ComponentKind::Retain) => {
                        local_prime.delete(n);
                    }
                    (ComponentKind::Retain, ComponentKind::Delete) => {
                        remote_prime.delete(n);
                    }
                    (ComponentKind::Insert, _) | (_, ComponentKind::Insert) => {
                        unreachable!("inserts are consumed above")
                    }
                }
            }
        }
    }

    Ok((local_prime, remote_prime))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(build: impl FnOnce(&mut TextOperation)) -> TextOperation {
        let mut op = TextOperation::new();
        build(&mut op);
        op
    }

    #[test]
    fn test_apply_insert_and_delete() {
        let insert = TextOperation::insert_at(5, 5, ", world").unwrap();
        assert_eq!(apply("Hello", &insert).unwrap(), "Hello, world");

        let delete = TextOperation::delete_at(12, 5, 7).unwrap();
        assert_eq!(apply("Hello, world", &delete).unwrap(), "Hello");
    }

    #[test]
    fn test_apply_rejects_wrong_length() {
        let insert = TextOperation::insert_at(5, 0, "x").unwrap();
        assert_eq!(
            apply("Hi", &insert),
            Err(OtError::LengthMismatch { expected: 5, actual: 2 })
        );
    }

    #[test]
    fn test_apply_multibyte() {
        let op = op(|o| {
            o.retain(1).delete(1).insert("ö").retain(2);
        });
        assert_eq!(apply("héll", &op).unwrap(), "höll");
    }

    #[test]
    fn test_apply_to_rope_matches_string() {
        let op = op(|o| {
            o.insert("Say: ").retain(2).delete(1).retain(2);
        });
        let mut rope = Rope::from_str("Hello");
        apply_to_rope(&mut rope, &op).unwrap();
        assert_eq!(rope.to_string(), apply("Hello", &op).unwrap());
    }

    #[test]
    fn test_compose_sequential_edits() {
        let first = TextOperation::insert_at(5, 5, ", world").unwrap();
        let second = TextOperation::insert_at(12, 0, "Say: ").unwrap();
        let composed = compose(&first, &second).unwrap();
        assert_eq!(composed.base_len(), 5);
        assert_eq!(apply("Hello", &composed).unwrap(), "Say: Hello, world");
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let first = TextOperation::insert_at(3, 1, "xyz").unwrap();
        let second = TextOperation::delete_at(6, 1, 3).unwrap();
        let composed = compose(&first, &second).unwrap();
        assert!(composed.is_noop());
        assert_eq!(composed.base_len(), 3);
    }

    #[test]
    fn test_compose_length_mismatch() {
        let first = TextOperation::identity(3);
        let second = TextOperation::identity(4);
        assert!(matches!(
            compose(&first, &second),
            Err(OtError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_transform_end_to_end_scenario() {
        let a = TextOperation::insert_at(5, 5, ", world").unwrap();
        let b = TextOperation::insert_at(5, 0, "Say: ").unwrap();

        let (b_prime, a_prime) = transform(&b, &a, Tie::RemoteFirst).unwrap();
        let via_a = apply(&apply("Hello", &a).unwrap(), &b_prime).unwrap();
        let via_b = apply(&apply("Hello", &b).unwrap(), &a_prime).unwrap();
        assert_eq!(via_a, "Say: Hello, world");
        assert_eq!(via_a, via_b);
    }

    #[test]
    fn test_transform_tie_break_orders_inserts() {
        let local = TextOperation::insert_at(2, 1, "L").unwrap();
        let remote = TextOperation::insert_at(2, 1, "R").unwrap();

        let (local_prime, _) = transform(&local, &remote, Tie::LocalFirst).unwrap();
        assert_eq!(apply("ab", &compose(&remote, &local_prime).unwrap()).unwrap(), "aLRb");

        let (local_prime, _) = transform(&local, &remote, Tie::RemoteFirst).unwrap();
        assert_eq!(apply("ab", &compose(&remote, &local_prime).unwrap()).unwrap(), "aRLb");
    }

    #[test]
    fn test_transform_overlapping_deletes() {
        let local = TextOperation::delete_at(6, 1, 3).unwrap();
        let remote = TextOperation::delete_at(6, 2, 3).unwrap();
        let (lp, rp) = transform(&local, &remote, Tie::LocalFirst).unwrap();

        let left = apply(&apply("abcdef", &local).unwrap(), &rp).unwrap();
        let right = apply(&apply("abcdef", &remote).unwrap(), &lp).unwrap();
        assert_eq!(left, "af");
        assert_eq!(left, right);
    }

    #[test]
    fn test_transform_insert_inside_deleted_range() {
        let local = TextOperation::insert_at(5, 2, "XY").unwrap();
        let remote = TextOperation::delete_at(5, 1, 3).unwrap();
        let (lp, rp) = transform(&local, &remote, Tie::RemoteFirst).unwrap();

        let left = apply(&apply("abcde", &local).unwrap(), &rp).unwrap();
        let right = apply(&apply("abcde", &remote).unwrap(), &lp).unwrap();
        assert_eq!(left, "aXYe");
        assert_eq!(left, right);
    }

    #[test]
    fn test_transform_rejects_different_bases() {
        let local = TextOperation::identity(2);
        let remote = TextOperation::identity(3);
        assert!(transform(&local, &remote, Tie::LocalFirst).is_err());
    }

    #[test]
    fn test_tie_between_authors() {
        assert_eq!(Tie::between("alice", "bob"), Tie::LocalFirst);
        assert_eq!(Tie::between("bob", "alice"), Tie::RemoteFirst);
        assert_eq!(Tie::between("bob", "bob"), Tie::RemoteFirst);
    }
}
