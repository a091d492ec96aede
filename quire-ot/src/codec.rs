//! OperationCodec: the persisted forms of a [`TextOperation`].
//!
//! Two encodings share one validation path:
//!
//! - **JSON**, for the relational boundary (`operation_data` column):
//!   `{"base_len":5,"components":[{"retain":5},{"insert":", world"}]}`
//! - **Binary**, bincode with the standard config, for the embedded store.
//!
//! Decoding only accepts canonical component sequences, so a decoded
//! operation re-encodes to exactly the bytes it came from.
//!
//! The older client message shape (`{"type":"insert","position":5,...}`) is
//! accepted through [`PositionalEdit`] and [`from_positional`].

use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentKind, TextOperation};
use crate::error::OtError;

/// Wire shape of a [`TextOperation`]; converted with validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct EncodedOperation {
    base_len: usize,
    components: Vec<Component>,
}

impl TryFrom<EncodedOperation> for TextOperation {
    type Error = OtError;

    fn try_from(encoded: EncodedOperation) -> Result<Self, Self::Error> {
        let mut previous: Option<ComponentKind> = None;
        for (i, component) in encoded.components.iter().enumerate() {
            if component.is_empty() {
                return Err(OtError::malformed(format!("component {i} is empty")));
            }
            let kind = component.kind();
            match (previous, kind) {
                (Some(prev), kind) if prev == kind => {
                    return Err(OtError::malformed(format!(
                        "components {} and {i} are both {kind:?} and must be merged",
                        i - 1
                    )));
                }
                (Some(ComponentKind::Delete), ComponentKind::Insert) => {
                    return Err(OtError::malformed(format!(
                        "insert at component {i} must precede the delete before it"
                    )));
                }
                _ => {}
            }
            previous = Some(kind);
        }

        let op: TextOperation = encoded.components.into_iter().collect();
        if op.base_len() != encoded.base_len {
            return Err(OtError::malformed(format!(
                "components cover {} characters but base_len is {}",
                op.base_len(),
                encoded.base_len
            )));
        }
        Ok(op)
    }
}

impl From<TextOperation> for EncodedOperation {
    fn from(op: TextOperation) -> Self {
        Self {
            base_len: op.base_len(),
            components: op.into_components(),
        }
    }
}

/// Encode as canonical JSON.
pub fn encode_json(op: &TextOperation) -> Result<String, OtError> {
    serde_json::to_string(op).map_err(|e| OtError::malformed(e.to_string()))
}

/// Decode and validate the JSON form.
pub fn decode_json(input: &str) -> Result<TextOperation, OtError> {
    serde_json::from_str(input).map_err(|e| OtError::malformed(e.to_string()))
}

/// Encode as bincode (standard config).
pub fn encode_binary(op: &TextOperation) -> Result<Vec<u8>, OtError> {
    bincode::serde::encode_to_vec(op, bincode::config::standard())
        .map_err(|e| OtError::malformed(e.to_string()))
}

/// Decode and validate the binary form. Trailing bytes are rejected.
pub fn decode_binary(bytes: &[u8]) -> Result<TextOperation, OtError> {
    let (op, read): (TextOperation, usize) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| OtError::malformed(e.to_string()))?;
    if read != bytes.len() {
        return Err(OtError::malformed(format!(
            "{} trailing bytes after operation",
            bytes.len() - read
        )));
    }
    Ok(op)
}

// ─── Positional edits ───────────────────────────────────────────────────────

/// One edit in the `{type, position, content, length}` message shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PositionalEdit {
    Insert { position: usize, content: String },
    Delete { position: usize, length: usize },
    Retain { position: usize, length: usize },
}

impl PositionalEdit {
    pub fn position(&self) -> usize {
        match self {
            PositionalEdit::Insert { position, .. }
            | PositionalEdit::Delete { position, .. }
            | PositionalEdit::Retain { position, .. } => *position,
        }
    }
}

/// Build an operation over `base_len` characters from edits sorted by position.
///
/// Positions refer to the base document. Edits may share a position but their
/// delete/retain ranges must not overlap.
pub fn from_positional(base_len: usize, edits: &[PositionalEdit]) -> Result<TextOperation, OtError> {
    let mut op = TextOperation::new();
    let mut cursor = 0;

    for edit in edits {
        let position = edit.position();
        if position < cursor {
            return Err(OtError::malformed(format!(
                "edit at {position} overlaps the previous edit ending at {cursor}"
            )));
        }
        if position > base_len {
            return Err(OtError::malformed(format!(
                "edit at {position} is past the end of a {base_len}-character document"
            )));
        }
        op.retain(position - cursor);
        cursor = position;

        match edit {
            PositionalEdit::Insert { content, .. } => {
                op.insert(content);
            }
            PositionalEdit::Delete { length, .. } | PositionalEdit::Retain { length, .. } => {
                let end = position
                    .checked_add(*length)
                    .filter(|end| *end <= base_len)
                    .ok_or_else(|| {
                        OtError::malformed(format!(
                            "range {position}+{length} exceeds a {base_len}-character document"
                        ))
                    })?;
                if matches!(edit, PositionalEdit::Delete { .. }) {
                    op.delete(*length);
                } else {
                    op.retain(*length);
                }
                cursor = end;
            }
        }
    }

    op.retain(base_len - cursor);
    Ok(op)
}

/// Decode one positional edit or an array of them and build the operation.
pub fn decode_positional_json(base_len: usize, input: &str) -> Result<TextOperation, OtError> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        Many(Vec<PositionalEdit>),
        One(PositionalEdit),
    }

    let edits = match serde_json::from_str(input).map_err(|e| OtError::malformed(e.to_string()))? {
        OneOrMany::Many(edits) => edits,
        OneOrMany::One(edit) => vec![edit],
    };
    from_positional(base_len, &edits)
}
