//! # quire-ot
//!
//! Operational transformation over plain text.
//!
//! ## Modules
//!
//! - `component`: `Component` and the canonical `TextOperation` sequence
//! - `codec`: JSON, binary and positional-edit forms
//! - `transform`: `apply`, `compose`, `transform` (TP1)
//! - `position`: character and cursor projection through an operation
//!
//! Everything here is pure; the server-side sequencing lives in `quire-collab`.

pub mod codec;
pub mod component;
pub mod error;
pub mod position;
pub mod transform;

pub use codec::{
    decode_binary, decode_json, decode_positional_json, encode_binary, encode_json,
    from_positional, PositionalEdit,
};
pub use component::{Component, ComponentKind, TextOperation};
pub use error::OtError;
pub use position::{project_position, project_range, transform_cursor};
pub use transform::{apply, apply_to_rope, compose, transform, Tie};
