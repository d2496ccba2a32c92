//! Schema-less binary frame decoding for reverse-engineered device
//! telemetry.
//!
//! The wire format is a nested, self-describing length/tag encoding with no
//! published schema. This crate only promises conservative extraction: it
//! walks what parses cleanly, leaves everything else opaque, and never
//! fails past the boundary of the frame it was handed.

mod error;
pub mod varint;
pub mod walker;

pub use error::{FrameError, Result};
pub use varint::{encode_varint, read_varint};
pub use walker::{split_frames, walk_groups, DecodedField, FieldGroup, WireType};
