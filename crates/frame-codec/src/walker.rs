use crate::error::{FrameError, Result};
use crate::varint::read_varint;
use tracing::{debug, trace};

/// Wire type suffix of a field tag (low three bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl TryFrom<u8> for WireType {
    type Error = FrameError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(FrameError::UnknownWireType(other)),
        }
    }
}

/// A single varint field lifted out of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedField {
    pub field_number: u32,
    pub value: u64,
}

/// The varint fields found directly inside one message level, tagged with
/// the nesting depth they were found at.
///
/// The wire format has no schema, so "message level" is itself heuristic:
/// a length-delimited blob that happens to parse cleanly is treated as a
/// sub-message, anything else stays opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGroup {
    pub depth: u8,
    pub fields: Vec<DecodedField>,
}

impl FieldGroup {
    /// First value of the given field number in this group, if present.
    pub fn get(&self, field_number: u32) -> Option<u64> {
        self.fields
            .iter()
            .find(|f| f.field_number == field_number)
            .map(|f| f.value)
    }
}

/// Walk a frame, collecting depth-tagged field groups.
///
/// Never fails past the frame boundary: truncation or an unknown wire type
/// stops the walk and whatever was collected so far is returned. Partial
/// results are valid and expected for a reverse-engineered format.
pub fn walk_groups(frame: &[u8], max_depth: u8) -> Vec<FieldGroup> {
    let mut groups = Vec::new();
    if let Err(err) = try_walk(frame, 0, max_depth, &mut groups) {
        debug!(error = %err, collected = groups.len(), "frame walk stopped early");
    }
    groups
}

/// Strict recursive pass over one message level.
///
/// Returns the number of varint fields recorded in this sub-tree, or the
/// decode error that stopped it. The caller decides whether an error means
/// "opaque bytes" (nested level) or "end of frame" (top level); fields
/// grouped before the error are kept either way.
fn try_walk(buf: &[u8], depth: u8, max_depth: u8, groups: &mut Vec<FieldGroup>) -> Result<usize> {
    let mut current = Vec::new();
    let mut recorded = 0usize;
    let mut i = 0usize;

    let result = loop {
        if i >= buf.len() {
            break Ok(());
        }
        let (tag, next) = match read_varint(buf, i) {
            Ok(ok) => ok,
            Err(err) => break Err(err),
        };
        i = next;
        let field_number = (tag >> 3) as u32;
        let wire_type = match WireType::try_from((tag & 0x7) as u8) {
            Ok(wt) => wt,
            Err(err) => break Err(err),
        };

        match wire_type {
            WireType::Varint => {
                let (value, next) = match read_varint(buf, i) {
                    Ok(ok) => ok,
                    Err(err) => break Err(err),
                };
                i = next;
                current.push(DecodedField {
                    field_number,
                    value,
                });
                recorded += 1;
            }
            WireType::LengthDelimited => {
                let (len, next) = match read_varint(buf, i) {
                    Ok(ok) => ok,
                    Err(err) => break Err(err),
                };
                i = next;
                let len = len as usize;
                let end = match i.checked_add(len) {
                    Some(end) if end <= buf.len() => end,
                    _ => {
                        break Err(FrameError::TruncatedInput {
                            expected: len,
                            actual: buf.len().saturating_sub(i),
                        })
                    }
                };
                if len > 0 && depth < max_depth {
                    // Heuristic recursion: a clean sub-walk that yields
                    // fields wins, anything else leaves the blob opaque.
                    let before = groups.len();
                    match try_walk(&buf[i..end], depth + 1, max_depth, groups) {
                        Ok(n) if n > 0 => recorded += n,
                        Ok(_) => {
                            groups.truncate(before);
                            trace!(field_number, depth, len, "empty sub-walk, keeping blob opaque");
                        }
                        Err(err) => {
                            groups.truncate(before);
                            trace!(
                                field_number,
                                depth,
                                len,
                                error = %err,
                                "sub-walk failed, keeping blob opaque"
                            );
                        }
                    }
                }
                i = end;
            }
            WireType::Fixed64 => {
                if i + 8 > buf.len() {
                    break Err(FrameError::TruncatedInput {
                        expected: 8,
                        actual: buf.len() - i,
                    });
                }
                i += 8;
            }
            WireType::Fixed32 => {
                if i + 4 > buf.len() {
                    break Err(FrameError::TruncatedInput {
                        expected: 4,
                        actual: buf.len() - i,
                    });
                }
                i += 4;
            }
        }
    };

    if !current.is_empty() {
        groups.push(FieldGroup {
            depth,
            fields: current,
        });
    }
    result.map(|_| recorded)
}

/// Split an inbound payload into concatenated length-delimited frames
/// (varint length prefix + bytes).
///
/// A truncated trailing frame is dropped; everything before it is returned.
pub fn split_frames(payload: &[u8]) -> Vec<&[u8]> {
    let mut frames = Vec::new();
    let mut i = 0usize;
    while i < payload.len() {
        let (len, next) = match read_varint(payload, i) {
            Ok(ok) => ok,
            Err(_) => break,
        };
        let len = len as usize;
        let end = match next.checked_add(len) {
            Some(end) if end <= payload.len() => end,
            _ => break,
        };
        frames.push(&payload[next..end]);
        i = end;
    }
    frames
}
