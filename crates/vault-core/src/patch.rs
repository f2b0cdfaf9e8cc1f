//! Text patch codec for delta version records.
//!
//! A [`PatchScript`] is a sequence of retain/delete/insert operations over the
//! bytes of a base text. Scripts are produced from a line-granular Myers diff and
//! applied strictly: a delete must match the base exactly, retains must land on
//! character boundaries, and the whole base must be consumed. Anything else is a
//! [`PatchError::Malformed`], so a corrupted chain fails loudly instead of
//! producing plausible-looking text.
//!
//! Scripts are stored as a JSON array, e.g. `[{"retain":8},{"insert":"body\n"}]`.

use serde::{Deserialize, Serialize};
use similar::{Algorithm, DiffTag, TextDiff};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("Malformed patch: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, PatchError>;

/// One edit operation. Lengths and texts are in bytes of UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    /// Copy the next `n` bytes of the base unchanged.
    Retain(usize),
    /// Skip the given text, which must be the next bytes of the base.
    Delete(String),
    /// Emit new text.
    Insert(String),
}

/// An ordered edit script turning one text into another.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatchScript {
    ops: Vec<PatchOp>,
}

impl PatchScript {
    pub fn ops(&self) -> &[PatchOp] {
        &self.ops
    }

    /// True when applying the script returns the base unchanged.
    pub fn is_noop(&self) -> bool {
        self.ops.iter().all(|op| matches!(op, PatchOp::Retain(_)))
    }

    /// Serialize to the stored payload form.
    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| PatchError::Malformed(e.to_string()))
    }

    /// Parse a stored payload.
    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| PatchError::Malformed(e.to_string()))
    }

    /// Append an operation, merging it into the previous one when both have the same kind.
    fn push(&mut self, op: PatchOp) {
        let empty = match &op {
            PatchOp::Retain(n) => *n == 0,
            PatchOp::Delete(text) | PatchOp::Insert(text) => text.is_empty(),
        };
        if empty {
            return;
        }

        match (self.ops.last_mut(), op) {
            (Some(PatchOp::Retain(prev)), PatchOp::Retain(n)) => *prev += n,
            (Some(PatchOp::Delete(prev)), PatchOp::Delete(text)) => prev.push_str(&text),
            (Some(PatchOp::Insert(prev)), PatchOp::Insert(text)) => prev.push_str(&text),
            (_, op) => self.ops.push(op),
        }
    }
}

/// Compute the script that transforms `old` into `new`.
///
/// Deterministic: the same pair always yields the same script, so stored history
/// can be regenerated byte-for-byte.
pub fn diff(old: &str, new: &str) -> PatchScript {
    let diff = TextDiff::configure()
        .algorithm(Algorithm::Myers)
        .diff_lines(old, new);
    let old_lines = diff.old_slices();
    let new_lines = diff.new_slices();

    let mut script = PatchScript::default();
    for op in diff.ops() {
        let (tag, old_range, new_range) = op.as_tag_tuple();
        match tag {
            DiffTag::Equal => {
                let len = old_lines[old_range].iter().map(|line| line.len()).sum();
                script.push(PatchOp::Retain(len));
            }
            DiffTag::Delete => script.push(PatchOp::Delete(old_lines[old_range].concat())),
            DiffTag::Insert => script.push(PatchOp::Insert(new_lines[new_range].concat())),
            DiffTag::Replace => {
                script.push(PatchOp::Delete(old_lines[old_range].concat()));
                script.push(PatchOp::Insert(new_lines[new_range].concat()));
            }
        }
    }
    script
}

/// Apply a script to `base`.
pub fn apply(base: &str, script: &PatchScript) -> Result<String> {
    let mut out = String::with_capacity(base.len());
    let mut pos = 0usize;

    for (index, op) in script.ops.iter().enumerate() {
        match op {
            PatchOp::Retain(n) => {
                let chunk = pos
                    .checked_add(*n)
                    .and_then(|end| base.get(pos..end))
                    .ok_or_else(|| {
                        PatchError::Malformed(format!(
                            "op {}: cannot retain {} bytes at offset {} of a {}-byte base",
                            index,
                            n,
                            pos,
                            base.len()
                        ))
                    })?;
                out.push_str(chunk);
                pos += n;
            }
            PatchOp::Delete(text) => {
                let matches = base
                    .get(pos..)
                    .map(|rest| rest.starts_with(text.as_str()))
                    .unwrap_or(false);
                if !matches {
                    return Err(PatchError::Malformed(format!(
                        "op {}: deleted text does not match base at offset {}",
                        index, pos
                    )));
                }
                pos += text.len();
            }
            PatchOp::Insert(text) => out.push_str(text),
        }
    }

    if pos != base.len() {
        return Err(PatchError::Malformed(format!(
            "script consumed {} of {} base bytes",
            pos,
            base.len()
        )));
    }

    Ok(out)
}

/// Parse a stored payload and apply it to `base`.
pub fn apply_text(base: &str, payload: &str) -> Result<String> {
    let script = PatchScript::from_text(payload)?;
    apply(base, &script)
}
