//! Selective line merge between a local text and a fetched revision.
//!
//! The remote text is shown to the user as the "new" side of a diff. The
//! user selects line ranges in that view; each range is mapped back onto the
//! local ("old") text through the hunk list and turned into a [`TextEdit`].
//! All edits are computed against the same hunk list and then applied in one
//! pass, so they never observe each other's effects.

use std::str::FromStr;

use similar::{Algorithm, DiffOp, TextDiff, capture_diff_slices};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkTag {
    Added,
    Removed,
    Unchanged,
}

/// A maximal run of lines with one tag.
///
/// `at_old` and `at_new` are the running line offsets where the hunk starts
/// in the old and new sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hunk {
    pub tag: HunkTag,
    pub count: usize,
    pub at_old: usize,
    pub at_new: usize,
}

impl Hunk {
    pub fn old_count(&self) -> usize {
        match self.tag {
            HunkTag::Added => 0,
            HunkTag::Removed | HunkTag::Unchanged => self.count,
        }
    }

    pub fn new_count(&self) -> usize {
        match self.tag {
            HunkTag::Removed => 0,
            HunkTag::Added | HunkTag::Unchanged => self.count,
        }
    }
}

/// Inclusive, zero-based line range in new-text coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSelection {
    pub start_line: usize,
    pub end_line: usize,
}

impl MergeSelection {
    pub fn new(start_line: usize, end_line: usize) -> Self {
        Self {
            start_line: start_line.min(end_line),
            end_line: start_line.max(end_line),
        }
    }

    pub fn line(line: usize) -> Self {
        Self::new(line, line)
    }
}

/// Parses one-based `N` or `A-B`, as typed on a command line.
impl FromStr for MergeSelection {
    type Err = MergeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || MergeError::InvalidSelection(value.to_string());
        let parse = |part: &str| -> Result<usize, MergeError> {
            match part.trim().parse::<usize>() {
                Ok(line) if line > 0 => Ok(line - 1),
                _ => Err(invalid()),
            }
        };
        match value.split_once('-') {
            Some((start, end)) => Ok(Self::new(parse(start)?, parse(end)?)),
            None => Ok(Self::line(parse(value)?)),
        }
    }
}

/// Replace old lines `start..end` with `text`. `start == end` is an insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextEdit {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

impl TextEdit {
    pub fn is_insertion(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("selection {start_line}-{end_line} is outside the remote text ({line_count} lines)")]
    SelectionOutOfRange {
        start_line: usize,
        end_line: usize,
        line_count: usize,
    },
    #[error("edit {start}..{end} is outside the local text ({line_count} lines)")]
    EditOutOfBounds {
        start: usize,
        end: usize,
        line_count: usize,
    },
    #[error("selected changes overlap at local lines {first_start}..{first_end} and {second_start}..{second_end}")]
    OverlappingEdits {
        first_start: usize,
        first_end: usize,
        second_start: usize,
        second_end: usize,
    },
    #[error("invalid line selection `{0}`")]
    InvalidSelection(String),
}

pub fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Lines with their terminators kept, so joining them restores the text.
pub fn split_lines(text: &str) -> Vec<&str> {
    text.split_inclusive('\n').collect()
}

pub fn compute_hunks(old_lines: &[&str], new_lines: &[&str]) -> Vec<Hunk> {
    let mut builder = HunkBuilder::default();
    for op in capture_diff_slices(Algorithm::Myers, old_lines, new_lines) {
        match op {
            DiffOp::Equal { len, .. } => builder.unchanged(len),
            DiffOp::Delete { old_len, .. } => builder.removed += old_len,
            DiffOp::Insert { new_len, .. } => builder.added += new_len,
            DiffOp::Replace {
                old_len, new_len, ..
            } => {
                builder.removed += old_len;
                builder.added += new_len;
            }
        }
    }
    builder.finish()
}

/// Accumulates a change run so removals always precede additions.
#[derive(Default)]
struct HunkBuilder {
    hunks: Vec<Hunk>,
    removed: usize,
    added: usize,
    at_old: usize,
    at_new: usize,
}

impl HunkBuilder {
    fn push(&mut self, tag: HunkTag, count: usize) {
        if count == 0 {
            return;
        }
        match self.hunks.last_mut() {
            Some(last) if last.tag == tag => last.count += count,
            _ => self.hunks.push(Hunk {
                tag,
                count,
                at_old: self.at_old,
                at_new: self.at_new,
            }),
        }
        if tag != HunkTag::Added {
            self.at_old += count;
        }
        if tag != HunkTag::Removed {
            self.at_new += count;
        }
    }

    fn flush(&mut self) {
        let (removed, added) = (self.removed, self.added);
        self.removed = 0;
        self.added = 0;
        self.push(HunkTag::Removed, removed);
        self.push(HunkTag::Added, added);
    }

    fn unchanged(&mut self, count: usize) {
        self.flush();
        self.push(HunkTag::Unchanged, count);
    }

    fn finish(mut self) -> Vec<Hunk> {
        self.flush();
        self.hunks
    }
}

fn hunk_for_new_line(hunks: &[Hunk], line: usize) -> Option<usize> {
    hunks
        .iter()
        .position(|hunk| hunk.tag != HunkTag::Removed && hunk.at_new + hunk.count > line)
}

/// Map one selection onto an edit of the old text. `None` means no-op.
pub fn selection_edit(
    hunks: &[Hunk],
    new_lines: &[&str],
    selection: MergeSelection,
) -> Result<Option<TextEdit>, MergeError> {
    let MergeSelection {
        start_line,
        end_line,
    } = selection;
    let out_of_range = || MergeError::SelectionOutOfRange {
        start_line,
        end_line,
        line_count: new_lines.len(),
    };

    let mut start = hunk_for_new_line(hunks, start_line).ok_or_else(out_of_range)?;
    let mut end_line = end_line;
    let end = match hunk_for_new_line(hunks, end_line) {
        Some(index) => index,
        None => {
            let index = hunks
                .iter()
                .rposition(|hunk| hunk.tag != HunkTag::Removed)
                .ok_or_else(out_of_range)?;
            end_line = new_lines.len().saturating_sub(1);
            index
        }
    };

    if hunks[start..=end]
        .iter()
        .all(|hunk| hunk.tag == HunkTag::Unchanged)
    {
        return Ok(None);
    }

    if start > 0 && hunks[start - 1].tag == HunkTag::Removed {
        start -= 1;
    }
    let span = &hunks[start..=end];
    let insert_only = span.iter().all(|hunk| hunk.tag == HunkTag::Added);

    // The old side widens to hunk boundaries; the text is only the selected lines.
    let first = hunks[start];
    let last = hunks[end];
    let old_start = if first.tag == HunkTag::Unchanged {
        first.at_old + (start_line - first.at_new)
    } else {
        first.at_old
    };
    let old_end = if last.tag == HunkTag::Unchanged {
        last.at_old + (end_line - last.at_new) + 1
    } else {
        last.at_old + last.old_count()
    };

    let text = new_lines[start_line..=end_line].concat();
    Ok(Some(if insert_only {
        TextEdit {
            start: old_start,
            end: old_start,
            text,
        }
    } else {
        TextEdit {
            start: old_start,
            end: old_end,
            text,
        }
    }))
}

/// Edits for every selection, each computed against the same hunk list.
pub fn merge_edits(
    old: &str,
    new: &str,
    selections: &[MergeSelection],
) -> Result<Vec<TextEdit>, MergeError> {
    let old = normalize_newlines(old);
    let new = normalize_newlines(new);
    let old_lines = split_lines(&old);
    let new_lines = split_lines(&new);
    let hunks = compute_hunks(&old_lines, &new_lines);

    let mut edits = Vec::new();
    for selection in selections {
        if let Some(edit) = selection_edit(&hunks, &new_lines, *selection)? {
            edits.push(edit);
        }
    }
    Ok(edits)
}

/// Apply `edits` to `old` as one transaction: either all apply or none do.
pub fn apply_edits(old: &str, edits: &[TextEdit]) -> Result<String, MergeError> {
    let old = normalize_newlines(old);
    let old_lines = split_lines(&old);

    let mut ordered: Vec<&TextEdit> = edits.iter().collect();
    ordered.sort_by_key(|edit| (edit.start, edit.end));
    ordered.dedup();

    for edit in &ordered {
        if edit.start > edit.end || edit.end > old_lines.len() {
            return Err(MergeError::EditOutOfBounds {
                start: edit.start,
                end: edit.end,
                line_count: old_lines.len(),
            });
        }
    }
    for pair in ordered.windows(2) {
        let (first, second) = (pair[0], pair[1]);
        if second.start < first.end {
            return Err(MergeError::OverlappingEdits {
                first_start: first.start,
                first_end: first.end,
                second_start: second.start,
                second_end: second.end,
            });
        }
    }

    let mut output = String::with_capacity(old.len());
    let mut cursor = 0;
    for edit in ordered {
        output.push_str(&old_lines[cursor..edit.start].concat());
        output.push_str(&edit.text);
        if !edit.text.is_empty() && !edit.text.ends_with('\n') && edit.end < old_lines.len() {
            output.push('\n');
        }
        cursor = edit.end;
    }
    output.push_str(&old_lines[cursor..].concat());
    Ok(output)
}

/// Apply only the selected remote changes to `old`.
pub fn merge(old: &str, new: &str, selections: &[MergeSelection]) -> Result<String, MergeError> {
    let edits = merge_edits(old, new, selections)?;
    apply_edits(old, &edits)
}

/// Edits taking every remote change, one per changed region.
pub fn merge_all_edits(old: &str, new: &str) -> Vec<TextEdit> {
    let old = normalize_newlines(old);
    let new = normalize_newlines(new);
    let old_lines = split_lines(&old);
    let new_lines = split_lines(&new);
    let hunks = compute_hunks(&old_lines, &new_lines);

    let mut edits: Vec<TextEdit> = Vec::new();
    let mut previous_changed = false;
    for hunk in &hunks {
        if hunk.tag == HunkTag::Unchanged {
            previous_changed = false;
            continue;
        }
        let text = new_lines[hunk.at_new..hunk.at_new + hunk.new_count()].concat();
        match edits.last_mut() {
            Some(last) if previous_changed => {
                last.end += hunk.old_count();
                last.text.push_str(&text);
            }
            _ => edits.push(TextEdit {
                start: hunk.at_old,
                end: hunk.at_old + hunk.old_count(),
                text,
            }),
        }
        previous_changed = true;
    }
    edits
}

pub fn merge_all(old: &str, new: &str) -> Result<String, MergeError> {
    apply_edits(old, &merge_all_edits(old, new))
}

/// Unified diff of `old` against `new` for terminal review.
pub fn unified_diff(old: &str, new: &str, old_name: &str, new_name: &str) -> String {
    let old = normalize_newlines(old);
    let new = normalize_newlines(new);
    TextDiff::from_lines(&old, &new)
        .unified_diff()
        .context_radius(3)
        .header(old_name, new_name)
        .to_string()
}
