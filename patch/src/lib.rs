//! Pure text-patching primitives used to interpret assistant edits.
//!
//! Every function here is deterministic and free of I/O: callers hand in the
//! base content plus a patch description and get back either the new content
//! or a classified [`PatchError`]. Failure classification matters because the
//! caller collects diff failures across a whole model response instead of
//! aborting on the first one.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    #[error("empty old_string")]
    EmptyOldString,

    #[error("old_string not found: {0:?}")]
    OldStringNotFound(String),

    #[error("old_string matched {count} times, expected exactly one: {old:?}")]
    OldStringAmbiguous { old: String, count: usize },

    #[error("line range {start}-{end} out of bounds for a file of {len} lines")]
    RangeOutOfBounds {
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("line ranges overlap at line {line}")]
    RangeOverlap { line: usize },
}

/// Result of a single search/replace application.
#[derive(Debug, PartialEq, Eq)]
pub struct ReplaceOutcome {
    pub content: String,
    /// `old == new`: the patch validated but changed nothing. Reported so the
    /// caller can flag it; not an error.
    pub no_op: bool,
}

/// Replace `old` with `new` in `base`.
///
/// Without `replace_all` the needle must occur exactly once; zero occurrences
/// are [`PatchError::OldStringNotFound`] and more than one is
/// [`PatchError::OldStringAmbiguous`]. With `replace_all` every
/// non-overlapping occurrence is replaced (at least one required). The search
/// is a literal byte match, no normalization.
pub fn apply_search_replace(
    base: &str,
    old: &str,
    new: &str,
    replace_all: bool,
) -> Result<ReplaceOutcome, PatchError> {
    if old.is_empty() {
        return Err(PatchError::EmptyOldString);
    }

    let count = base.matches(old).count();
    if count == 0 {
        return Err(PatchError::OldStringNotFound(old.to_string()));
    }
    if !replace_all && count > 1 {
        return Err(PatchError::OldStringAmbiguous {
            old: old.to_string(),
            count,
        });
    }

    if old == new {
        return Ok(ReplaceOutcome {
            content: base.to_string(),
            no_op: true,
        });
    }

    let content = if replace_all {
        base.replace(old, new)
    } else {
        base.replacen(old, new, 1)
    };
    Ok(ReplaceOutcome { content, no_op: false })
}

/// One edit of a multi search/replace batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiEdit {
    pub old: String,
    pub new: String,
    pub replace_all: bool,
}

/// Failure inside a multi search/replace batch: the 0-based index of the
/// offending edit plus the underlying classification.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("edit {index}: {source}")]
pub struct MultiPatchError {
    pub index: usize,
    #[source]
    pub source: PatchError,
}

/// Apply `edits` sequentially, each on the output of the previous one. Any
/// failing edit aborts the whole batch, so a batch is all-or-nothing.
pub fn apply_search_replace_multi(
    base: &str,
    edits: &[MultiEdit],
) -> Result<String, MultiPatchError> {
    let mut content = base.to_string();
    for (index, edit) in edits.iter().enumerate() {
        let outcome = apply_search_replace(&content, &edit.old, &edit.new, edit.replace_all)
            .map_err(|source| MultiPatchError { index, source })?;
        content = outcome.content;
    }
    Ok(content)
}

/// One anchored line-range change. Lines are 1-indexed and the range is
/// inclusive; `end == start - 1` inserts `content` before line `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchoredChange {
    pub start: usize,
    pub end: usize,
    pub content: String,
}

/// Result of an anchored patch application.
#[derive(Debug, PartialEq, Eq)]
pub struct AnchoredOutcome {
    pub content: String,
    /// Input-order indices of changes whose content matched the existing
    /// slice verbatim. Dropped, reported, not an error.
    pub dropped_no_ops: Vec<usize>,
}

/// Apply anchored line-range changes to `base`.
///
/// Ranges need not arrive sorted; they are sorted by `start` and applied from
/// the highest range downwards so earlier indices stay valid. Overlapping
/// ranges and out-of-bounds ranges fail the whole patch. Output lines are
/// joined with `\n` regardless of platform.
pub fn apply_anchored(
    base: &str,
    changes: &[AnchoredChange],
) -> Result<AnchoredOutcome, PatchError> {
    let had_trailing_newline = base.ends_with('\n');
    let mut lines: Vec<String> = base.lines().map(str::to_string).collect();
    let len = lines.len();

    // Validate bounds before touching anything.
    for change in changes {
        let insert = change.end + 1 == change.start;
        let valid = if insert {
            // Insertion point may sit one past the last line.
            change.start >= 1 && change.start <= len + 1
        } else {
            change.start >= 1 && change.end >= change.start && change.end <= len
        };
        if !valid {
            return Err(PatchError::RangeOutOfBounds {
                start: change.start,
                end: change.end,
                len,
            });
        }
    }

    let mut ordered: Vec<(usize, &AnchoredChange)> = changes.iter().enumerate().collect();
    ordered.sort_by_key(|(_, c)| c.start);

    for window in ordered.windows(2) {
        let (_, a) = window[0];
        let (_, b) = window[1];
        if a.end >= b.start {
            return Err(PatchError::RangeOverlap { line: b.start });
        }
    }

    let mut dropped_no_ops = Vec::new();
    let mut to_apply = Vec::new();
    for (input_index, change) in &ordered {
        let existing = if change.end < change.start {
            String::new()
        } else {
            lines[change.start - 1..change.end].join("\n")
        };
        if existing == change.content {
            dropped_no_ops.push(*input_index);
        } else {
            to_apply.push(*change);
        }
    }
    dropped_no_ops.sort_unstable();

    // Highest start first so splices below do not shift pending ranges.
    for change in to_apply.iter().rev() {
        let replacement: Vec<String> = if change.content.is_empty() {
            Vec::new()
        } else {
            change.content.split('\n').map(str::to_string).collect()
        };
        if change.end < change.start {
            lines.splice(change.start - 1..change.start - 1, replacement);
        } else {
            lines.splice(change.start - 1..change.end, replacement);
        }
    }

    let mut content = lines.join("\n");
    if had_trailing_newline && !content.is_empty() {
        content.push('\n');
    }
    Ok(AnchoredOutcome {
        content,
        dropped_no_ops,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::expect_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn replaces_single_occurrence() {
        let outcome = apply_search_replace("Goblin\nOrc\n", "Goblin", "Goblin 👺", false)
            .expect("patch applies");
        assert_eq!(outcome.content, "Goblin 👺\nOrc\n");
        assert!(!outcome.no_op);
    }

    #[test]
    fn missing_old_string_is_classified() {
        let err = apply_search_replace("fn main() {}", "fn other", "x", false)
            .expect_err("needle absent");
        assert_eq!(err, PatchError::OldStringNotFound("fn other".to_string()));
        assert!(err.to_string().contains("old_string not found"));
    }

    #[test]
    fn ambiguous_old_string_requires_replace_all() {
        let err = apply_search_replace("a b a", "a", "c", false).expect_err("two matches");
        assert_eq!(
            err,
            PatchError::OldStringAmbiguous {
                old: "a".to_string(),
                count: 2
            }
        );

        let outcome = apply_search_replace("a b a", "a", "c", true).expect("replace_all");
        assert_eq!(outcome.content, "c b c");
    }

    #[test]
    fn empty_old_string_rejected() {
        assert_eq!(
            apply_search_replace("anything", "", "x", true),
            Err(PatchError::EmptyOldString)
        );
    }

    #[test]
    fn identical_old_and_new_is_a_no_op() {
        let outcome = apply_search_replace("let x = 1;", "x", "x", false).expect("validates");
        assert!(outcome.no_op);
        assert_eq!(outcome.content, "let x = 1;");
    }

    #[test]
    fn multi_edits_chain_sequentially() {
        let edits = vec![
            MultiEdit {
                old: "Goblin".to_string(),
                new: "Goblin 👺".to_string(),
                replace_all: false,
            },
            MultiEdit {
                old: "Orc".to_string(),
                new: "Orc 🪓".to_string(),
                replace_all: false,
            },
        ];
        let content = apply_search_replace_multi("Goblin\nOrc\n", &edits).expect("both apply");
        assert_eq!(content, "Goblin 👺\nOrc 🪓\n");
    }

    #[test]
    fn multi_edit_failure_carries_index_and_aborts() {
        let edits = vec![
            MultiEdit {
                old: "L01".to_string(),
                new: "L01x".to_string(),
                replace_all: false,
            },
            MultiEdit {
                old: "MISSING_LINE".to_string(),
                new: "x".to_string(),
                replace_all: false,
            },
        ];
        let err = apply_search_replace_multi("L01\nL02\n", &edits).expect_err("second edit fails");
        assert_eq!(err.index, 1);
        assert_eq!(
            err.source,
            PatchError::OldStringNotFound("MISSING_LINE".to_string())
        );
    }

    #[test]
    fn later_multi_edit_sees_earlier_output() {
        let edits = vec![
            MultiEdit {
                old: "one".to_string(),
                new: "two".to_string(),
                replace_all: false,
            },
            MultiEdit {
                old: "two two".to_string(),
                new: "done".to_string(),
                replace_all: false,
            },
        ];
        let content = apply_search_replace_multi("one two", &edits).expect("chained");
        assert_eq!(content, "done");
    }

    #[test]
    fn anchored_replaces_and_inserts() {
        let base = "one\ntwo\nthree\n";
        let changes = vec![
            AnchoredChange {
                start: 2,
                end: 2,
                content: "TWO".to_string(),
            },
            AnchoredChange {
                start: 1,
                end: 0,
                content: "zero".to_string(),
            },
        ];
        let outcome = apply_anchored(base, &changes).expect("applies");
        assert_eq!(outcome.content, "zero\none\nTWO\nthree\n");
        assert!(outcome.dropped_no_ops.is_empty());
    }

    #[test]
    fn anchored_applies_unsorted_ranges() {
        let base = "a\nb\nc\nd\n";
        let changes = vec![
            AnchoredChange {
                start: 4,
                end: 4,
                content: "D".to_string(),
            },
            AnchoredChange {
                start: 1,
                end: 2,
                content: "AB".to_string(),
            },
        ];
        let outcome = apply_anchored(base, &changes).expect("applies");
        assert_eq!(outcome.content, "AB\nc\nD\n");
    }

    #[test]
    fn anchored_rejects_overlap() {
        let base = "a\nb\nc\n";
        let changes = vec![
            AnchoredChange {
                start: 1,
                end: 2,
                content: "x".to_string(),
            },
            AnchoredChange {
                start: 2,
                end: 3,
                content: "y".to_string(),
            },
        ];
        assert_eq!(
            apply_anchored(base, &changes),
            Err(PatchError::RangeOverlap { line: 2 })
        );
    }

    #[test]
    fn anchored_rejects_out_of_bounds() {
        let base = "a\nb\n";
        let changes = vec![AnchoredChange {
            start: 2,
            end: 5,
            content: "x".to_string(),
        }];
        assert_eq!(
            apply_anchored(base, &changes),
            Err(PatchError::RangeOutOfBounds {
                start: 2,
                end: 5,
                len: 2
            })
        );
    }

    #[test]
    fn anchored_drops_verbatim_no_ops() {
        let base = "keep\nchange\n";
        let changes = vec![
            AnchoredChange {
                start: 1,
                end: 1,
                content: "keep".to_string(),
            },
            AnchoredChange {
                start: 2,
                end: 2,
                content: "changed".to_string(),
            },
        ];
        let outcome = apply_anchored(base, &changes).expect("applies");
        assert_eq!(outcome.content, "keep\nchanged\n");
        assert_eq!(outcome.dropped_no_ops, vec![0]);
    }

    #[test]
    fn anchored_deletes_with_empty_content() {
        let base = "a\nb\nc\n";
        let changes = vec![AnchoredChange {
            start: 2,
            end: 2,
            content: String::new(),
        }];
        let outcome = apply_anchored(base, &changes).expect("applies");
        assert_eq!(outcome.content, "a\nc\n");
    }

    #[test]
    fn anchored_insert_past_last_line() {
        let base = "a\n";
        let changes = vec![AnchoredChange {
            start: 2,
            end: 1,
            content: "b".to_string(),
        }];
        let outcome = apply_anchored(base, &changes).expect("applies");
        assert_eq!(outcome.content, "a\nb\n");
    }
}
