//! Diff editor — line-anchored edit blocks instead of full-file rewrites.
//!
//! The coder engine is asked for numbered `EDIT n:` blocks; we parse,
//! validate against the current file, and splice bottom-up so earlier
//! edits never shift the line numbers of later ones.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditBlock {
    /// 1-based, inclusive.
    pub start_line: usize,
    pub end_line: usize,
    /// When non-empty, must equal the file's current content on the range.
    pub old_content: String,
    pub new_content: String,
    pub description: String,
}

/// Prompt instructing the engine to reply with edit blocks only.
pub fn build_edit_prompt(path: &Path, existing: &str, instructions: &str) -> String {
    let width = existing.lines().count().to_string().len().max(4);
    let numbered: Vec<String> = existing
        .lines()
        .enumerate()
        .map(|(i, line)| format!("{:>width$} | {}", i + 1, line, width = width))
        .collect();

    format!(
        "You are editing the file: {}\n\n\
         Current file content (with line numbers):\n```\n{}\n```\n\n\
         User instructions: {}\n\n\
         Generate ONLY the specific edits needed. For each edit specify the \
         line range, the old content being replaced, the new content, and a \
         brief description.\n\n\
         Format your response as:\n\
         EDIT 1:\n\
         Lines: <start>-<end>\n\
         Description: <what this edit does>\n\
         Old:\n```\n<old content>\n```\n\
         New:\n```\n<new content>\n```\n\n\
         EDIT 2:\n...\n\n\
         Do NOT regenerate the entire file. Only the blocks that change.",
        path.display(),
        numbered.join("\n"),
        instructions
    )
}

static EDIT_HEADER: Lazy<Regex> = Lazy::new(|| Regex::new(r"EDIT\s+\d+:").unwrap());
static LINES_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Lines?:\s*(\d+)(?:\s*-\s*(\d+))?").unwrap());
static DESCRIPTION_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Description:\s*([^\n]+)").unwrap());
static OLD_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)Old:\s*```[^\n]*\n(.*?)```").unwrap());
static NEW_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)New:\s*```[^\n]*\n(.*?)```").unwrap());

/// Parse model output into edit blocks. Tolerates whitespace and ordering
/// inside each block; blocks missing the line range or the new-content
/// fence are discarded.
pub fn parse_edit_blocks(model_output: &str) -> Vec<EditBlock> {
    let mut boundaries: Vec<usize> = EDIT_HEADER
        .find_iter(model_output)
        .map(|m| m.start())
        .collect();
    boundaries.push(model_output.len());

    let mut blocks = Vec::new();
    for window in boundaries.windows(2) {
        let section = &model_output[window[0]..window[1]];
        if let Some(block) = parse_single_edit(section) {
            blocks.push(block);
        }
    }
    blocks
}

fn parse_single_edit(section: &str) -> Option<EditBlock> {
    let lines = LINES_FIELD.captures(section)?;
    let start_line: usize = lines[1].parse().ok()?;
    let end_line: usize = lines
        .get(2)
        .map(|m| m.as_str().parse().ok())
        .unwrap_or(Some(start_line))?;

    let new_content = NEW_FIELD.captures(section)?[1].trim().to_string();
    let old_content = OLD_FIELD
        .captures(section)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    let description = DESCRIPTION_FIELD
        .captures(section)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_else(|| "No description".to_string());

    Some(EditBlock {
        start_line,
        end_line,
        old_content,
        new_content,
        description,
    })
}

/// Render blocks back into the wire format; inverse of
/// [`parse_edit_blocks`] for valid block lists.
pub fn render_blocks(blocks: &[EditBlock]) -> String {
    let mut out = String::new();
    for (i, block) in blocks.iter().enumerate() {
        out.push_str(&format!(
            "EDIT {}:\nLines: {}-{}\nDescription: {}\nOld:\n```\n{}\n```\nNew:\n```\n{}\n```\n\n",
            i + 1,
            block.start_line,
            block.end_line,
            block.description,
            block.old_content,
            block.new_content
        ));
    }
    out
}

/// Validate blocks against the current file. Returns human-readable
/// errors; an empty vector means the blocks are safe to apply.
pub fn validate_edits(existing: &str, blocks: &[EditBlock]) -> Vec<String> {
    let lines: Vec<&str> = existing.lines().collect();
    let line_count = lines.len();
    let mut errors = Vec::new();

    for (i, block) in blocks.iter().enumerate() {
        let n = i + 1;
        if block.start_line < 1 {
            errors.push(format!("edit {}: start line {} must be >= 1", n, block.start_line));
            continue;
        }
        if block.start_line > block.end_line {
            errors.push(format!(
                "edit {}: start line {} > end line {}",
                n, block.start_line, block.end_line
            ));
            continue;
        }
        if block.end_line > line_count {
            errors.push(format!(
                "edit {}: end line {} exceeds file length {}",
                n, block.end_line, line_count
            ));
            continue;
        }
        if !block.old_content.is_empty() {
            let actual = normalize(&lines[block.start_line - 1..block.end_line].join("\n"));
            let expected = normalize(&block.old_content);
            if actual != expected {
                errors.push(format!(
                    "edit {}: old content mismatch at lines {}-{} (file has {:?})",
                    n,
                    block.start_line,
                    block.end_line,
                    truncate(&actual, 60)
                ));
            }
        }
    }

    for i in 0..blocks.len() {
        for j in (i + 1)..blocks.len() {
            let (a, b) = (&blocks[i], &blocks[j]);
            if a.start_line <= b.end_line && b.start_line <= a.end_line {
                errors.push(format!("edit {} and edit {} overlap", i + 1, j + 1));
            }
        }
    }

    errors
}

/// Trailing whitespace per line is not meaningful in the comparison.
fn normalize(content: &str) -> String {
    content
        .lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max])
    }
}

/// Apply blocks to `existing`. Blocks are spliced from the bottom of the
/// file upward so line numbers never shift under an unapplied edit.
pub fn apply_edits(existing: &str, blocks: &[EditBlock]) -> String {
    if blocks.is_empty() {
        return existing.to_string();
    }

    let had_trailing_newline = existing.ends_with('\n');
    let mut lines: Vec<String> = existing.lines().map(|l| l.to_string()).collect();

    let mut sorted: Vec<&EditBlock> = blocks.iter().collect();
    sorted.sort_by(|a, b| b.start_line.cmp(&a.start_line));

    for block in sorted {
        let start = block.start_line - 1;
        let end = block.end_line.min(lines.len());
        let replacement: Vec<String> = if block.new_content.is_empty() {
            Vec::new()
        } else {
            block.new_content.lines().map(|l| l.to_string()).collect()
        };
        lines.splice(start..end, replacement);
    }

    let mut out = lines.join("\n");
    if had_trailing_newline && !out.is_empty() {
        out.push('\n');
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub struct Savings {
    pub full_tokens: usize,
    pub diff_tokens: usize,
    pub savings_pct: f64,
}

/// Per-edit formatting overhead (line numbers, fences, description).
const EDIT_OVERHEAD_TOKENS: usize = 50;

/// Informational estimate of what diff mode saves over regenerating the
/// whole file, at the usual 4-characters-per-token approximation.
pub fn estimate_savings(existing: &str, blocks: &[EditBlock]) -> Savings {
    let full_tokens = existing.len() / 4;
    let edit_chars: usize = blocks
        .iter()
        .map(|b| b.old_content.len() + b.new_content.len())
        .sum();
    let diff_tokens = edit_chars / 4 + blocks.len() * EDIT_OVERHEAD_TOKENS;
    let savings_pct = if full_tokens > 0 {
        (full_tokens as f64 - diff_tokens as f64) / full_tokens as f64 * 100.0
    } else {
        0.0
    };
    Savings {
        full_tokens,
        diff_tokens,
        savings_pct,
    }
}

/// Single-hunk unified diff for display. Finds the common prefix and
/// suffix and prints the changed middle; enough for edit previews without
/// a full LCS pass.
pub fn unified_diff(original: &str, modified: &str, name: &str) -> String {
    if original == modified {
        return String::new();
    }

    let old_lines: Vec<&str> = original.lines().collect();
    let new_lines: Vec<&str> = modified.lines().collect();

    let mut prefix = 0;
    while prefix < old_lines.len()
        && prefix < new_lines.len()
        && old_lines[prefix] == new_lines[prefix]
    {
        prefix += 1;
    }
    let mut suffix = 0;
    while suffix < old_lines.len() - prefix
        && suffix < new_lines.len() - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    let old_mid = &old_lines[prefix..old_lines.len() - suffix];
    let new_mid = &new_lines[prefix..new_lines.len() - suffix];

    let mut out = format!("--- {} (original)\n+++ {} (modified)\n", name, name);
    out.push_str(&format!(
        "@@ -{},{} +{},{} @@\n",
        prefix + 1,
        old_mid.len(),
        prefix + 1,
        new_mid.len()
    ));
    for line in old_mid {
        out.push_str(&format!("-{}\n", line));
    }
    for line in new_mid {
        out.push_str(&format!("+{}\n", line));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = "def add(a, b):\n    return a + b\n\ndef sub(a, b):\n    return a - b\n";

    fn sample_blocks() -> Vec<EditBlock> {
        vec![
            EditBlock {
                start_line: 1,
                end_line: 1,
                old_content: "def add(a, b):".to_string(),
                new_content: "def add(a: int, b: int) -> int:".to_string(),
                description: "Add type hints to add".to_string(),
            },
            EditBlock {
                start_line: 4,
                end_line: 4,
                old_content: "def sub(a, b):".to_string(),
                new_content: "def sub(a: int, b: int) -> int:".to_string(),
                description: "Add type hints to sub".to_string(),
            },
        ]
    }

    #[test]
    fn parse_render_round_trip() {
        let blocks = sample_blocks();
        let parsed = parse_edit_blocks(&render_blocks(&blocks));
        assert_eq!(parsed, blocks);
    }

    #[test]
    fn parse_tolerates_prose_and_discards_incomplete_blocks() {
        let output = "Sure, here are the edits.\n\
            EDIT 1:\nLines: 2\nDescription: tweak\nOld:\n```\n    return a + b\n```\nNew:\n```\n    return int(a + b)\n```\n\
            EDIT 2:\nDescription: missing range and fences\n\
            Trailing commentary.";
        let blocks = parse_edit_blocks(output);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start_line, 2);
        assert_eq!(blocks[0].end_line, 2);
        assert_eq!(blocks[0].new_content, "    return int(a + b)");
    }

    #[test]
    fn validate_accepts_matching_blocks() {
        assert!(validate_edits(FILE, &sample_blocks()).is_empty());
    }

    #[test]
    fn validate_rejects_out_of_bounds() {
        let block = EditBlock {
            start_line: 4,
            end_line: 9,
            old_content: String::new(),
            new_content: "x = 1".to_string(),
            description: String::new(),
        };
        let errors = validate_edits(FILE, &[block]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("exceeds file length"));
    }

    #[test]
    fn validate_rejects_overlap() {
        let mut blocks = sample_blocks();
        blocks[1].start_line = 1;
        blocks[1].end_line = 2;
        blocks[1].old_content = String::new();
        let errors = validate_edits(FILE, &blocks);
        assert!(errors.iter().any(|e| e.contains("overlap")));
    }

    #[test]
    fn validate_rejects_stale_old_content() {
        let mut blocks = sample_blocks();
        blocks[0].old_content = "def add(x, y):".to_string();
        let errors = validate_edits(FILE, &blocks);
        assert!(errors.iter().any(|e| e.contains("old content mismatch")));
    }

    #[test]
    fn validate_rejects_edit_on_empty_file() {
        let block = EditBlock {
            start_line: 1,
            end_line: 1,
            old_content: String::new(),
            new_content: "x = 1".to_string(),
            description: String::new(),
        };
        let errors = validate_edits("", &[block]);
        assert!(!errors.is_empty());
    }

    #[test]
    fn apply_splices_bottom_up() {
        let result = apply_edits(FILE, &sample_blocks());
        assert!(result.contains("def add(a: int, b: int) -> int:"));
        assert!(result.contains("def sub(a: int, b: int) -> int:"));
        assert!(result.contains("    return a + b"));
        // Line count unchanged: both edits replace one line with one line.
        assert_eq!(result.lines().count(), FILE.lines().count());
    }

    #[test]
    fn apply_preserves_untouched_lines_and_length_accounting() {
        let block = EditBlock {
            start_line: 2,
            end_line: 2,
            old_content: "    return a + b".to_string(),
            new_content: "    total = a + b\n    return total".to_string(),
            description: String::new(),
        };
        assert!(validate_edits(FILE, &[block.clone()]).is_empty());
        let result = apply_edits(FILE, &[block]);

        let expected_len = FILE.lines().count() - 1 + 2;
        assert_eq!(result.lines().count(), expected_len);
        // Lines outside the block are byte-identical.
        assert_eq!(result.lines().next().unwrap(), "def add(a, b):");
        assert_eq!(result.lines().last().unwrap(), "    return a - b");
    }

    #[test]
    fn apply_with_no_blocks_is_identity() {
        assert_eq!(apply_edits(FILE, &[]), FILE);
    }

    #[test]
    fn apply_empty_new_content_deletes_lines() {
        let block = EditBlock {
            start_line: 3,
            end_line: 3,
            old_content: String::new(),
            new_content: String::new(),
            description: "drop blank line".to_string(),
        };
        let result = apply_edits(FILE, &[block]);
        assert_eq!(result.lines().count(), FILE.lines().count() - 1);
    }

    #[test]
    fn savings_positive_for_small_edits_on_large_file() {
        let big: String = (0..200).map(|i| format!("line_{} = {}\n", i, i)).collect();
        let block = EditBlock {
            start_line: 5,
            end_line: 5,
            old_content: "line_4 = 4".to_string(),
            new_content: "line_4 = 40".to_string(),
            description: String::new(),
        };
        let savings = estimate_savings(&big, &[block]);
        assert!(savings.savings_pct > 0.0);
        assert!(savings.diff_tokens < savings.full_tokens);
    }

    #[test]
    fn edit_prompt_numbers_lines_and_carries_instructions() {
        let prompt = build_edit_prompt(Path::new("calc.py"), FILE, "add type hints");
        assert!(prompt.contains("   1 | def add(a, b):"));
        assert!(prompt.contains("add type hints"));
        assert!(prompt.contains("EDIT 1:"));
    }

    #[test]
    fn unified_diff_marks_changed_lines_only() {
        let modified = FILE.replace("a + b", "a + b  # sum");
        let diff = unified_diff(FILE, &modified, "calc.py");
        assert!(diff.contains("--- calc.py (original)"));
        assert!(diff.contains("-    return a + b"));
        assert!(diff.contains("+    return a + b  # sum"));
        assert!(!diff.contains("-def add"));
    }

    #[test]
    fn unified_diff_empty_for_identical_input() {
        assert!(unified_diff(FILE, FILE, "calc.py").is_empty());
    }
}
