//! Minimal unified-diff applier.
//!
//! Role agents may return a file as a unified diff against the base branch.
//! The diff is applied when the task hands off, so the aggregated ChangeSet
//! only carries full contents. Hunks are matched exactly; a hunk may float
//! away from its stated line number but context must match verbatim.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    #[error("patch contains no hunks")]
    NoHunks,

    #[error("malformed hunk header: {0}")]
    BadHeader(String),

    #[error("hunk {hunk} (line {line}) does not match the base file")]
    HunkMismatch { hunk: usize, line: usize },
}

#[derive(Debug)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug)]
struct Hunk {
    /// 1-based start line in the original file (0 for an empty original)
    old_start: usize,
    /// Original line count; 0 means a pure insertion after `old_start`
    old_count: usize,
    lines: Vec<HunkLine>,
}

impl Hunk {
    fn old_lines(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
                HunkLine::Add(_) => None,
            })
            .collect()
    }
}

/// Apply `diff` to `original` and return the patched content.
pub fn apply_patch(original: &str, diff: &str) -> Result<String, PatchError> {
    let hunks = parse_hunks(diff)?;
    if hunks.is_empty() {
        return Err(PatchError::NoHunks);
    }

    let lines: Vec<&str> = original.lines().collect();
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    let mut cursor = 0usize;

    for (n, hunk) in hunks.iter().enumerate() {
        let old = hunk.old_lines();
        let anchor = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        let expected = anchor.max(cursor);
        let at = locate(&lines, &old, expected, cursor).ok_or(PatchError::HunkMismatch {
            hunk: n + 1,
            line: hunk.old_start,
        })?;

        out.extend_from_slice(&lines[cursor..at]);
        for line in &hunk.lines {
            match line {
                HunkLine::Context(s) | HunkLine::Add(s) => out.push(s.as_str()),
                HunkLine::Remove(_) => {}
            }
        }
        cursor = at + old.len();
    }
    out.extend_from_slice(&lines[cursor..]);

    let mut result = out.join("\n");
    if !out.is_empty() && (original.is_empty() || original.ends_with('\n')) {
        result.push('\n');
    }
    Ok(result)
}

/// Find `needle` in `lines` at or after `min`, searching outward from `expected`.
fn locate(lines: &[&str], needle: &[&str], expected: usize, min: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(expected.min(lines.len()).max(min));
    }
    let max = lines.len().checked_sub(needle.len())?;
    let fits = |at: usize| at >= min && at <= max && lines[at..at + needle.len()] == *needle;

    for delta in 0..=lines.len() {
        let after = expected + delta;
        if fits(after) {
            return Some(after);
        }
        let before = expected.checked_sub(delta);
        if let Some(before) = before {
            if delta > 0 && fits(before) {
                return Some(before);
            }
        }
        if after > max && before.map_or(true, |b| b < min) {
            break;
        }
    }
    None
}

fn parse_hunks(diff: &str) -> Result<Vec<Hunk>, PatchError> {
    let mut hunks: Vec<Hunk> = Vec::new();
    let body: Vec<&str> = diff.trim_end_matches(['\n', '\r']).lines().collect();
    let mut i = 0;

    while i < body.len() {
        let line = body[i];
        if line.starts_with("@@") {
            let (old_start, old_count) = parse_header(line)?;
            hunks.push(Hunk {
                old_start,
                old_count,
                lines: Vec::new(),
            });
        } else if line.starts_with("diff ")
            || (line.starts_with("--- ") && body.get(i + 1).is_some_and(|n| n.starts_with("+++ ")))
        {
            // file header; the "+++" line is skipped with it
            if line.starts_with("--- ") {
                i += 1;
            }
        } else if let Some(hunk) = hunks.last_mut() {
            if let Some(rest) = line.strip_prefix('+') {
                hunk.lines.push(HunkLine::Add(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix('-') {
                hunk.lines.push(HunkLine::Remove(rest.to_string()));
            } else if let Some(rest) = line.strip_prefix(' ') {
                hunk.lines.push(HunkLine::Context(rest.to_string()));
            } else if line.is_empty() {
                hunk.lines.push(HunkLine::Context(String::new()));
            }
            // "\ No newline at end of file" and other noise is ignored
        }
        i += 1;
    }

    Ok(hunks)
}

/// `@@ -12,5 +12,7 @@ optional section` -> (12, 5). An omitted count is 1.
fn parse_header(line: &str) -> Result<(usize, usize), PatchError> {
    let bad = || PatchError::BadHeader(line.to_string());
    let range = line
        .strip_prefix("@@ -")
        .and_then(|rest| rest.split(' ').next())
        .ok_or_else(bad)?;
    let (start, count) = match range.split_once(',') {
        Some((start, count)) => (start, count.parse().map_err(|_| bad())?),
        None => (range, 1),
    };
    Ok((start.parse().map_err(|_| bad())?, count))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "from fastapi import FastAPI\n\napp = FastAPI()\n\n@app.get(\"/health\")\ndef health():\n    return {\"ok\": True}\n";

    #[test]
    fn test_applies_insertion_with_file_headers() {
        let diff = "\
--- a/server/main.py
+++ b/server/main.py
@@ -1,3 +1,5 @@
 from fastapi import FastAPI
+from server.routers import upload

 app = FastAPI()
+app.include_router(upload.router)
";
        let patched = apply_patch(BASE, diff).unwrap();
        assert!(patched.starts_with(
            "from fastapi import FastAPI\nfrom server.routers import upload\n\napp = FastAPI()\napp.include_router(upload.router)\n"
        ));
        assert!(patched.ends_with("return {\"ok\": True}\n"));
    }

    #[test]
    fn test_hunk_may_drift_from_stated_line() {
        let diff = "@@ -1,2 +1,2 @@\n def health():\n-    return {\"ok\": True}\n+    return {\"ok\": True, \"version\": 2}\n";
        let patched = apply_patch(BASE, diff).unwrap();
        assert!(patched.contains("\"version\": 2"));
        assert!(!patched.contains("{\"ok\": True}\n"));
    }

    #[test]
    fn test_mismatched_context_is_rejected() {
        let diff = "@@ -1,1 +1,1 @@\n-import flask\n+import fastapi\n";
        assert_eq!(
            apply_patch(BASE, diff).unwrap_err(),
            PatchError::HunkMismatch { hunk: 1, line: 1 }
        );
    }

    #[test]
    fn test_new_file_from_empty_original() {
        let diff = "--- /dev/null\n+++ b/supabase/migrations/001_uploads.sql\n@@ -0,0 +1,2 @@\n+create table uploads (id uuid primary key);\n+create index on uploads (id);\n";
        assert_eq!(
            apply_patch("", diff).unwrap(),
            "create table uploads (id uuid primary key);\ncreate index on uploads (id);\n"
        );
    }

    #[test]
    fn test_zero_count_hunk_inserts_after_stated_line() {
        assert_eq!(apply_patch("a\nb\nc\n", "@@ -3,0 +4 @@\n+d\n").unwrap(), "a\nb\nc\nd\n");
        assert_eq!(
            apply_patch("a\nb\nc\n", "@@ -1,0 +2,2 @@\n+x\n+y\n").unwrap(),
            "a\nx\ny\nb\nc\n"
        );
        assert_eq!(apply_patch("a\nb\n", "@@ -0,0 +1 @@\n+top\n").unwrap(), "top\na\nb\n");
    }

    #[test]
    fn test_header_counts() {
        assert_eq!(parse_header("@@ -12,5 +12,7 @@ fn main").unwrap(), (12, 5));
        assert_eq!(parse_header("@@ -3 +3 @@").unwrap(), (3, 1));
        assert_eq!(parse_header("@@ -3,0 +4 @@").unwrap(), (3, 0));
    }

    #[test]
    fn test_no_hunks() {
        assert_eq!(apply_patch(BASE, "just prose").unwrap_err(), PatchError::NoHunks);
        assert!(matches!(
            apply_patch(BASE, "@@ nonsense @@\n+x").unwrap_err(),
            PatchError::BadHeader(_)
        ));
    }
}
