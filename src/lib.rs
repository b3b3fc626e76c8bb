//! An in-memory reimplementation of the classic `patch` utility.
//!
//! `fuzzpatch` applies a textual patch (unified diff, context diff, or git
//! extended diff) to file content held in memory. It reproduces the behavior
//! that makes `patch(1)` robust against drifted targets:
//!
//! - **Exact application** at the position the hunk header names, adjusted by
//!   the cumulative line-count delta of earlier hunks.
//! - **Offset recovery**: when the exact position does not match, candidate
//!   positions are found through a content index and ranked by distance from
//!   the expected position.
//! - **Context fuzzing**: failing hunks are retried with progressively more
//!   context lines shaved off the top (and then the bottom) of the hunk.
//! - **Reject recording**: hunks that still fail are recorded, not fatal, and
//!   reported with enough detail to render a `.rej`-style report.
//!
//! # Example
//!
//! ```
//! use fuzzpatch::{apply_patch, ApplyOptions, PatchStatus};
//!
//! let original = "fn main() {\n    println!(\"Hello, world!\");\n}\n";
//! let patch = "\
//! --- a/src/main.rs
//! +++ b/src/main.rs
//! @@ -1,3 +1,3 @@
//!  fn main() {
//! -    println!(\"Hello, world!\");
//! +    println!(\"Hello, fuzzpatch!\");
//!  }
//! ";
//!
//! let outcome = apply_patch(patch, original, &ApplyOptions::default()).unwrap();
//! assert_eq!(outcome.status, PatchStatus::Clean);
//! assert_eq!(
//!     outcome.new_content,
//!     "fn main() {\n    println!(\"Hello, fuzzpatch!\");\n}\n"
//! );
//! ```
//!
//! Parsing is fatal on malformed input; application failures are local. A
//! hunk that cannot be placed is recorded as a reject and the remaining hunks
//! still run. Diagnostics are emitted through the [`log`] facade, so they are
//! silent unless the embedding program installs a logger.

use std::collections::{HashMap, VecDeque};
use std::sync::LazyLock;

use log::{debug, info, trace, warn};
use regex::Regex;
use thiserror::Error;

// --- Header Patterns ---

static GIT_DIFF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^diff --git a/(.*) b/(.*)$").unwrap());

static UNIFIED_HUNK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").unwrap());

static CONTEXT_OLD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\*\*\* (\d+)(?:,(\d+))? \*\*\*\*").unwrap());

static CONTEXT_NEW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^--- (\d+)(?:,(\d+))? ----").unwrap());

// --- Error Types ---

/// Errors raised while parsing or applying a patch.
///
/// These cover structural problems with the patch text and operations the
/// in-memory model cannot honor. A hunk that merely fails to match its target
/// is *not* an error; it becomes a reject in the [`PatchOutcome`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// A hunk header line did not match the grammar of its diff format.
    #[error("malformed patch header at line {line}: '{text}'")]
    MalformedHeader { line: usize, text: String },

    /// A context-format body line carried an unknown control column.
    #[error("malformed hunk #{number}: {detail}")]
    MalformedHunk { number: usize, detail: String },

    /// The hunk body ended before supplying the line counts its header
    /// promised.
    #[error(
        "incomplete hunk #{number} '{header}': expected {expected_old}/{expected_new} \
         old/new lines, found {found_old}/{found_new}"
    )]
    IncompleteHunk {
        number: usize,
        header: String,
        expected_old: usize,
        found_old: usize,
        expected_new: usize,
        found_new: usize,
    },

    /// The input contained no hunks and no standalone git metadata work.
    #[error("no hunks found in patch input")]
    NoHunksFound,

    /// The patch selects more than one target file.
    #[error(
        "patch touches multiple files ('{first}', '{second}'); \
         only single-file patches are supported"
    )]
    MultipleFilesUnsupported { first: String, second: String },

    /// A file-creation hunk was applied to a non-empty target.
    #[error("hunk #{number} creates a file, but the target is not empty")]
    UnsupportedCreate { number: usize },

    /// The patch carries a `GIT binary patch` section.
    #[error("binary patch for '{path}' is not supported")]
    UnsupportedBinaryPatch { path: String },

    /// A context-format hunk asked for whole-file removal.
    #[error("context-format file removal is not supported")]
    UnsupportedContextRemoval,
}

// --- Options ---

/// Line terminator used when reassembling patched content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineEnding {
    /// Unix-style `\n` (the default).
    #[default]
    Lf,
    /// Windows-style `\r\n`.
    CrLf,
}

impl LineEnding {
    /// The literal terminator string.
    ///
    /// ```
    /// use fuzzpatch::LineEnding;
    /// assert_eq!(LineEnding::Lf.as_str(), "\n");
    /// assert_eq!(LineEnding::CrLf.as_str(), "\r\n");
    /// ```
    pub fn as_str(self) -> &'static str {
        match self {
            LineEnding::Lf => "\n",
            LineEnding::CrLf => "\r\n",
        }
    }
}

/// Options controlling how [`apply_patch`] produces its result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplyOptions {
    /// Line ending written into [`PatchOutcome::new_content`].
    pub eol: LineEnding,
}

impl ApplyOptions {
    /// Start building a set of options.
    pub fn builder() -> ApplyOptionsBuilder {
        ApplyOptionsBuilder::default()
    }
}

/// Builder for [`ApplyOptions`].
#[derive(Debug, Default)]
pub struct ApplyOptionsBuilder {
    eol: LineEnding,
}

impl ApplyOptionsBuilder {
    /// Set the output line ending.
    pub fn eol(mut self, eol: LineEnding) -> Self {
        self.eol = eol;
        self
    }

    /// Finish building.
    pub fn build(self) -> ApplyOptions {
        ApplyOptions { eol: self.eol }
    }
}

// --- Git Metadata ---

/// The file-level operation a git extended header describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FileOp {
    Add,
    Delete,
    Rename,
    Copy,
    #[default]
    Modify,
}

/// File mode bits decoded from a git mode line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileMode {
    pub is_symlink: bool,
    pub is_executable: bool,
}

impl FileMode {
    /// Decode the interesting bits of an octal git file mode.
    ///
    /// ```
    /// use fuzzpatch::FileMode;
    /// assert!(FileMode::from_octal(0o100755).is_executable);
    /// assert!(FileMode::from_octal(0o120000).is_symlink);
    /// assert_eq!(FileMode::from_octal(0o100644), FileMode::default());
    /// ```
    pub fn from_octal(mode: u32) -> Self {
        FileMode {
            is_symlink: mode & 0o20000 != 0,
            is_executable: mode & 0o100 != 0,
        }
    }
}

/// Per-file metadata collected from git extended headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Destination path of the operation.
    pub path: String,
    /// Source path for renames and copies.
    pub old_path: Option<String>,
    /// Decoded mode, when the headers carried one.
    pub mode: Option<FileMode>,
    /// What the section does to the file.
    pub op: FileOp,
    /// Whether the section is a `GIT binary patch`.
    pub is_binary: bool,
    /// 1-based patch line of the `diff --git` header, for diagnostics.
    pub source_line: usize,
}

impl FileMetadata {
    fn new(path: String, source_line: usize) -> Self {
        FileMetadata {
            path,
            old_path: None,
            mode: None,
            op: FileOp::Modify,
            is_binary: false,
            source_line,
        }
    }
}

/// Result of scanning a git patch for extended headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitScan {
    /// True when the patch still needs body application (it contains `--- `
    /// file headers or binary sections) rather than being pure metadata.
    pub requires_body: bool,
    /// One record per `diff --git` section, in patch order.
    pub files: Vec<FileMetadata>,
}

fn parse_mode(token: &str) -> Option<FileMode> {
    let tok = token.rsplit(' ').next().unwrap_or(token);
    u32::from_str_radix(tok, 8).ok().map(FileMode::from_octal)
}

/// Scan a whole patch for git extended headers.
///
/// This is a forward pass over the full text, independent of hunk parsing.
/// It runs once, at the first `diff --git` line, so that rename and copy
/// metadata is known before any hunk is applied.
///
/// ```
/// use fuzzpatch::{scan_git_metadata, FileOp};
///
/// let patch = "diff --git a/old.txt b/new.txt\n\
///              rename from old.txt\n\
///              rename to new.txt\n";
/// let scan = scan_git_metadata(patch);
/// assert!(!scan.requires_body);
/// assert_eq!(scan.files[0].op, FileOp::Rename);
/// assert_eq!(scan.files[0].old_path.as_deref(), Some("old.txt"));
/// assert_eq!(scan.files[0].path, "new.txt");
/// assert_eq!(scan.files[0].source_line, 1);
/// ```
pub fn scan_git_metadata(patch: &str) -> GitScan {
    let mut files = Vec::new();
    let mut current: Option<FileMetadata> = None;
    let mut requires_body = false;

    for (idx, raw) in patch.lines().enumerate() {
        let line = raw.trim_end_matches([' ', '\r']);
        if let Some(caps) = GIT_DIFF_RE.captures(line) {
            if let Some(meta) = current.take() {
                files.push(meta);
            }
            current = Some(FileMetadata::new(caps[2].to_string(), idx + 1));
        } else if line.starts_with("--- ") {
            // A file header ends the extended-header region of the current
            // section and means real hunks follow.
            if let Some(meta) = current.take() {
                requires_body = true;
                files.push(meta);
            }
        } else if let Some(meta) = current.as_mut() {
            if let Some(src) = line.strip_prefix("rename from ") {
                meta.op = FileOp::Rename;
                meta.old_path = Some(src.to_string());
            } else if let Some(dst) = line.strip_prefix("rename to ") {
                meta.path = dst.to_string();
            } else if let Some(src) = line.strip_prefix("copy from ") {
                meta.op = FileOp::Copy;
                meta.old_path = Some(src.to_string());
            } else if let Some(dst) = line.strip_prefix("copy to ") {
                meta.path = dst.to_string();
            } else if let Some(rest) = line.strip_prefix("deleted file mode ") {
                meta.op = FileOp::Delete;
                meta.mode = parse_mode(rest);
            } else if let Some(rest) = line.strip_prefix("new file mode ") {
                meta.op = FileOp::Add;
                meta.mode = parse_mode(rest);
            } else if let Some(rest) = line.strip_prefix("new mode ") {
                meta.mode = parse_mode(rest);
            } else if line.starts_with("GIT binary patch") {
                meta.is_binary = true;
                requires_body = true;
            }
        }
    }
    if let Some(meta) = current.take() {
        files.push(meta);
    }
    if files.is_empty() {
        requires_body = true;
    }
    GitScan {
        requires_body,
        files,
    }
}

// --- Line Reader ---

/// Line iterator over the patch text with pushback.
///
/// Format detection needs short lookahead (a `--- ` line is only a file
/// header if `+++ ` follows), so consumed lines can be pushed back. Pushback
/// is a stack: the last line pushed is the next line read.
struct LineReader<'a> {
    lines: std::str::Lines<'a>,
    pushback: Vec<&'a str>,
    lineno: usize,
}

impl<'a> LineReader<'a> {
    fn new(text: &'a str) -> Self {
        LineReader {
            lines: text.lines(),
            pushback: Vec::new(),
            lineno: 0,
        }
    }

    fn next_line(&mut self) -> Option<&'a str> {
        let line = self.pushback.pop().or_else(|| self.lines.next());
        if line.is_some() {
            self.lineno += 1;
        }
        line
    }

    fn push(&mut self, line: &'a str) {
        self.pushback.push(line);
        self.lineno = self.lineno.saturating_sub(1);
    }

    fn peek(&mut self) -> Option<&'a str> {
        if self.pushback.is_empty() {
            if let Some(line) = self.lines.next() {
                self.pushback.push(line);
            }
        }
        self.pushback.last().copied()
    }
}

// --- Hunk Model ---

/// One parsed hunk, normalized to the unified representation.
///
/// Context-format hunks are reconciled into the same shape during parsing,
/// so application never needs to know which format a hunk came from. Lines
/// are stored without terminators; the old side keeps its control column
/// (`' '` or `'-'`), the new side is plain content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based position of the hunk within the patch.
    pub number: usize,
    /// Normalized `@@ -a,b +c,d @@` header text.
    pub header: String,
    raw: Vec<String>,
    old: Vec<String>,
    new: Vec<String>,
    /// 1-based start line in the pre-image (0 for creation hunks).
    pub start_old: usize,
    pub len_old: usize,
    /// 1-based start line in the post-image (0 for removal hunks).
    pub start_new: usize,
    pub len_new: usize,
    create: bool,
    remove: bool,
    /// The pre-image ends the file without a trailing newline.
    pub old_no_newline: bool,
    /// The post-image ends the file without a trailing newline.
    pub new_no_newline: bool,
}

impl Hunk {
    fn empty(number: usize, create: bool, remove: bool) -> Self {
        Hunk {
            number,
            header: String::new(),
            raw: Vec::new(),
            old: Vec::new(),
            new: Vec::new(),
            start_old: 0,
            len_old: 0,
            start_new: 0,
            len_new: 0,
            create,
            remove,
            old_no_newline: false,
            new_no_newline: false,
        }
    }

    fn parse_unified(
        desc: &str,
        number: usize,
        reader: &mut LineReader<'_>,
        create: bool,
        remove: bool,
    ) -> Result<Hunk, PatchError> {
        let caps = UNIFIED_HUNK_RE
            .captures(desc)
            .ok_or_else(|| PatchError::MalformedHeader {
                line: reader.lineno,
                text: desc.to_string(),
            })?;
        let mut hunk = Hunk::empty(number, create, remove);
        hunk.start_old = caps[1].parse().unwrap_or(0);
        hunk.len_old = caps.get(2).map_or(1, |m| m.as_str().parse().unwrap_or(1));
        hunk.start_new = caps[3].parse().unwrap_or(0);
        hunk.len_new = caps.get(4).map_or(1, |m| m.as_str().parse().unwrap_or(1));
        hunk.header = format!(
            "@@ -{},{} +{},{} @@",
            hunk.start_old, hunk.len_old, hunk.start_new, hunk.len_new
        );

        loop {
            let todo_old = hunk.len_old.saturating_sub(hunk.old.len());
            let todo_new = hunk.len_new.saturating_sub(hunk.new.len());
            let num = todo_old.max(todo_new);
            if num == 0 {
                break;
            }
            for _ in 0..num {
                let Some(line) = reader.next_line() else {
                    // Truncated input; empty sentinels are trimmed below.
                    hunk.raw.push(String::new());
                    hunk.old.push(String::new());
                    hunk.new.push(String::new());
                    continue;
                };
                if line.starts_with('\\') {
                    hunk.fix_newline();
                    continue;
                }
                // Some tools drop the control column on empty lines; treat
                // those as empty context.
                let line = if line.is_empty() { " " } else { line };
                hunk.raw.push(line.to_string());
                if let Some(added) = line.strip_prefix('+') {
                    hunk.new.push(added.to_string());
                } else if line.starts_with('-') {
                    hunk.old.push(line.to_string());
                } else {
                    hunk.new.push(line.get(1..).unwrap_or("").to_string());
                    hunk.old.push(line.to_string());
                }
            }
        }

        while hunk.raw.last().is_some_and(|l| l.is_empty()) {
            hunk.raw.pop();
            hunk.old.pop();
            hunk.new.pop();
            hunk.len_old = hunk.len_old.saturating_sub(1);
            hunk.len_new = hunk.len_new.saturating_sub(1);
        }
        hunk.read_trailing_newline_marker(reader);
        Ok(hunk)
    }

    fn parse_context(
        number: usize,
        reader: &mut LineReader<'_>,
        create: bool,
        remove: bool,
    ) -> Result<Hunk, PatchError> {
        let desc = reader.next_line().unwrap_or("");
        let caps = CONTEXT_OLD_RE
            .captures(desc)
            .ok_or_else(|| PatchError::MalformedHeader {
                line: reader.lineno,
                text: desc.to_string(),
            })?;
        let mut hunk = Hunk::empty(number, create, remove);
        hunk.start_old = caps[1].parse().unwrap_or(0);
        let end_old: usize = caps
            .get(2)
            .map_or(hunk.start_old, |m| {
                m.as_str().parse().unwrap_or(hunk.start_old)
            });
        hunk.len_old = end_old.saturating_sub(hunk.start_old);
        if hunk.start_old > 0 {
            hunk.len_old += 1;
        }

        for i in 0..hunk.len_old {
            let Some(line) = reader.next_line() else { break };
            if line.starts_with("---") {
                // Pure addition: the old block is empty and this is already
                // the new-side header.
                reader.push(line);
                break;
            }
            let body = line.get(2..).unwrap_or("");
            let tagged = if line.starts_with("- ") || line.starts_with("! ") {
                format!("-{body}")
            } else if line.starts_with("  ") {
                format!(" {body}")
            } else {
                return Err(PatchError::MalformedHunk {
                    number,
                    detail: format!("bad old text line {}", i + 1),
                });
            };
            hunk.old.push(tagged.clone());
            hunk.raw.push(tagged);
        }

        let mut line = reader.next_line().unwrap_or("");
        if line.starts_with('\\') {
            hunk.old_no_newline = true;
            line = reader.next_line().unwrap_or("");
        }
        let caps = CONTEXT_NEW_RE
            .captures(line)
            .ok_or_else(|| PatchError::MalformedHeader {
                line: reader.lineno,
                text: line.to_string(),
            })?;
        hunk.start_new = caps[1].parse().unwrap_or(0);
        let end_new: usize = caps
            .get(2)
            .map_or(hunk.start_new, |m| {
                m.as_str().parse().unwrap_or(hunk.start_new)
            });
        hunk.len_new = end_new.saturating_sub(hunk.start_new);
        if hunk.start_new > 0 {
            hunk.len_new += 1;
        }

        // Walk the new block, reconciling it against the raw lines collected
        // from the old block so that `raw` ends up in unified order.
        let mut cursor = 0usize;
        for i in 0..hunk.len_new {
            let Some(line) = reader.next_line() else { break };
            if line.starts_with('\\') {
                hunk.new_no_newline = true;
                continue;
            }
            let body = line.get(2..).unwrap_or("");
            let (tagged, untagged) = if line.starts_with("+ ") || line.starts_with("! ") {
                (format!("+{body}"), body.to_string())
            } else if line.starts_with("  ") {
                (format!(" {body}"), body.to_string())
            } else if hunk.new.is_empty() {
                // Pure deletion: there is no new block at all.
                reader.push(line);
                break;
            } else {
                return Err(PatchError::MalformedHunk {
                    number,
                    detail: format!("bad new text line {}", i + 1),
                });
            };
            hunk.new.push(untagged);
            loop {
                let have = hunk.raw.get(cursor).cloned().unwrap_or_default();
                cursor += 1;
                if have == tagged {
                    break;
                }
                if have.starts_with('-') {
                    continue;
                }
                hunk.raw.insert(cursor - 1, tagged);
                break;
            }
        }

        if hunk.old.is_empty() {
            for line in &hunk.raw {
                if line.starts_with('-') || line.starts_with(' ') {
                    hunk.old.push(line.clone());
                }
            }
        }
        if hunk.new.is_empty() {
            let synthesized: Vec<String> = hunk
                .raw
                .iter()
                .filter(|l| l.starts_with('+') || l.starts_with(' '))
                .map(|l| l.get(1..).unwrap_or("").to_string())
                .collect();
            hunk.new = synthesized;
        }
        hunk.header = format!(
            "@@ -{},{} +{},{} @@",
            hunk.start_old, hunk.len_old, hunk.start_new, hunk.len_new
        );
        hunk.read_trailing_newline_marker(reader);
        Ok(hunk)
    }

    /// Consume a `\ No newline at end of file` marker directly after the
    /// hunk body, if present.
    fn read_trailing_newline_marker(&mut self, reader: &mut LineReader<'_>) {
        if reader.peek().is_some_and(|l| l.starts_with('\\')) {
            reader.next_line();
            self.fix_newline();
        }
    }

    fn fix_newline(&mut self) {
        match self.raw.last().and_then(|l| l.chars().next()) {
            Some('+') => self.new_no_newline = true,
            Some('-') => self.old_no_newline = true,
            Some(_) => {
                self.old_no_newline = true;
                self.new_no_newline = true;
            }
            None => {}
        }
    }

    fn complete(&self) -> bool {
        self.old.len() == self.len_old && self.new.len() == self.len_new
    }

    /// True when the hunk creates the file from nothing.
    pub fn creates_file(&self) -> bool {
        self.create && self.start_old == 0 && self.len_old == 0
    }

    /// True when the hunk removes the whole file.
    pub fn removes_file(&self) -> bool {
        self.remove && self.start_new == 0 && self.len_new == 0
    }

    /// How many context lines to shave from the top and bottom of the hunk
    /// for a given fuzz level. Only context runs are eligible; a short run
    /// shifts the allowance to the other end instead of eating change lines.
    fn fuzz_bounds(&self, len: usize, fuzz: usize, top_only: bool) -> (usize, usize) {
        let fuzz = fuzz.min(len.saturating_sub(1));
        if fuzz == 0 {
            return (0, 0);
        }
        let mut top = 0;
        for line in &self.raw {
            if line.starts_with(' ') {
                top += 1;
            } else {
                break;
            }
        }
        let mut bot = 0;
        if !top_only {
            for line in self.raw.iter().rev() {
                if line.starts_with(' ') {
                    bot += 1;
                } else {
                    break;
                }
            }
        }
        let context = top.max(bot).max(3);
        let bot = if bot < context {
            fuzz.saturating_sub(context - bot)
        } else {
            fuzz.min(bot)
        };
        let top = if top < context {
            fuzz.saturating_sub(context - top)
        } else {
            fuzz.min(top)
        };
        (top, bot)
    }

    fn old_window(&self, fuzz: usize, top_only: bool) -> &[String] {
        let (top, bot) = self.fuzz_bounds(self.old.len(), fuzz, top_only);
        let end = self.old.len().saturating_sub(bot).max(top);
        &self.old[top..end]
    }

    fn new_window(&self, fuzz: usize, top_only: bool) -> &[String] {
        let (top, bot) = self.fuzz_bounds(self.new.len(), fuzz, top_only);
        let end = self.new.len().saturating_sub(bot).max(top);
        &self.new[top..end]
    }

    /// Whether the hunk's last body line is a change line, which means the
    /// hunk touches the end of the file.
    fn ends_in_change(&self) -> bool {
        self.raw.last().is_some_and(|l| !l.starts_with(' '))
    }
}

// --- Application Outcomes ---

/// How a single hunk landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkOutcome {
    /// Applied exactly where the header (plus the running delta) said.
    Clean { at: usize },
    /// Applied through the candidate search; `offset` is the distance from
    /// the expected position and `fuzz` the number of context lines ignored.
    Fuzzy { at: usize, fuzz: usize, offset: i64 },
    /// Could not be placed; recorded as a reject.
    Rejected,
}

/// Aggregate result of an application, worst hunk wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchStatus {
    #[default]
    Clean,
    /// At least one hunk needed fuzz to apply.
    Fuzzy,
    /// At least one hunk was rejected.
    Rejected,
}

impl PatchStatus {
    /// Conventional numeric code: 0 clean, 1 fuzzy, -1 rejected.
    ///
    /// ```
    /// use fuzzpatch::PatchStatus;
    /// assert_eq!(PatchStatus::Clean.code(), 0);
    /// assert_eq!(PatchStatus::Fuzzy.code(), 1);
    /// assert_eq!(PatchStatus::Rejected.code(), -1);
    /// ```
    pub fn code(self) -> i32 {
        match self {
            PatchStatus::Clean => 0,
            PatchStatus::Fuzzy => 1,
            PatchStatus::Rejected => -1,
        }
    }
}

/// A hunk that failed to apply, with enough context to render a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedHunk {
    /// Target file the hunk belonged to.
    pub file: String,
    /// Normalized `@@` header of the failed hunk.
    pub header: String,
    /// 1-based hunk number within the patch.
    pub number: usize,
}

/// Everything [`apply_patch`] produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchOutcome {
    /// The patched content, reassembled with the configured line ending.
    pub new_content: String,
    /// Aggregate status across all hunks.
    pub status: PatchStatus,
    /// Per-hunk outcomes in patch order.
    pub hunks: Vec<HunkOutcome>,
    /// Hunks that could not be placed.
    pub rejects: Vec<RejectedHunk>,
    /// Git extended-header metadata, when the patch carried any.
    pub metadata: Vec<FileMetadata>,
    /// True when a removal hunk deleted the whole file.
    pub file_removed: bool,
}

// --- Line Buffer ---

/// The mutable target of an application: the file split into lines, plus the
/// bookkeeping that lets later hunks account for what earlier hunks did.
///
/// `offset` is the cumulative line-count delta of applied hunks; `skew` is
/// the displacement discovered by the last successful candidate search and
/// biases where the next search starts. The content index is built lazily on
/// the first search and invalidated by every splice.
#[derive(Debug)]
pub struct LineBuffer {
    lines: Vec<String>,
    trailing_newline: bool,
    offset: i64,
    skew: i64,
    index: Option<HashMap<String, Vec<usize>>>,
    dirty: bool,
    removed: bool,
    rejects: Vec<Hunk>,
}

impl LineBuffer {
    /// Split `content` into terminator-less lines.
    pub fn new(content: &str) -> Self {
        LineBuffer {
            lines: content.lines().map(str::to_string).collect(),
            trailing_newline: content.ends_with('\n'),
            offset: 0,
            skew: 0,
            index: None,
            dirty: false,
            removed: false,
            rejects: Vec::new(),
        }
    }

    /// True once any hunk has modified the buffer.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn matches_at(&self, old: &[String], start: i64) -> bool {
        if start < 0 {
            return false;
        }
        let start = start as usize;
        let Some(end) = start.checked_add(old.len()) else {
            return false;
        };
        if end > self.lines.len() {
            return false;
        }
        old.iter()
            .zip(&self.lines[start..end])
            .all(|(tagged, have)| tagged.get(1..).unwrap_or("") == have)
    }

    fn build_index(&mut self) {
        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, line) in self.lines.iter().enumerate() {
            index.entry(line.clone()).or_default().push(i);
        }
        trace!("indexed {} lines", self.lines.len());
        self.index = Some(index);
    }

    /// Candidate positions for `line`, nearest to `anchor` first.
    fn candidates(&self, line: &str, anchor: i64) -> Vec<usize> {
        let mut cands = self
            .index
            .as_ref()
            .and_then(|ix| ix.get(line))
            .cloned()
            .unwrap_or_default();
        if cands.len() > 1 {
            cands.sort_by_key(|&pos| (pos as i64 - anchor).abs());
        }
        cands
    }

    fn splice(&mut self, start: usize, len: usize, new: &[String], strip_newline: bool) {
        let end = (start + len).min(self.lines.len());
        self.lines.splice(start..end, new.iter().cloned());
        if start + new.len() == self.lines.len() {
            self.trailing_newline = !strip_newline;
        }
        self.dirty = true;
        self.index = None;
    }

    /// Apply one hunk to the buffer.
    ///
    /// Tries the exact position first (skipped while `skew` is nonzero, so
    /// displaced files keep reporting their offset), then searches candidate
    /// positions at increasing fuzz. A hunk that cannot be placed is stored
    /// as a reject and reported as [`HunkOutcome::Rejected`], not an error.
    pub fn apply(&mut self, hunk: &Hunk) -> Result<HunkOutcome, PatchError> {
        if !hunk.complete() {
            return Err(PatchError::IncompleteHunk {
                number: hunk.number,
                header: hunk.header.clone(),
                expected_old: hunk.len_old,
                found_old: hunk.old.len(),
                expected_new: hunk.len_new,
                found_new: hunk.new.len(),
            });
        }
        if hunk.creates_file() && !self.lines.is_empty() {
            return Err(PatchError::UnsupportedCreate {
                number: hunk.number,
            });
        }

        let expected = if hunk.start_old == 0 {
            0
        } else {
            hunk.start_old as i64 + self.offset - 1
        };

        if self.skew == 0 && self.matches_at(&hunk.old, expected) {
            if hunk.removes_file() {
                self.lines.clear();
                self.trailing_newline = false;
                self.dirty = true;
                self.index = None;
                self.removed = true;
                info!("hunk #{} removed the file", hunk.number);
                return Ok(HunkOutcome::Clean { at: 1 });
            }
            let start = expected.max(0) as usize;
            self.splice(start, hunk.old.len(), &hunk.new, hunk.new_no_newline);
            self.offset += hunk.new.len() as i64 - hunk.old.len() as i64;
            debug!("hunk #{} applied cleanly at line {}", hunk.number, start + 1);
            return Ok(HunkOutcome::Clean { at: start + 1 });
        }

        if self.index.is_none() {
            self.build_index();
        }
        // A hunk ending in a change line belongs at the end of the file, so
        // bias the search there instead of at the stated position.
        let anchor = if hunk.ends_in_change() {
            self.lines.len() as i64
        } else {
            expected + self.skew
        };

        for fuzz in 0..3 {
            for top_only in [true, false] {
                let old = hunk.old_window(fuzz, top_only);
                let Some(first) = old.first() else { continue };
                let key = first.get(1..).unwrap_or("");
                for cand in self.candidates(key, anchor) {
                    if !self.matches_at(old, cand as i64) {
                        continue;
                    }
                    let new = hunk.new_window(fuzz, top_only).to_vec();
                    let removed = old.len();
                    self.splice(cand, removed, &new, hunk.new_no_newline);
                    self.offset += new.len() as i64 - removed as i64;
                    self.skew = cand as i64 - expected;
                    let line_offset = cand as i64 - expected - fuzz as i64;
                    if fuzz > 0 {
                        warn!(
                            "hunk #{} succeeded at {} with fuzz {} (offset {} lines)",
                            hunk.number,
                            cand + 1,
                            fuzz,
                            line_offset
                        );
                    } else {
                        info!(
                            "hunk #{} succeeded at {} (offset {} lines)",
                            hunk.number,
                            cand + 1,
                            line_offset
                        );
                    }
                    return Ok(HunkOutcome::Fuzzy {
                        at: cand + 1,
                        fuzz,
                        offset: line_offset,
                    });
                }
            }
        }

        warn!("hunk #{} FAILED to apply", hunk.number);
        self.rejects.push(hunk.clone());
        Ok(HunkOutcome::Rejected)
    }

    /// Reassemble the buffer into a string with the given line ending.
    pub fn into_content(self, eol: LineEnding) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let sep = eol.as_str();
        let mut out = self.lines.join(sep);
        if self.trailing_newline {
            out.push_str(sep);
        }
        out
    }
}

// --- Event Stream ---

/// One event from the patch scanner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchEvent {
    /// All git extended-header metadata, emitted once before anything else
    /// when the patch is a git diff.
    GitMetadata(Vec<FileMetadata>),
    /// A new target file, emitted lazily just before its first hunk.
    FileSelected { old_path: String, new_path: String },
    /// A fully parsed hunk for the current file.
    HunkReady(Hunk),
}

/// Lazy, single-pass scanner over a patch.
///
/// Yields [`PatchEvent`]s in stream order. Malformed headers and truncated
/// hunks are fatal; lines that belong to no recognized construct (mail
/// headers, commit messages, index lines) are skipped.
pub struct PatchEvents<'a> {
    patch: &'a str,
    reader: LineReader<'a>,
    queue: VecDeque<PatchEvent>,
    changed: HashMap<String, FileMetadata>,
    old_path: String,
    new_path: String,
    in_file: bool,
    /// None until the first hunk decides; then Some(true) for context
    /// format, Some(false) for unified.
    context: Option<bool>,
    hunk_number: usize,
    emit_file: bool,
    git_seen: bool,
    requires_body: bool,
    git_work_done: bool,
    finished: bool,
}

fn parse_filename(line: &str) -> String {
    // `--- path<TAB>timestamp` or `--- path timestamp`
    let s = line.get(4..).unwrap_or("").trim_end_matches('\r');
    let cut = s.find('\t').or_else(|| s.find(' ')).unwrap_or(s.len());
    s[..cut].to_string()
}

fn strip_git_prefix(path: &str) -> &str {
    path.strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path)
}

impl<'a> PatchEvents<'a> {
    /// Start scanning `patch`.
    pub fn new(patch: &'a str) -> Self {
        PatchEvents {
            patch,
            reader: LineReader::new(patch),
            queue: VecDeque::new(),
            changed: HashMap::new(),
            old_path: String::new(),
            new_path: String::new(),
            in_file: false,
            context: None,
            hunk_number: 0,
            emit_file: false,
            git_seen: false,
            requires_body: true,
            git_work_done: false,
            finished: false,
        }
    }

    fn start_file(&mut self) {
        self.in_file = true;
        self.emit_file = true;
        // Hunk numbering is per file.
        self.hunk_number = 0;
    }

    fn advance(&mut self) -> Result<(), PatchError> {
        while self.queue.is_empty() && !self.finished {
            match self.reader.next_line() {
                Some(line) => self.handle_line(line)?,
                None => {
                    self.finished = true;
                    if self.hunk_number == 0 && self.requires_body && !self.git_work_done {
                        return Err(PatchError::NoHunksFound);
                    }
                }
            }
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &'a str) -> Result<(), PatchError> {
        // Hunk start inside a selected file. The format is locked in by the
        // first hunk seen.
        if self.in_file
            && ((self.context != Some(true) && line.starts_with('@'))
                || (self.context != Some(false) && line.starts_with("***************")))
        {
            if self.context.is_none() && line.starts_with("***************") {
                self.context = Some(true);
            }
            let meta = self.changed.get(strip_git_prefix(&self.new_path));
            let create =
                self.old_path == "/dev/null" || meta.is_some_and(|m| m.op == FileOp::Add);
            let remove =
                self.new_path == "/dev/null" || meta.is_some_and(|m| m.op == FileOp::Delete);
            self.hunk_number += 1;
            let hunk = if self.context == Some(true) {
                if remove {
                    return Err(PatchError::UnsupportedContextRemoval);
                }
                Hunk::parse_context(self.hunk_number, &mut self.reader, create, remove)?
            } else {
                Hunk::parse_unified(line, self.hunk_number, &mut self.reader, create, remove)?
            };
            self.git_work_done = false;
            if self.emit_file {
                self.emit_file = false;
                self.queue.push_back(PatchEvent::FileSelected {
                    old_path: self.old_path.clone(),
                    new_path: self.new_path.clone(),
                });
            }
            self.queue.push_back(PatchEvent::HunkReady(hunk));
            return Ok(());
        }

        if self.in_file && line.starts_with("GIT binary patch") {
            return Err(PatchError::UnsupportedBinaryPatch {
                path: self.new_path.clone(),
            });
        }

        if let Some(caps) = GIT_DIFF_RE.captures(line) {
            let afile = caps[1].to_string();
            let bfile = caps[2].to_string();
            if !self.git_seen {
                self.git_seen = true;
                let scan = scan_git_metadata(self.patch);
                debug!(
                    "git patch: {} file record(s), requires body: {}",
                    scan.files.len(),
                    scan.requires_body
                );
                self.requires_body = scan.requires_body;
                for meta in &scan.files {
                    self.changed.insert(meta.path.clone(), meta.clone());
                }
                self.queue.push_back(PatchEvent::GitMetadata(scan.files));
            }
            // Copy, rename, delete and add all operate on the destination
            // path, so later hunks must not chase the source.
            let routed = self.changed.get(&bfile).is_some_and(|m| {
                matches!(
                    m.op,
                    FileOp::Copy | FileOp::Delete | FileOp::Rename | FileOp::Add
                )
            });
            if routed {
                self.old_path = bfile.clone();
                self.git_work_done = true;
            } else {
                self.old_path = afile;
            }
            self.new_path = bfile;
            self.start_file();
            return Ok(());
        }

        if line.starts_with("--- ") {
            if let Some(next) = self.reader.next_line() {
                if next.starts_with("+++ ") {
                    self.old_path = parse_filename(line);
                    self.new_path = parse_filename(next);
                    self.context = Some(false);
                    self.start_file();
                    return Ok(());
                }
                self.reader.push(next);
            }
            return Ok(());
        }

        if line.starts_with("*** ") {
            let Some(l2) = self.reader.next_line() else {
                return Ok(());
            };
            if !l2.starts_with("--- ") {
                self.reader.push(l2);
                return Ok(());
            }
            if !self
                .reader
                .peek()
                .is_some_and(|l3| l3.starts_with("***************"))
            {
                self.reader.push(l2);
                return Ok(());
            }
            self.old_path = parse_filename(line);
            self.new_path = parse_filename(l2);
            self.context = Some(true);
            self.start_file();
            return Ok(());
        }

        trace!("skipping line: '{}'", line);
        Ok(())
    }
}

impl<'a> Iterator for PatchEvents<'a> {
    type Item = Result<PatchEvent, PatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(event) = self.queue.pop_front() {
            return Some(Ok(event));
        }
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(()) => self.queue.pop_front().map(Ok),
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

// --- Orchestrator ---

/// Apply a patch to `original` and return the patched content along with
/// per-hunk outcomes, rejects, and any git metadata.
///
/// The patch must target exactly one file; a second file selection is
/// [`PatchError::MultipleFilesUnsupported`]. Metadata-only git patches (pure
/// rename or mode change) are valid and leave the content untouched.
pub fn apply_patch(
    patch: &str,
    original: &str,
    options: &ApplyOptions,
) -> Result<PatchOutcome, PatchError> {
    let mut buffer: Option<LineBuffer> = None;
    let mut selected: Option<(String, String)> = None;
    let mut metadata: Vec<FileMetadata> = Vec::new();
    let mut hunks: Vec<HunkOutcome> = Vec::new();

    for event in PatchEvents::new(patch) {
        match event? {
            PatchEvent::GitMetadata(files) => metadata = files,
            PatchEvent::FileSelected { old_path, new_path } => {
                if let Some((_, first)) = &selected {
                    return Err(PatchError::MultipleFilesUnsupported {
                        first: first.clone(),
                        second: new_path,
                    });
                }
                debug!("patching '{}' (from '{}')", new_path, old_path);
                selected = Some((old_path, new_path));
                buffer = Some(LineBuffer::new(original));
            }
            PatchEvent::HunkReady(hunk) => {
                let Some(buf) = buffer.as_mut() else { continue };
                hunks.push(buf.apply(&hunk)?);
            }
        }
    }

    let mut status = PatchStatus::Clean;
    if hunks
        .iter()
        .any(|h| matches!(h, HunkOutcome::Fuzzy { fuzz, .. } if *fuzz > 0))
    {
        status = PatchStatus::Fuzzy;
    }

    let (new_content, rejects, file_removed) = match buffer {
        Some(buf) => {
            let file = selected
                .as_ref()
                .map(|(_, new_path)| new_path.clone())
                .unwrap_or_default();
            let rejects: Vec<RejectedHunk> = buf
                .rejects
                .iter()
                .map(|h| RejectedHunk {
                    file: file.clone(),
                    header: h.header.clone(),
                    number: h.number,
                })
                .collect();
            let removed = buf.removed;
            (buf.into_content(options.eol), rejects, removed)
        }
        None => (original.to_string(), Vec::new(), false),
    };
    if !rejects.is_empty() {
        status = PatchStatus::Rejected;
    }

    info!(
        "applied {} hunk(s), {} reject(s), status {:?}",
        hunks.len(),
        rejects.len(),
        status
    );
    Ok(PatchOutcome {
        new_content,
        status,
        hunks,
        rejects,
        metadata,
        file_removed,
    })
}
