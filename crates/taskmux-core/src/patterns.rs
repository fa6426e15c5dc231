//! Heuristic activity patterns.
//!
//! An ordered table of (compiled matcher, category, priority) used to
//! classify a fragment of terminal output. Higher priority wins; ties are
//! broken by registration order, so the table is stable under extension.

use once_cell::sync::Lazy;
use regex::Regex;
use taskmux_types::ActivityCategory;

/// One entry in the pattern table.
#[derive(Debug)]
pub struct ActivityPattern {
    pub regex: Regex,
    pub category: ActivityCategory,
    /// Total order for tie-breaking between simultaneous matches.
    pub priority: u8,
    /// Human-readable status description for matches of this pattern.
    pub description: &'static str,
}

/// Comprehensive regex for ANSI escape sequences.
static ANSI_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\x1b\[[0-9;?]*[A-Za-z]",    // CSI sequences (colors, cursor, etc.)
        r"|\x1b\][^\x07]*\x07",        // OSC sequences ending with BEL
        r"|\x1b\][^\x1b]*\x1b\\",      // OSC sequences ending with ST
        r"|\x1b[()][A-Z0-9]",          // Character set selection
        r"|\x1b[=>MNOP78]",            // Other single-char escapes
        r"|\x1b",                      // Catch any remaining bare ESC
    ))
    .unwrap()
});

/// Strip ANSI escape codes from text before any matching.
pub fn strip_ansi(text: &str) -> String {
    ANSI_REGEX.replace_all(text, "").to_string()
}

/// Error markers. An error match always classifies under Idle and overrides
/// any simultaneously-present productive-looking tokens.
static ERROR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^.*\b(error|err!|exception|traceback|panicked at|fatal|ENOENT|EACCES|cannot find|command not found|permission denied)\b.*$")
        .unwrap()
});

/// Explicit idle/prompt markers.
static IDLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)(^[>$#]\s*$|waiting for (input|instructions)|ready for next|\bidle\b)")
        .unwrap()
});

/// Filename extraction, narrower to broader; first hit wins.
static FILENAME_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)(?:creating|writing|editing|modifying|updating|saving)\s+(?:file[:\s]\s*)?[`'\x22]?([\w./-]+\.\w{1,8})[`'\x22]?").unwrap(),
        Regex::new(r"(?i)(?:file|path):\s*[`'\x22]?([\w./-]+\.\w{1,8})[`'\x22]?").unwrap(),
        Regex::new(r"([\w./-]+\.(?:rs|ts|tsx|js|jsx|py|go|java|rb|c|h|cpp|md|toml|yaml|yml|json|sh))\b").unwrap(),
    ]
});

/// Command extraction, narrower to broader; first hit wins.
static COMMAND_REGEXES: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?im)(?:running|executing|invoking)[:\s]+[`'\x22]?([^\n`'\x22]+?)[`'\x22]?\s*$").unwrap(),
        Regex::new(r"(?m)^\s*[$#]\s+(\S[^\n]*)$").unwrap(),
        Regex::new(r"(?m)^\s*(?:npm|cargo|git|make|pytest|yarn|pnpm|go|docker)\s+[^\n]+").unwrap(),
    ]
});

/// Build the ordered activity pattern table.
///
/// Priority bands (high to low): error markers 100, file operations 80,
/// source-syntax tokens 60, command execution 50, thinking/planning 30,
/// idle/prompt markers 10.
fn build_patterns() -> Vec<ActivityPattern> {
    vec![
        ActivityPattern {
            regex: ERROR_REGEX.clone(),
            category: ActivityCategory::Idle,
            priority: 100,
            description: "Error detected",
        },
        ActivityPattern {
            regex: Regex::new(
                r"(?i)\b(creating|writing|editing|modifying|updating|saving)\b.{0,40}\b(file|module|config|test)\b",
            )
            .unwrap(),
            category: ActivityCategory::FileOperation,
            priority: 80,
            description: "Working on files",
        },
        ActivityPattern {
            regex: Regex::new(r"(?i)\b(creating|writing) file\b|file (created|written|saved)")
                .unwrap(),
            category: ActivityCategory::FileOperation,
            priority: 80,
            description: "Working on files",
        },
        ActivityPattern {
            regex: Regex::new(
                r"(?m)\b(fn|function|def|class|impl|struct|interface|const|let|var)\b\s+\w+|=>|\{\s*$|import\s+\w|#include",
            )
            .unwrap(),
            category: ActivityCategory::Coding,
            priority: 60,
            description: "Writing code",
        },
        ActivityPattern {
            regex: Regex::new(
                r"(?im)^\s*[$#]\s+\S|\b(running|executing|invoking)\b|npm (install|run|test)|cargo (build|test|run|check)|git (add|commit|push|pull|status)",
            )
            .unwrap(),
            category: ActivityCategory::CommandExecution,
            priority: 50,
            description: "Running a command",
        },
        ActivityPattern {
            regex: Regex::new(
                r"(?i)\b(thinking|analyzing|planning|considering|reviewing|reading|searching|looking (at|into)|let me|i'll)\b",
            )
            .unwrap(),
            category: ActivityCategory::Thinking,
            priority: 30,
            description: "Analyzing",
        },
        ActivityPattern {
            regex: IDLE_REGEX.clone(),
            category: ActivityCategory::Idle,
            priority: 10,
            description: "Waiting at prompt",
        },
    ]
}

/// Ordered table of activity patterns plus auxiliary extractors.
pub struct PatternLibrary {
    patterns: Vec<ActivityPattern>,
}

impl Default for PatternLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternLibrary {
    pub fn new() -> Self {
        Self {
            patterns: build_patterns(),
        }
    }

    /// Return the highest-priority pattern matching `text`. Ties are broken
    /// by registration order: the first-registered pattern wins, so iteration
    /// only replaces the candidate on a strictly greater priority.
    pub fn find_best_match(&self, text: &str) -> Option<&ActivityPattern> {
        let mut best: Option<&ActivityPattern> = None;
        for pattern in &self.patterns {
            if pattern.regex.is_match(text) {
                match best {
                    Some(b) if b.priority >= pattern.priority => {}
                    _ => best = Some(pattern),
                }
            }
        }
        best
    }

    /// Whether `text` contains an error marker. Error precedence is absolute:
    /// callers must check this before ordinary classification.
    pub fn has_error(&self, text: &str) -> bool {
        ERROR_REGEX.is_match(text)
    }

    /// The first error line, for use as a human-readable description.
    pub fn error_line(&self, text: &str) -> Option<String> {
        ERROR_REGEX
            .find(text)
            .map(|m| m.as_str().trim().to_string())
    }

    /// Whether `text` shows an explicit idle/prompt marker.
    pub fn has_idle_marker(&self, text: &str) -> bool {
        IDLE_REGEX.is_match(text)
    }

    /// Extract a filename, trying narrower patterns first.
    pub fn extract_file_name(&self, text: &str) -> Option<String> {
        for regex in FILENAME_REGEXES.iter() {
            if let Some(caps) = regex.captures(text) {
                let m = caps.get(1).or_else(|| caps.get(0))?;
                return Some(m.as_str().trim().to_string());
            }
        }
        None
    }

    /// Extract a shell command, trying narrower patterns first.
    pub fn extract_command(&self, text: &str) -> Option<String> {
        for regex in COMMAND_REGEXES.iter() {
            if let Some(caps) = regex.captures(text) {
                let m = caps.get(1).or_else(|| caps.get(0))?;
                let cmd = m.as_str().trim();
                if !cmd.is_empty() {
                    return Some(cmd.to_string());
                }
            }
        }
        None
    }
}
