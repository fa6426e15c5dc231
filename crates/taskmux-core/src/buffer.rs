//! Bounded per-session output buffering.
//!
//! Each monitored session gets one fixed-capacity circular buffer. Large
//! captures are compressed textually before storage so memory stays bounded
//! by capacity times the compressed-item ceiling no matter how long the
//! monitor runs.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// One stored capture snapshot.
#[derive(Debug, Clone)]
pub struct BufferEntry {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Whether the text was compressed before storage.
    pub compressed: bool,
}

/// Fixed-capacity circular buffer for one session's captured output.
#[derive(Debug)]
pub struct OutputBuffer {
    entries: VecDeque<BufferEntry>,
    capacity: usize,
    /// Entries longer than this many bytes are compressed before storage.
    compression_threshold: usize,
    /// Lines matching any of these survive aggressive compression.
    importance_keywords: Vec<String>,
    reads: u64,
    writes: u64,
}

impl OutputBuffer {
    pub fn new(
        capacity: usize,
        compression_threshold: usize,
        importance_keywords: Vec<String>,
    ) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            compression_threshold,
            importance_keywords,
            reads: 0,
            writes: 0,
        }
    }

    /// Store one capture, evicting the oldest entry when full.
    pub fn push(&mut self, text: &str) {
        let (text, compressed) = if text.len() > self.compression_threshold {
            (
                compress(text, self.compression_threshold, &self.importance_keywords),
                true,
            )
        } else {
            (text.to_string(), false)
        };

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(BufferEntry {
            text,
            timestamp: Utc::now(),
            compressed,
        });
        self.writes += 1;
    }

    /// Up to `n` most recent entries in chronological order. Non-mutating
    /// apart from the read counter feeding the efficiency ratio.
    pub fn recent(&mut self, n: usize) -> Vec<BufferEntry> {
        self.reads += 1;
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// The newest stored entry, if any.
    pub fn latest(&self) -> Option<&BufferEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of stored text lengths in bytes.
    pub fn memory_usage(&self) -> usize {
        self.entries.iter().map(|e| e.text.len()).sum()
    }

    /// reads / (reads + writes); 0.0 before any traffic.
    pub fn efficiency(&self) -> f64 {
        let total = self.reads + self.writes;
        if total == 0 {
            0.0
        } else {
            self.reads as f64 / total as f64
        }
    }
}

/// Compress captured text to fit under `threshold`.
///
/// Passes, in order: collapse blank-line runs, collapse intra-line whitespace,
/// drop exact consecutive duplicate lines. If the result is still over 80% of
/// the threshold, keep only lines matching an importance keyword; when that
/// leaves nothing useful, keep the most recent lines instead.
fn compress(text: &str, threshold: usize, keywords: &[String]) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut prev_blank = false;
    let mut prev_line: Option<&str> = None;
    for line in text.lines() {
        let blank = line.trim().is_empty();
        if blank && prev_blank {
            continue;
        }
        if !blank && prev_line == Some(line) {
            continue;
        }
        prev_blank = blank;
        prev_line = Some(line);
        lines.push(line);
    }

    let collapsed: Vec<String> = lines
        .iter()
        .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect();
    let mut result = collapsed.join("\n");

    if result.len() > threshold * 8 / 10 {
        let important: Vec<&String> = collapsed
            .iter()
            .filter(|l| {
                let lower = l.to_lowercase();
                keywords.iter().any(|k| lower.contains(k.as_str()))
            })
            .collect();

        if !important.is_empty() {
            result = important
                .iter()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("\n");
        } else {
            // Nothing important; keep the tail.
            let mut tail: Vec<&str> = Vec::new();
            let mut size = 0usize;
            for line in collapsed.iter().rev() {
                size += line.len() + 1;
                if size > threshold * 8 / 10 {
                    break;
                }
                tail.push(line);
            }
            tail.reverse();
            result = tail.join("\n");
        }
    }

    result
}

/// Truncate raw captured text before buffering: cap the number of lines and,
/// for pathological single-line output, cap total characters at a char
/// boundary.
pub fn truncate_capture(text: &str, max_lines: usize, char_budget: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    let truncated = if lines.len() > max_lines {
        lines[lines.len() - max_lines..].join("\n")
    } else {
        text.to_string()
    };

    if truncated.len() > char_budget {
        let start = truncated.len() - char_budget;
        let start = (start..truncated.len())
            .find(|&i| truncated.is_char_boundary(i))
            .unwrap_or(truncated.len());
        truncated[start..].to_string()
    } else {
        truncated
    }
}
