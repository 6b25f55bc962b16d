//! Regex pre-extraction: distill a multi-megabyte log tree into short,
//! bounded snippets before the agent ever sees it.
//!
//! Files are streamed line by line so memory stays bounded; each pattern
//! gets a soft wall-clock deadline over the whole tree.

use crate::rules::PreExtractSpec;
use chrono::NaiveDate;
use regex::Regex;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Matches collected for one pre-extract pattern.
#[derive(Debug, Clone)]
pub struct ExtractSection {
    pub name: String,
    pub lines: Vec<String>,
    /// True when the per-pattern deadline cut the scan short.
    pub truncated_by_deadline: bool,
}

/// Everything the pre-extractor pulled for one task.
#[derive(Debug, Clone, Default)]
pub struct ExtractReport {
    pub sections: Vec<ExtractSection>,
    pub files_scanned: usize,
}

impl ExtractReport {
    /// Render the `name -> [lines]` block appended to the agent prompt.
    pub fn to_prompt_block(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&format!("{} -> [\n", section.name));
            for line in &section.lines {
                out.push_str("  ");
                out.push_str(line);
                out.push('\n');
            }
            out.push_str("]\n");
        }
        out
    }

    pub fn total_lines(&self) -> usize {
        self.sections.iter().map(|s| s.lines.len()).sum()
    }
}

pub struct Extractor {
    max_lines_per_pattern: usize,
    pattern_deadline: Duration,
}

impl Extractor {
    pub fn new(max_lines_per_pattern: usize, pattern_deadline: Duration) -> Self {
        Self {
            max_lines_per_pattern,
            pattern_deadline,
        }
    }

    /// Run every pattern of the primary rule over the materialized logs.
    ///
    /// Patterns compile once per task; a pattern that fails to compile here
    /// (validated at catalog load, but the snapshot may predate an edit) is
    /// skipped with a warning rather than failing the task.
    pub fn extract(
        &self,
        specs: &[PreExtractSpec],
        logs_dir: &Path,
        event_date: Option<NaiveDate>,
    ) -> ExtractReport {
        let mut report = ExtractReport::default();
        if specs.is_empty() {
            return report;
        }

        let files = collect_log_files(logs_dir);
        report.files_scanned = files.len();

        let compiled: Vec<(usize, Regex)> = specs
            .iter()
            .enumerate()
            .filter_map(|(i, spec)| match Regex::new(&spec.pattern) {
                Ok(re) => Some((i, re)),
                Err(e) => {
                    warn!(pattern = %spec.pattern, error = %e, "Skipping uncompilable pre-extract pattern");
                    None
                }
            })
            .collect();

        for (index, regex) in compiled {
            let spec = &specs[index];
            let started = Instant::now();
            let mut lines = Vec::new();
            let mut truncated = false;

            'files: for file in &files {
                if started.elapsed() > self.pattern_deadline {
                    truncated = true;
                    break;
                }
                let Ok(handle) = std::fs::File::open(file) else {
                    continue;
                };
                let reader = BufReader::new(handle);
                for raw in reader.split(b'\n') {
                    let Ok(raw) = raw else { break };
                    if lines.len() >= self.max_lines_per_pattern {
                        break 'files;
                    }
                    if started.elapsed() > self.pattern_deadline {
                        truncated = true;
                        break 'files;
                    }
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end_matches('\r');
                    if !regex.is_match(line) {
                        continue;
                    }
                    if spec.date_filter {
                        if let Some(hint) = event_date {
                            match leading_date(line) {
                                Some(date) if within_one_day(date, hint) => {}
                                Some(_) => continue,
                                // Undated lines are kept; dropping them would
                                // hide wrapped continuation lines.
                                None => {}
                            }
                        }
                    }
                    lines.push(line.to_string());
                }
            }

            debug!(
                pattern = %spec.name,
                matches = lines.len(),
                truncated,
                "Pre-extract pattern done"
            );
            report.sections.push(ExtractSection {
                name: spec.name.clone(),
                lines,
                truncated_by_deadline: truncated,
            });
        }

        report
    }
}

/// All regular files under the logs tree, sorted for deterministic output.
fn collect_log_files(logs_dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = walkdir::WalkDir::new(logs_dir)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .flatten()
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// Parse a leading ISO-like `YYYY-MM-DD` (or `YYYY/MM/DD`) timestamp.
fn leading_date(line: &str) -> Option<NaiveDate> {
    let trimmed = line.trim_start();
    let head: String = trimmed.chars().take(10).collect();
    if head.len() < 10 {
        return None;
    }
    let bytes = head.as_bytes();
    let sep = bytes[4];
    if (sep != b'-' && sep != b'/') || bytes[7] != sep {
        return None;
    }
    let year: i32 = head[0..4].parse().ok()?;
    let month: u32 = head[5..7].parse().ok()?;
    let day: u32 = head[8..10].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

fn within_one_day(date: NaiveDate, hint: NaiveDate) -> bool {
    (date - hint).num_days().abs() <= 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, pattern: &str, date_filter: bool) -> PreExtractSpec {
        PreExtractSpec {
            name: name.to_string(),
            pattern: pattern.to_string(),
            date_filter,
        }
    }

    fn write_log(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn extractor() -> Extractor {
        Extractor::new(200, Duration::from_secs(30))
    }

    #[test]
    fn test_basic_matching_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "a.log",
            "boot ok\nerror: flash write failed\ninfo idle\nerror: flash verify failed\n",
        );
        let report = extractor().extract(&[spec("flash", "error: flash", false)], dir.path(), None);
        assert_eq!(report.sections.len(), 1);
        assert_eq!(
            report.sections[0].lines,
            vec![
                "error: flash write failed".to_string(),
                "error: flash verify failed".to_string()
            ]
        );
    }

    #[test]
    fn test_line_cap_per_pattern() {
        let dir = tempfile::tempdir().unwrap();
        let body: String = (0..50).map(|i| format!("match {}\n", i)).collect();
        write_log(dir.path(), "a.log", &body);
        let extractor = Extractor::new(10, Duration::from_secs(30));
        let report = extractor.extract(&[spec("m", "match", false)], dir.path(), None);
        assert_eq!(report.sections[0].lines.len(), 10);
        assert_eq!(report.sections[0].lines[0], "match 0");
    }

    #[test]
    fn test_scans_nested_files_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), "b/later.log", "hit from b\n");
        write_log(dir.path(), "a.log", "hit from a\n");
        let report = extractor().extract(&[spec("h", "hit", false)], dir.path(), None);
        assert_eq!(
            report.sections[0].lines,
            vec!["hit from a".to_string(), "hit from b".to_string()]
        );
        assert_eq!(report.files_scanned, 2);
    }

    #[test]
    fn test_date_filter_keeps_day_plus_minus_one() {
        let dir = tempfile::tempdir().unwrap();
        write_log(
            dir.path(),
            "dated.log",
            "2024-03-09 23:59 drift detected\n\
             2024-03-10 00:01 drift detected\n\
             2024-03-11 08:00 drift detected\n\
             2024-03-20 12:00 drift detected\n\
             continuation without date drift detected\n",
        );
        let hint = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let report =
            extractor().extract(&[spec("drift", "drift detected", true)], dir.path(), Some(hint));
        let lines = &report.sections[0].lines;
        assert_eq!(lines.len(), 4);
        assert!(lines.iter().all(|l| !l.contains("2024-03-20")));
        assert!(lines.iter().any(|l| l.starts_with("continuation")));
    }

    #[test]
    fn test_date_filter_without_hint_keeps_everything() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), "dated.log", "2020-01-01 old drift\n");
        let report = extractor().extract(&[spec("d", "drift", true)], dir.path(), None);
        assert_eq!(report.sections[0].lines.len(), 1);
    }

    #[test]
    fn test_uncompilable_pattern_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_log(dir.path(), "a.log", "anything\n");
        let report = extractor().extract(
            &[spec("bad", "([", false), spec("good", "any", false)],
            dir.path(),
            None,
        );
        assert_eq!(report.sections.len(), 1);
        assert_eq!(report.sections[0].name, "good");
    }

    #[test]
    fn test_non_utf8_lines_survive_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let mut bytes = b"prefix match ".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.push(b'\n');
        std::fs::write(dir.path().join("bin.log"), bytes).unwrap();
        let report = extractor().extract(&[spec("m", "prefix match", false)], dir.path(), None);
        assert_eq!(report.sections[0].lines.len(), 1);
    }

    #[test]
    fn test_prompt_block_format() {
        let report = ExtractReport {
            sections: vec![ExtractSection {
                name: "session".to_string(),
                lines: vec!["l1".to_string(), "l2".to_string()],
                truncated_by_deadline: false,
            }],
            files_scanned: 1,
        };
        let block = report.to_prompt_block();
        assert!(block.starts_with("session -> [\n"));
        assert!(block.contains("  l1\n"));
        assert!(block.ends_with("]\n"));
    }

    #[test]
    fn test_leading_date_variants() {
        assert_eq!(
            leading_date("2024-03-10 08:00 x"),
            NaiveDate::from_ymd_opt(2024, 3, 10)
        );
        assert_eq!(
            leading_date("2024/03/10 08:00 x"),
            NaiveDate::from_ymd_opt(2024, 3, 10)
        );
        assert_eq!(leading_date("Mar 10 08:00 x"), None);
        assert_eq!(leading_date("short"), None);
    }
}
