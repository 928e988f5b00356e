use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

use serde_json::Value;

use crate::error::{Result, StatuslineError};

pub const DEFAULT_USAGE_TAIL_LINES: usize = 100;
pub const DEFAULT_EXCERPT_TAIL_LINES: usize = 200;

const TAIL_CHUNK_BYTES: usize = 64 * 1024;

/// Lines longer than this keep their slot in the window but come back empty
/// and are never decoded.
const MAX_LINE_BYTES: usize = 1024 * 1024;

const USAGE_FIELDS: [&str; 3] = [
    "input_tokens",
    "cache_read_input_tokens",
    "cache_creation_input_tokens",
];

const COMMAND_MARKERS: [&str; 4] = [
    "<local-command-stdout>",
    "<command-name>",
    "<command-message>",
    "<command-args>",
];

/// Finds the context size of a conversation from its transcript.
///
/// Only the newest `window` non-empty lines are inspected, and the file is
/// read backwards from its end so cost does not grow with transcript length.
/// If every line in that window is side-chain traffic or carries no usage,
/// the estimate is 0 even when an older line would have had one.
#[derive(Debug, Clone, Copy)]
pub struct UsageTailScanner {
    window: usize,
}

impl Default for UsageTailScanner {
    fn default() -> Self {
        Self::new(DEFAULT_USAGE_TAIL_LINES)
    }
}

impl UsageTailScanner {
    pub fn new(window: usize) -> Self {
        Self { window }
    }

    /// Token count of the most recent primary-conversation record with a
    /// positive usage sum. A missing transcript is 0, not an error.
    pub fn estimate(&self, path: &Path) -> Result<u64> {
        if path.as_os_str().is_empty() {
            return Ok(0);
        }
        let lines = match read_tail_lines(path, self.window) {
            Ok(lines) => lines,
            Err(err) if err.is_not_found() => return Ok(0),
            Err(err) => return Err(err),
        };

        Ok(lines
            .iter()
            .rev()
            .filter_map(|line| parse_record(line))
            .map(|record| context_tokens(&record))
            .find(|&tokens| tokens > 0)
            .unwrap_or(0))
    }
}

/// Newest user-authored prompt of `session_id` within the last `window`
/// lines, skipping side-chain records and command or system chatter.
pub fn latest_user_message(path: &Path, session_id: &str, window: usize) -> Result<Option<String>> {
    if path.as_os_str().is_empty() {
        return Ok(None);
    }
    let lines = match read_tail_lines(path, window) {
        Ok(lines) => lines,
        Err(err) if err.is_not_found() => return Ok(None),
        Err(err) => return Err(err),
    };

    Ok(lines
        .iter()
        .rev()
        .filter_map(|line| parse_record(line))
        .find_map(|record| user_prompt(&record, session_id)))
}

fn parse_record(line: &str) -> Option<Value> {
    serde_json::from_str::<Value>(line)
        .ok()
        .filter(Value::is_object)
}

fn is_sidechain(record: &Value) -> bool {
    record.get("isSidechain").and_then(Value::as_bool) == Some(true)
}

fn context_tokens(record: &Value) -> u64 {
    if is_sidechain(record) {
        return 0;
    }
    let Some(usage) = record.pointer("/message/usage").filter(|u| u.is_object()) else {
        return 0;
    };
    let total: f64 = USAGE_FIELDS
        .iter()
        .filter_map(|field| usage.get(*field).and_then(Value::as_f64))
        .sum();
    if total > 0.0 { total as u64 } else { 0 }
}

fn user_prompt(record: &Value, session_id: &str) -> Option<String> {
    if is_sidechain(record) {
        return None;
    }
    if record.get("sessionId").and_then(Value::as_str) != Some(session_id) {
        return None;
    }
    if record.get("type").and_then(Value::as_str) != Some("user")
        || record.pointer("/message/role").and_then(Value::as_str) != Some("user")
    {
        return None;
    }
    let content = record.pointer("/message/content").and_then(Value::as_str)?;
    (!is_system_message(content)).then(|| content.to_string())
}

fn is_system_message(content: &str) -> bool {
    if (content.starts_with('[') && content.ends_with(']'))
        || (content.starts_with('{') && content.ends_with('}'))
    {
        return true;
    }
    if COMMAND_MARKERS.iter().any(|marker| content.contains(marker)) {
        return true;
    }
    content.starts_with("Caveat:")
}

/// Last `max_lines` non-empty lines of `path`, oldest first. Lines over
/// 1 MiB are returned as empty strings.
pub fn read_tail_lines(path: &Path, max_lines: usize) -> Result<Vec<String>> {
    read_tail_lines_chunked(path, max_lines, TAIL_CHUNK_BYTES)
}

fn read_tail_lines_chunked(path: &Path, max_lines: usize, chunk_size: usize) -> Result<Vec<String>> {
    if max_lines == 0 {
        return Ok(Vec::new());
    }
    let io_err = |err: std::io::Error| StatuslineError::io(path, err);

    let mut file = File::open(path).map_err(io_err)?;
    let metadata = file.metadata().map_err(io_err)?;
    if metadata.is_dir() {
        return Err(io_err(std::io::Error::new(
            ErrorKind::InvalidInput,
            "transcript path is a directory",
        )));
    }

    // Chunks are kept newest first; each byte is read and inspected once.
    let mut offset = metadata.len();
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut found = 0usize;
    let mut line_has_text = false;
    while offset > 0 && found < max_lines {
        let step = (chunk_size as u64).min(offset);
        offset -= step;
        file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk).map_err(io_err)?;

        for &byte in chunk.iter().rev() {
            if byte == b'\n' {
                found += usize::from(line_has_text);
                line_has_text = false;
            } else if !byte.is_ascii_whitespace() {
                line_has_text = true;
            }
        }
        chunks.push(chunk);
    }

    let mut tail = Vec::with_capacity(chunks.iter().map(Vec::len).sum());
    for chunk in chunks.iter().rev() {
        tail.extend_from_slice(chunk);
    }

    let mut lines: Vec<String> = complete_lines(&tail, offset == 0)
        .map(|segment| {
            if segment.len() > MAX_LINE_BYTES {
                String::new()
            } else {
                String::from_utf8_lossy(segment).trim().to_string()
            }
        })
        .collect();
    if lines.len() > max_lines {
        lines.drain(..lines.len() - max_lines);
    }
    Ok(lines)
}

/// Non-blank lines of `buf`. Unless `at_file_start`, the first segment may
/// be the cut-off end of a longer line and is dropped.
fn complete_lines(buf: &[u8], at_file_start: bool) -> impl Iterator<Item = &[u8]> {
    buf.split(|&byte| byte == b'\n')
        .skip(usize::from(!at_file_start))
        .filter(|segment| !segment.iter().all(u8::is_ascii_whitespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;
    use tempfile::TempDir;

    fn transcript(content: &str) -> (TempDir, std::path::PathBuf) {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("transcript.jsonl");
        std::fs::write(&path, content).expect("write transcript");
        (tmp, path)
    }

    fn usage_line(tokens: u64, sidechain: bool) -> String {
        format!(
            r#"{{"isSidechain":{sidechain},"type":"assistant","message":{{"role":"assistant","usage":{{"input_tokens":{tokens},"cache_read_input_tokens":0,"cache_creation_input_tokens":0}}}}}}"#
        )
    }

    #[test]
    fn newest_primary_usage_wins_over_sidechain_and_zero() {
        let content = [
            r#"{"isSidechain":false,"message":{"usage":{"input_tokens":200,"cache_read_input_tokens":800,"cache_creation_input_tokens":200}}}"#.to_string(),
            usage_line(0, false),
            usage_line(500, true),
        ]
        .join("\n");
        let (_tmp, path) = transcript(&content);

        let tokens = UsageTailScanner::default().estimate(&path).expect("estimate");
        assert_eq!(tokens, 1_200);
    }

    #[test]
    fn usage_fields_are_optional() {
        let (_tmp, path) = transcript(
            r#"{"message":{"usage":{"cache_read_input_tokens":4000}}}
{"message":{"content":"no usage here"}}"#,
        );
        let tokens = UsageTailScanner::default().estimate(&path).expect("estimate");
        assert_eq!(tokens, 4_000);
    }

    #[test]
    fn empty_or_sidechain_only_window_is_zero() {
        let (_tmp, empty) = transcript("");
        assert_eq!(UsageTailScanner::default().estimate(&empty).expect("empty"), 0);

        let (_tmp2, side) = transcript(&[usage_line(900, true), usage_line(50, true)].join("\n"));
        assert_eq!(UsageTailScanner::default().estimate(&side).expect("side"), 0);
    }

    #[test]
    fn missing_or_blank_path_is_zero() {
        let scanner = UsageTailScanner::default();
        assert_eq!(scanner.estimate(Path::new("")).expect("blank"), 0);
        assert_eq!(
            scanner
                .estimate(Path::new("/no/such/transcript.jsonl"))
                .expect("missing"),
            0
        );
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let content = format!(
            "{}\nnot json at all\n[1,2,3]\n\"string\"\n{{\"message\":{{\"usage\":\"bogus\"}}}}\n",
            usage_line(321, false)
        );
        let (_tmp, path) = transcript(&content);
        assert_eq!(UsageTailScanner::default().estimate(&path).expect("estimate"), 321);
    }

    #[test]
    fn usage_outside_window_is_not_seen() {
        let mut content = usage_line(7_000, false);
        for _ in 0..5 {
            content.push('\n');
            content.push_str(&usage_line(10, true));
        }
        let (_tmp, path) = transcript(&content);

        assert_eq!(UsageTailScanner::new(5).estimate(&path).expect("narrow"), 0);
        assert_eq!(UsageTailScanner::new(6).estimate(&path).expect("wide"), 7_000);
    }

    #[test]
    fn blank_lines_do_not_count_toward_window() {
        let content = format!("{}\n\n\n   \n{}\n", usage_line(42, false), usage_line(1, true));
        let (_tmp, path) = transcript(&content);
        assert_eq!(UsageTailScanner::new(2).estimate(&path).expect("estimate"), 42);
    }

    #[test]
    fn backward_read_matches_full_read_across_chunk_boundaries() {
        let mut content = String::new();
        for i in 0..250 {
            if i % 7 == 0 {
                content.push('\n');
            }
            let _ = writeln!(content, "{{\"n\":{i},\"pad\":\"{}\"}}", "x".repeat(i % 13));
        }
        content.push_str("{\"n\":\"unterminated\"}");
        let (_tmp, path) = transcript(&content);

        let expected: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();
        for (window, chunk) in [(1, 3), (10, 7), (100, 16), (100, 4096), (500, 33)] {
            let got = read_tail_lines_chunked(&path, window, chunk).expect("tail");
            let want = &expected[expected.len().saturating_sub(window)..];
            assert_eq!(got, want, "window {window} chunk {chunk}");
        }
    }

    fn padded_usage_line(tokens: u64, pad_bytes: usize) -> String {
        format!(
            r#"{{"type":"assistant","pad":"{}","message":{{"role":"assistant","usage":{{"input_tokens":{tokens}}}}}}}"#,
            "a".repeat(pad_bytes)
        )
    }

    #[test]
    fn large_lines_match_a_full_read() {
        let mut content = padded_usage_line(7, 300 * 1024);
        for i in 0..99 {
            content.push('\n');
            let _ = write!(content, r#"{{"n":{i},"tool_output":"{}"}}"#, "b".repeat(300 * 1024));
        }
        content.push('\n');
        let (_tmp, path) = transcript(&content);

        let all: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let baseline = all[all.len() - DEFAULT_USAGE_TAIL_LINES..]
            .iter()
            .rev()
            .filter_map(|line| parse_record(line))
            .map(|record| context_tokens(&record))
            .find(|&tokens| tokens > 0)
            .unwrap_or(0);
        assert_eq!(baseline, 7);

        let tail = read_tail_lines(&path, DEFAULT_USAGE_TAIL_LINES).expect("tail");
        assert_eq!(tail.len(), DEFAULT_USAGE_TAIL_LINES);
        assert_eq!(tail.first().map(String::as_str), Some(all[0]));
        assert_eq!(UsageTailScanner::default().estimate(&path).expect("estimate"), baseline);
    }

    #[test]
    fn oversized_lines_hold_a_slot_but_are_not_decoded() {
        let content = format!(
            "{}\n{}\n",
            usage_line(55, false),
            padded_usage_line(99, MAX_LINE_BYTES + 1)
        );
        let (_tmp, path) = transcript(&content);

        let tail = read_tail_lines(&path, 2).expect("tail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1], "");
        assert_eq!(UsageTailScanner::new(2).estimate(&path).expect("wide"), 55);
        assert_eq!(UsageTailScanner::new(1).estimate(&path).expect("narrow"), 0);
    }

    #[test]
    fn latest_user_message_skips_system_and_foreign_records() {
        let content = [
            r#"{"sessionId":"s1","type":"user","message":{"role":"user","content":"refactor the parser"}}"#,
            r#"{"sessionId":"s1","type":"assistant","message":{"role":"assistant","content":"ok"}}"#,
            r#"{"sessionId":"s1","type":"user","message":{"role":"user","content":"Caveat: generated by a command"}}"#,
            r#"{"sessionId":"s1","type":"user","message":{"role":"user","content":"<command-name>/clear</command-name>"}}"#,
            r#"{"sessionId":"s1","type":"user","message":{"role":"user","content":[{"type":"tool_result"}]}}"#,
            r#"{"sessionId":"s1","type":"user","isSidechain":true,"message":{"role":"user","content":"side task"}}"#,
            r#"{"sessionId":"other","type":"user","message":{"role":"user","content":"wrong session"}}"#,
        ]
        .join("\n");
        let (_tmp, path) = transcript(&content);

        let message = latest_user_message(&path, "s1", DEFAULT_EXCERPT_TAIL_LINES).expect("scan");
        assert_eq!(message.as_deref(), Some("refactor the parser"));
    }

    #[test]
    fn latest_user_message_without_candidates_is_none() {
        let (_tmp, path) = transcript(&usage_line(10, false));
        assert_eq!(latest_user_message(&path, "s1", 200).expect("scan"), None);
        assert_eq!(latest_user_message(Path::new(""), "s1", 200).expect("blank"), None);
    }
}
