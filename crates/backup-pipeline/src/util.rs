use std::fs;
use std::path::Path;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

pub(crate) fn atomic_write_text(path: &Path, body: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("failed to create {}: {e}", parent.display())))?;
    }
    let file_name = path.file_name().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::msg(format!(
            "invalid file path for atomic write: {}",
            path.display()
        ))
    })?;
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        file_name,
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    fs::write(&tmp, body)
        .map_err(|e| Error::io(format!("failed to write temp file {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path).map_err(|e| {
        Error::io(format!(
            "failed to rename {} -> {}: {e}",
            tmp.display(),
            path.display()
        ))
    })?;
    Ok(())
}

/// Loads a JSON document, treating a missing file as `T::default()`.
pub(crate) fn load_json_or_default<T: DeserializeOwned + Default>(
    path: &Path,
    what: &str,
) -> Result<T> {
    if !path.is_file() {
        return Ok(T::default());
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read {what} {}: {e}", path.display())))?;
    serde_json::from_str::<T>(&raw)
        .map_err(|e| Error::msg(format!("failed to parse {what} {}: {e}", path.display())))
}

pub(crate) fn save_json<T: Serialize>(path: &Path, doc: &T, what: &str) -> Result<()> {
    let body = serde_json::to_string_pretty(doc)
        .map_err(|e| Error::msg(format!("failed to encode {what}: {e}")))?;
    atomic_write_text(path, &body)
        .map_err(|e| Error::io(format!("failed to write {what} {}: {e}", path.display())))
}

enum EscapeMode {
    Esc,
    Csi,
    Osc,
    OscEsc,
    StTerminated,
    StEsc,
}

/// Strips terminal escape sequences and control characters and bounds the
/// length of text that came from a remote peer.
pub(crate) fn sanitize_remote_text(input: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(input.len().min(max_chars));
    let mut esc_mode: Option<EscapeMode> = None;
    let mut count = 0usize;

    for c in input.chars() {
        if let Some(mode) = esc_mode.as_ref() {
            esc_mode = match mode {
                EscapeMode::Esc => match c {
                    '[' => Some(EscapeMode::Csi),
                    ']' => Some(EscapeMode::Osc),
                    'P' | 'X' | '^' | '_' => Some(EscapeMode::StTerminated),
                    _ => None,
                },
                EscapeMode::Csi if ('@'..='~').contains(&c) => None,
                EscapeMode::Csi => Some(EscapeMode::Csi),
                EscapeMode::Osc => match c {
                    '\x07' => None,
                    '\x1b' => Some(EscapeMode::OscEsc),
                    _ => Some(EscapeMode::Osc),
                },
                EscapeMode::OscEsc => match c {
                    '\\' => None,
                    '\x1b' => Some(EscapeMode::OscEsc),
                    _ => Some(EscapeMode::Osc),
                },
                EscapeMode::StTerminated | EscapeMode::StEsc => match c {
                    '\\' if matches!(mode, EscapeMode::StEsc) => None,
                    '\x1b' => Some(EscapeMode::StEsc),
                    _ => Some(EscapeMode::StTerminated),
                },
            };
            continue;
        }

        if c == '\x1b' {
            esc_mode = Some(EscapeMode::Esc);
            continue;
        }
        if count >= max_chars {
            out.push_str(" ...[truncated]");
            break;
        }
        if c == '\n' || c == '\r' || c == '\t' {
            out.push(' ');
        } else if c.is_control() || is_format_control(c) {
            continue;
        } else {
            out.push(c);
        }
        count += 1;
    }
    out.trim().to_string()
}

// Bidi overrides can reorder what an operator reads in a log line.
fn is_format_control(c: char) -> bool {
    c == '\u{061C}'
        || c == '\u{200E}'
        || c == '\u{200F}'
        || ('\u{202A}'..='\u{202E}').contains(&c)
        || ('\u{2066}'..='\u{2069}').contains(&c)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_creates_parents_and_replaces() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let p = tmp.path().join("a").join("b.json");
        atomic_write_text(&p, "one").expect("write");
        atomic_write_text(&p, "two").expect("rewrite");
        assert_eq!(fs::read_to_string(&p).expect("read"), "two");
        let leftovers = fs::read_dir(p.parent().expect("parent"))
            .expect("list")
            .count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn missing_json_is_default() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let v: Vec<u32> = load_json_or_default(&tmp.path().join("none.json"), "doc").expect("load");
        assert!(v.is_empty());
    }

    #[test]
    fn sanitize_strips_controls_and_truncates() {
        assert_eq!(sanitize_remote_text("a\u{7}b\nc", 100), "ab c");
        let long = "x".repeat(20);
        assert_eq!(sanitize_remote_text(&long, 5), "xxxxx ...[truncated]");
    }

    #[test]
    fn sanitize_drops_whole_escape_sequences() {
        let input = "quota \u{1b}[31mexceeded\u{1b}[0m \u{1b}]0;title\u{7}now";
        assert_eq!(sanitize_remote_text(input, 100), "quota exceeded now");
        assert_eq!(sanitize_remote_text("a\u{1b}Ppayload\u{1b}\\b", 100), "ab");
        assert_eq!(sanitize_remote_text("ok\u{202e}txt", 100), "oktxt");
    }
}
