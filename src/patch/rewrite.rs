//! Durable patching: splice a candidate over the recorded line range

use crate::error::{PatchError, Result};
use crate::inspect::SourceLocation;
use crate::util::{dedent, indentation_of};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

/// Re-indent candidate lines to `base`, keeping their relative nesting.
///
/// Blank lines become empty and surrounding blank lines are dropped.
pub fn reflow(candidate: &str, base: &str) -> Result<Vec<String>> {
    let dedented = dedent(candidate);
    let lines: Vec<&str> = dedented.lines().collect();
    let first = lines.iter().position(|l| !l.trim().is_empty());
    let last = lines.iter().rposition(|l| !l.trim().is_empty());
    let (Some(first), Some(last)) = (first, last) else {
        return Err(PatchError::EmptyCandidate);
    };
    Ok(lines[first..=last]
        .iter()
        .map(|line| {
            let line = line.trim_end();
            if line.is_empty() {
                String::new()
            } else {
                format!("{}{}", base, line)
            }
        })
        .collect())
}

/// Replace lines `start_line..=end_line` of the location's file with the
/// reflowed candidate. Returns the last line of the new definition.
///
/// The whole file is rewritten in place under an exclusive advisory lock; a
/// crash mid-write can leave it truncated.
pub fn rewrite_source(location: &SourceLocation, candidate: &str) -> Result<usize> {
    let stale = |reason: String| PatchError::StaleLocation {
        path: location.origin.to_string(),
        start_line: location.start_line,
        end_line: location.end_line,
        reason,
    };
    let Some(path) = location.origin.path() else {
        return Err(stale("source is not backed by a file".to_string()));
    };

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| PatchError::io(path, e))?;
    lock_exclusive(&file, path)?;

    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| PatchError::io(path, e))?;

    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    if location.start_line < 1 || location.end_line < location.start_line {
        return Err(stale("invalid line range".to_string()));
    }
    if location.end_line > lines.len() {
        return Err(stale(format!("file now has {} line(s)", lines.len())));
    }

    let first = lines[location.start_line - 1];
    let newline = if first.ends_with("\r\n") { "\r\n" } else { "\n" };
    let replaced_last = location.end_line == lines.len();
    let keep_final_newline = !replaced_last || lines[lines.len() - 1].ends_with('\n');

    let body = reflow(candidate, indentation_of(first))?;
    let count = body.len();

    let mut out = String::with_capacity(content.len() + candidate.len());
    for line in &lines[..location.start_line - 1] {
        out.push_str(line);
    }
    for (i, line) in body.iter().enumerate() {
        out.push_str(line);
        if i + 1 < count || keep_final_newline {
            out.push_str(newline);
        }
    }
    for line in &lines[location.end_line..] {
        out.push_str(line);
    }

    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.set_len(0))
        .and_then(|_| file.write_all(out.as_bytes()))
        .and_then(|_| file.flush())
        .map_err(|e| PatchError::io(path, e))?;
    if let Err(err) = FileExt::unlock(&file) {
        tracing::debug!(path = %path.display(), "explicit unlock failed, released on close: {}", err);
    }

    let new_end = location.start_line + count - 1;
    tracing::info!(
        path = %path.display(),
        replaced = %format!("{}-{}", location.start_line, location.end_line),
        new_end,
        "rewrote function source"
    );
    Ok(new_end)
}

fn lock_exclusive(file: &File, path: &Path) -> Result<()> {
    let start = Instant::now();
    loop {
        match FileExt::try_lock_exclusive(file) {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                if start.elapsed() >= Duration::from_secs(LOCK_TIMEOUT_SECS) {
                    return Err(PatchError::io(
                        path,
                        std::io::Error::new(ErrorKind::TimedOut, "timed out waiting for file lock"),
                    ));
                }
                std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
            }
            Err(err) => return Err(PatchError::io(path, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::SourceOrigin;
    use std::fs;
    use std::path::PathBuf;

    fn location(path: PathBuf, start_line: usize, end_line: usize) -> SourceLocation {
        SourceLocation {
            origin: SourceOrigin::File(path),
            start_line,
            end_line,
        }
    }

    const TEN_LINES: &str = "import_line = 1\n\nclass Calc:\n    def add(self, a, b):\n        \"\"\"Add.\"\"\"\n        raise NotImplementedError\n\n    def sub(self, a, b):\n        return a - b\n# end\n";

    #[test]
    fn test_reflow_keeps_relative_nesting() {
        let lines = reflow("\ndef f(x):\n    if x:\n\n        return 1\n", "    ").unwrap();
        assert_eq!(lines, vec!["    def f(x):", "        if x:", "", "            return 1"]);
        assert!(matches!(reflow(" \n\n", "  "), Err(PatchError::EmptyCandidate)));
    }

    #[test]
    fn test_range_integrity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calc.py");
        fs::write(&path, TEN_LINES).unwrap();
        let before: Vec<String> = TEN_LINES.lines().map(String::from).collect();
        assert_eq!(before.len(), 10);

        let candidate = "def add(self, a, b):\n    \"\"\"Add.\"\"\"\n    total = a + b\n    # done\n    return total\n";
        let end = rewrite_source(&location(path.clone(), 4, 6), candidate).unwrap();
        assert_eq!(end, 8);

        let after: Vec<String> = fs::read_to_string(&path).unwrap().lines().map(String::from).collect();
        assert_eq!(after.len(), 12);
        assert_eq!(&after[..3], &before[..3]);
        assert_eq!(after[3], "    def add(self, a, b):");
        assert_eq!(after[4], "        \"\"\"Add.\"\"\"");
        assert_eq!(after[7], "        return total");
        assert_eq!(&after[8..], &before[6..]);
    }

    #[test]
    fn test_lock_released_after_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calc.py");
        fs::write(&path, TEN_LINES).unwrap();
        rewrite_source(&location(path.clone(), 4, 6), "def add(self, a, b):\n    return a + b\n").unwrap();

        let file = File::open(&path).unwrap();
        assert!(file.try_lock_exclusive().is_ok());
        FileExt::unlock(&file).unwrap();
        let second = rewrite_source(&location(path.clone(), 4, 5), "def add(self, a, b):\n    return b + a\n");
        assert_eq!(second.unwrap(), 5);
    }

    #[test]
    fn test_stale_when_file_shrank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.py");
        fs::write(&path, "def f():\n    pass\n").unwrap();
        let err = rewrite_source(&location(path.clone(), 1, 5), "def f():\n    return 1\n").unwrap_err();
        assert!(matches!(err, PatchError::StaleLocation { .. }));
        let err = rewrite_source(&location(path.clone(), 0, 1), "def f():\n    return 1\n").unwrap_err();
        assert!(matches!(err, PatchError::StaleLocation { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), "def f():\n    pass\n");
    }

    #[test]
    fn test_memory_origin_is_stale() {
        let loc = SourceLocation {
            origin: SourceOrigin::Memory("repl".into()),
            start_line: 1,
            end_line: 2,
        };
        assert!(matches!(
            rewrite_source(&loc, "def f():\n    return 1\n"),
            Err(PatchError::StaleLocation { .. })
        ));
    }

    #[test]
    fn test_crlf_and_missing_final_newline_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crlf.py");
        fs::write(&path, "x = 1\r\ndef f():\r\n    raise NotImplementedError").unwrap();
        rewrite_source(&location(path.clone(), 2, 3), "def f():\n    return x\n").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "x = 1\r\ndef f():\r\n    return x");
    }
}
