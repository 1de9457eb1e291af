//! Stage artifacts on disk: JSON-lines and CSV files
//!
//! JSON-lines readers also accept Python dict literals
//! (`{'sha': 'abc', 'date': None}`) since older commit lists were written
//! that way.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use serde::de::DeserializeOwned;
use serde::Serialize;
use crate::{Error, Result};

/// Read every non-blank line of a JSON-lines file
pub fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record = parse_json_line(line).map_err(|e| {
            Error::InvalidInput(format!("{}:{}: {}", path.display(), lineno + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

fn parse_json_line<T: DeserializeOwned>(line: &str) -> std::result::Result<T, serde_json::Error> {
    match serde_json::from_str(line) {
        Ok(record) => Ok(record),
        Err(original) => serde_json::from_str(&python_literal_to_json(line)).map_err(|_| original),
    }
}

/// Rewrite a Python literal (single-quoted strings, `None`, `True`,
/// `False`) as JSON. Text inside strings is left alone.
pub fn python_literal_to_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' => {
                let quote = c;
                out.push('"');
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            match chars.next() {
                                Some('\'') => out.push('\''),
                                Some(next) => {
                                    out.push('\\');
                                    out.push(next);
                                }
                                None => out.push('\\'),
                            }
                        }
                        '"' if quote == '\'' => out.push_str("\\\""),
                        c if c == quote => break,
                        c => out.push(c),
                    }
                }
                out.push('"');
            }
            c if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "None" | "nan" | "NaN" => "null",
                    "True" => "true",
                    "False" => "false",
                    other => other,
                });
            }
            c => out.push(c),
        }
    }
    out
}

/// Write records as JSON-lines, creating parent directories.
/// Returns the number of records written.
pub fn write_jsonl<T: Serialize>(path: &Path, records: &[T]) -> Result<usize> {
    ensure_parent(path)?;
    let mut writer = BufWriter::new(File::create(path)?);
    for record in records {
        serde_json::to_writer(&mut writer, record)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(records.len())
}

/// Read a CSV file with a header row
pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

/// Write rows as CSV with a header row, creating parent directories
pub fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<usize> {
    ensure_parent(path)?;
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(rows.len())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Commit {
        idx: u64,
        repo_name: String,
        commit_sha: Option<String>,
    }

    #[test]
    fn test_jsonl_roundtrip_creates_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/commits.jsonl");
        let commits = vec![
            Commit { idx: 0, repo_name: "a/b".into(), commit_sha: Some("abc".into()) },
            Commit { idx: 1, repo_name: "a/b".into(), commit_sha: None },
        ];

        assert_eq!(write_jsonl(&path, &commits).unwrap(), 2);
        let back: Vec<Commit> = read_jsonl(&path).unwrap();
        assert_eq!(back, commits);
    }

    #[test]
    fn test_reads_python_literals() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("commits.jsonl");
        std::fs::write(
            &path,
            "{'idx': 0, 'repo_name': 'a/b', 'commit_sha': None}\n\n{\"idx\": 1, \"repo_name\": \"c/d\", \"commit_sha\": \"ff\"}\n",
        )
        .unwrap();

        let commits: Vec<Commit> = read_jsonl(&path).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].commit_sha, None);
        assert_eq!(commits[1].repo_name, "c/d");
    }

    #[test]
    fn test_python_literal_keeps_string_contents() {
        let json = python_literal_to_json("{'message': 'None of \"this\" is True', 'ok': True}");
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["message"], "None of \"this\" is True");
        assert_eq!(value["ok"], true);
    }

    #[test]
    fn test_bad_line_reports_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.jsonl");
        std::fs::write(&path, "{\"idx\": 0, \"repo_name\": \"a\", \"commit_sha\": null}\nnot json\n").unwrap();

        let err = read_jsonl::<Commit>(&path).unwrap_err();
        assert!(err.to_string().contains(":2:"));
    }

    #[test]
    fn test_csv_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("repos.csv");
        let rows = vec![
            Commit { idx: 3, repo_name: "x/y".into(), commit_sha: None },
        ];
        write_csv(&path, &rows).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("idx,repo_name,commit_sha\n"));
        let back: Vec<Commit> = read_csv(&path).unwrap();
        assert_eq!(back, rows);
    }
}
