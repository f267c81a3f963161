//! Recorded camera sessions.
//!
//! A session file holds one view matrix per line as 16 row-major
//! floats. Recording appends snapshots newest-first, so the parser
//! reverses the list to restore recording order.

use std::io::Write;
use std::path::{Path, PathBuf};

use glam::DMat4;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
  #[error("failed to access session file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("line {line}: expected 16 view-matrix floats, got {count}")]
  MalformedLine { line: usize, count: usize },
  #[error("line {line}: malformed number '{token}'")]
  MalformedNumber { line: usize, token: String },
}

/// Parse a session file into view matrices in recording order.
pub fn load_session(path: &Path) -> Result<Vec<DMat4>, SessionError> {
  let content = std::fs::read_to_string(path).map_err(|source| SessionError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  parse_session(&content)
}

/// Parse session content; the on-disk order is newest-first.
pub fn parse_session(content: &str) -> Result<Vec<DMat4>, SessionError> {
  let mut matrices = Vec::new();

  for (line_no, raw) in content.lines().enumerate() {
    let line_no = line_no + 1;
    let line = raw.trim();
    if line.is_empty() {
      continue;
    }

    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != 16 {
      return Err(SessionError::MalformedLine {
        line: line_no,
        count: tokens.len(),
      });
    }

    let mut values = [0.0f64; 16];
    for (slot, token) in values.iter_mut().zip(&tokens) {
      *slot = token.parse().map_err(|_| SessionError::MalformedNumber {
        line: line_no,
        token: (*token).to_string(),
      })?;
    }
    matrices.push(DMat4::from_cols_array(&values).transpose());
  }

  matrices.reverse();
  Ok(matrices)
}

/// First unused `session_<n>.csn` path under `dir`.
pub fn next_session_path(dir: &Path) -> PathBuf {
  let mut n = 0u32;
  loop {
    let candidate = dir.join(format!("session_{n}.csn"));
    if !candidate.exists() {
      return candidate;
    }
    n += 1;
  }
}

/// Collects view matrices during an interactive run and writes them in
/// the newest-first layout `load_session` expects.
#[derive(Default)]
pub struct SessionRecorder {
  snapshots: Vec<DMat4>,
}

impl SessionRecorder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record one camera snapshot.
  pub fn push(&mut self, view: DMat4) {
    self.snapshots.push(view);
  }

  pub fn len(&self) -> usize {
    self.snapshots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.snapshots.is_empty()
  }

  /// Write the session to the first free `session_<n>.csn` in `dir`.
  /// Returns the chosen path.
  pub fn write_to_dir(&self, dir: &Path) -> Result<PathBuf, SessionError> {
    let path = next_session_path(dir);
    let mut file = std::fs::File::create(&path).map_err(|source| SessionError::Io {
      path: path.clone(),
      source,
    })?;

    // Newest first, so playback (which reverses) sees recording order.
    for view in self.snapshots.iter().rev() {
      let row_major = view.transpose().to_cols_array();
      let line: Vec<String> = row_major.iter().map(|v| v.to_string()).collect();
      writeln!(file, "{}", line.join(" ")).map_err(|source| SessionError::Io {
        path: path.clone(),
        source,
      })?;
    }

    Ok(path)
  }
}
