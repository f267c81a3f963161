//! Model resource-list parser.
//!
//! One model per line: a path followed by an optional row-major 4x4
//! transform (16 whitespace-separated floats). Lines starting with
//! `visible:` or `invisible:` force-include or force-exclude model
//! indices declared elsewhere in the file.

use std::path::{Path, PathBuf};

use glam::DMat4;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
  #[error("failed to read resource file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("line {line}: expected 16 transform floats, got {count}")]
  MalformedTransform { line: usize, count: usize },
  #[error("line {line}: malformed number '{token}'")]
  MalformedNumber { line: usize, token: String },
}

/// One parsed model line.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelEntry {
  pub path: PathBuf,
  pub transform: DMat4,
}

/// Parsed resource file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceList {
  pub entries: Vec<ModelEntry>,
  /// Model indices forced visible.
  pub visible: Vec<usize>,
  /// Model indices forced invisible.
  pub invisible: Vec<usize>,
}

impl ResourceList {
  /// Parse a resource file from disk.
  pub fn load(path: &Path) -> Result<Self, ResourceError> {
    let content = std::fs::read_to_string(path).map_err(|source| ResourceError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&content)
  }

  /// Parse resource-file content.
  pub fn parse(content: &str) -> Result<Self, ResourceError> {
    let mut list = ResourceList::default();

    for (line_no, raw) in content.lines().enumerate() {
      let line_no = line_no + 1;
      let line = raw.trim();
      if line.is_empty() {
        continue;
      }

      if let Some(rest) = line.strip_prefix("visible:") {
        list.visible.extend(parse_indices(rest, line_no)?);
        continue;
      }
      if let Some(rest) = line.strip_prefix("invisible:") {
        list.invisible.extend(parse_indices(rest, line_no)?);
        continue;
      }

      let mut tokens = line.split_whitespace();
      let path = PathBuf::from(tokens.next().expect("non-empty line has a first token"));
      let floats: Vec<&str> = tokens.collect();

      let transform = match floats.len() {
        0 => DMat4::IDENTITY,
        16 => {
          let mut values = [0.0f64; 16];
          for (slot, token) in values.iter_mut().zip(&floats) {
            *slot = token.parse().map_err(|_| ResourceError::MalformedNumber {
              line: line_no,
              token: (*token).to_string(),
            })?;
          }
          // File is row-major; glam is column-major.
          DMat4::from_cols_array(&values).transpose()
        }
        count => return Err(ResourceError::MalformedTransform { line: line_no, count }),
      };

      list.entries.push(ModelEntry { path, transform });
    }

    Ok(list)
  }
}

fn parse_indices(rest: &str, line_no: usize) -> Result<Vec<usize>, ResourceError> {
  rest
    .split_whitespace()
    .map(|token| {
      token.parse().map_err(|_| ResourceError::MalformedNumber {
        line: line_no,
        token: token.to_string(),
      })
    })
    .collect()
}
