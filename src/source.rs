//! Source excerpts around a line, for get_source_code

use serde::Serialize;
use std::path::Path;

use crate::error::{DebugpyError, Result};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceLine {
    pub line_number: usize,
    pub content: String,
    pub is_target: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceExcerpt {
    pub file_path: String,
    pub target_line: usize,
    pub context_lines: usize,
    pub total_lines: usize,
    pub source: Vec<SourceLine>,
}

/// Lines `line - context ..= line + context`, clamped to the file
pub fn excerpt(text: &str, line_number: usize, context_lines: usize) -> Result<Vec<SourceLine>> {
    let lines: Vec<&str> = text.lines().collect();
    let total = lines.len();
    if line_number == 0 || line_number > total {
        return Err(DebugpyError::LineOutOfRange { line: line_number, total });
    }

    let first = line_number.saturating_sub(context_lines).max(1);
    let last = line_number.saturating_add(context_lines).min(total);

    Ok((first..=last)
        .map(|number| SourceLine {
            line_number: number,
            content: lines[number - 1].trim_end().to_string(),
            is_target: number == line_number,
        })
        .collect())
}

pub async fn read_source(file_path: &str, line_number: usize, context_lines: usize) -> Result<SourceExcerpt> {
    let path = Path::new(file_path);
    if !path.is_file() {
        return Err(DebugpyError::FileNotFound(file_path.to_string()));
    }

    let bytes = tokio::fs::read(path).await?;
    let text = String::from_utf8_lossy(&bytes);
    let source = excerpt(&text, line_number, context_lines)?;

    Ok(SourceExcerpt {
        file_path: file_path.to_string(),
        target_line: line_number,
        context_lines,
        total_lines: text.lines().count(),
        source,
    })
}
