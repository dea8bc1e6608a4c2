use crate::select::{FN_PREFIX_COLUMN, RUN_ID_COLUMN};
use bestrun_core::{OutputGuard, PipelineError, Result, RowRef};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Placeholder substituted with the copied checkpoint path.
pub const ARTIFACT_FIELD: &str = "artifact";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Field(String),
}

/// Command template with `{field}` placeholders; `{{` and `}}` are literal braces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |reason: String| PipelineError::Template { reason };
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = text.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return Err(invalid(format!("nested '{{' at byte {}", pos))),
                            c => name.push(c),
                        }
                    }
                    if !closed {
                        return Err(invalid(format!("unclosed '{{' at byte {}", pos)));
                    }
                    if name.is_empty() {
                        return Err(invalid(format!("empty placeholder at byte {}", pos)));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Text(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Field(name));
                }
                '}' => return Err(invalid(format!("unmatched '}}' at byte {}", pos))),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Text(literal));
        }
        Ok(Self { segments })
    }

    /// Placeholder names in order of appearance, duplicates included.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Text(_) => None,
        })
    }

    /// Substitute `row` into the template. A column that is absent, or whose
    /// cell is blank for this row, is a `MissingField`.
    pub fn render(&self, row: &RowRef<'_>, artifact: &Path) -> Result<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(t) => out.push_str(t),
                Segment::Field(name) if name == ARTIFACT_FIELD => {
                    out.push_str(&artifact.to_string_lossy())
                }
                Segment::Field(name) => {
                    let value = row
                        .get(name)
                        .filter(|v| !v.trim().is_empty())
                        .ok_or_else(|| PipelineError::MissingField {
                            field: name.clone(),
                            fn_prefix: row.get(FN_PREFIX_COLUMN).unwrap_or("?").to_string(),
                            run_id: row.get(RUN_ID_COLUMN).unwrap_or("?").to_string(),
                        })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingFieldPolicy {
    #[default]
    Abort,
    Skip,
}

impl MissingFieldPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Abort => "abort",
            Self::Skip => "skip",
        }
    }
}

/// Rendered command blocks held in memory until the whole run succeeded.
#[derive(Debug, Clone)]
pub struct ScriptBuffer {
    text: String,
    separator: String,
    blocks: usize,
}

impl ScriptBuffer {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            separator: separator.into(),
            blocks: 0,
        }
    }

    pub fn push(&mut self, block: &str) {
        self.text.push_str(block);
        self.text.push_str(&self.separator);
        self.blocks += 1;
    }

    pub fn blocks(&self) -> usize {
        self.blocks
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Stage the buffer for `path`; it lands when `guard` commits.
    pub fn flush(self, path: &Path, guard: &mut OutputGuard) -> Result<()> {
        guard.write(path, self.text.as_bytes())?;
        tracing::info!(path = %path.display(), blocks = self.blocks, "staged script");
        Ok(())
    }
}
