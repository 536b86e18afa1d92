//! Helper types and conversions for the MRO protocol.
//!
//! The analysis server encodes an ancestor chain in two places: as the single
//! newline-joined argument of the `pythonMRO.showMRO` command on a resolved
//! code lens, and as one hover entry per class. The functions here pull the
//! chain back out of either.

use lsp_types::{CodeLens, Hover, HoverContents, MarkedString, Position, Range, Url};
use std::path::Path;

use crate::error::LspError;

use super::LspResult;

/// Command attached to resolved code lenses.
pub const SHOW_MRO_COMMAND: &str = "pythonMRO.showMRO";

/// Title of the command attached to resolved code lenses.
pub const SHOW_MRO_TITLE: &str = "Show MRO list";

/// Converts a path to an LSP file:// URI.
///
/// This handles both absolute and relative paths, converting them to
/// properly formatted file:// URIs that LSP servers expect.
///
/// # Errors
///
/// Returns [`LspError::DocumentNotFound`] if the path cannot be resolved.
pub fn path_to_url(path: &Path) -> LspResult<Url> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| {
                LspError::DocumentNotFound(format!("failed to get current directory: {e}"))
            })?
            .join(path)
    };

    // Canonicalize to resolve symlinks and normalize path
    let canonical = absolute.canonicalize().map_err(|e| {
        LspError::DocumentNotFound(format!(
            "failed to canonicalize path '{}': {}",
            path.display(),
            e
        ))
    })?;

    Url::from_file_path(&canonical)
        .map_err(|()| LspError::DocumentNotFound(format!("invalid path: {}", canonical.display())))
}

/// Extension trait for converting paths to LSP Url.
pub trait PathToUri {
    /// Converts a path to an LSP Url.
    ///
    /// # Errors
    ///
    /// Same as [`path_to_url`].
    fn to_lsp_uri(&self) -> LspResult<Url>;
}

impl PathToUri for Path {
    fn to_lsp_uri(&self) -> LspResult<Url> {
        path_to_url(self)
    }
}

/// Language id announced on `didOpen`.
pub fn language_id(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("py" | "pyi" | "pyw") => "python",
        _ => "plaintext",
    }
}

/// Converts user-facing 1-indexed position to LSP 0-indexed position.
///
/// # Errors
///
/// Returns error if line or column is 0.
pub fn to_lsp_position(line: u32, column: u32) -> LspResult<Position> {
    if line == 0 || column == 0 {
        return Err(LspError::InvalidPosition { line, column });
    }
    Ok(Position {
        line: line - 1,
        character: column - 1,
    })
}

/// Converts LSP 0-indexed position to user-facing 1-indexed position.
pub fn from_lsp_position(position: Position) -> (u32, u32) {
    (position.line + 1, position.character + 1)
}

/// Range spanning all of `text`, with UTF-16 columns as LSP requires.
pub fn full_range(text: &str) -> Range {
    let mut line = 0u32;
    let mut character = 0u32;
    for ch in text.chars() {
        if ch == '\n' {
            line += 1;
            character = 0;
        } else {
            character += u32::try_from(ch.len_utf16()).unwrap_or(2);
        }
    }
    Range {
        start: Position::new(0, 0),
        end: Position::new(line, character),
    }
}

/// Extracts the ancestor chain from a resolved code lens.
///
/// Returns `None` when the lens carries no `pythonMRO.showMRO` command or the
/// command has no string argument.
pub fn chain_from_lens(lens: &CodeLens) -> Option<Vec<String>> {
    let command = lens.command.as_ref()?;
    if command.command != SHOW_MRO_COMMAND {
        return None;
    }
    let text = command.arguments.as_ref()?.first()?.as_str()?;
    Some(split_chain(text))
}

/// Extracts the ancestor chain from the `data` of an unresolved code lens.
pub fn chain_from_lens_data(lens: &CodeLens) -> Option<Vec<String>> {
    lens.data
        .as_ref()?
        .as_array()?
        .iter()
        .map(|value| value.as_str().map(ToString::to_string))
        .collect()
}

/// Extracts the ancestor chain from a hover result, one class per entry.
pub fn chain_from_hover(hover: &Hover) -> Vec<String> {
    match &hover.contents {
        HoverContents::Array(entries) => entries.iter().map(marked_string_text).collect(),
        HoverContents::Scalar(entry) => split_chain(&marked_string_text(entry)),
        HoverContents::Markup(markup) => split_chain(&markup.value),
    }
}

/// Joins a chain the way the `pythonMRO.showMRO` argument carries it.
pub fn join_chain(chain: &[String]) -> String {
    chain.join("\n")
}

fn split_chain(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn marked_string_text(entry: &MarkedString) -> String {
    match entry {
        MarkedString::String(s) => s.clone(),
        MarkedString::LanguageString(ls) => ls.value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{Command, MarkupContent, MarkupKind};
    use serde_json::json;

    fn lens_with_command(command: &str, argument: serde_json::Value) -> CodeLens {
        CodeLens {
            range: Range::default(),
            command: Some(Command {
                title: SHOW_MRO_TITLE.to_string(),
                command: command.to_string(),
                arguments: Some(vec![argument]),
            }),
            data: None,
        }
    }

    #[test]
    fn test_to_lsp_position() {
        let pos = to_lsp_position(1, 1).unwrap();
        assert_eq!(pos, Position::new(0, 0));

        let pos = to_lsp_position(10, 5).unwrap();
        assert_eq!(pos, Position::new(9, 4));
    }

    #[test]
    fn test_to_lsp_position_invalid() {
        assert!(to_lsp_position(0, 1).is_err());
        assert!(to_lsp_position(1, 0).is_err());
    }

    #[test]
    fn test_from_lsp_position() {
        assert_eq!(from_lsp_position(Position::new(0, 0)), (1, 1));
        assert_eq!(from_lsp_position(Position::new(9, 4)), (10, 5));
    }

    #[test]
    fn test_full_range_counts_utf16() {
        assert_eq!(full_range("").end, Position::new(0, 0));
        assert_eq!(full_range("class A:\n    pass\n").end, Position::new(2, 0));
        // U+1D49C is two UTF-16 code units
        assert_eq!(full_range("x = '\u{1D49C}'").end, Position::new(0, 8));
    }

    #[test]
    fn test_chain_from_resolved_lens() {
        let lens = lens_with_command(SHOW_MRO_COMMAND, json!("B\nA\nGeneric\nobject"));
        assert_eq!(
            chain_from_lens(&lens).unwrap(),
            vec!["B", "A", "Generic", "object"]
        );
    }

    #[test]
    fn test_chain_from_lens_rejects_other_commands() {
        let lens = lens_with_command("editor.action.showReferences", json!("A"));
        assert!(chain_from_lens(&lens).is_none());

        let lens = lens_with_command(SHOW_MRO_COMMAND, json!(42));
        assert!(chain_from_lens(&lens).is_none());
    }

    #[test]
    fn test_chain_from_lens_data() {
        let lens = CodeLens {
            range: Range::default(),
            command: None,
            data: Some(json!(["C", "A", "object"])),
        };
        assert_eq!(chain_from_lens_data(&lens).unwrap(), vec!["C", "A", "object"]);

        let lens = CodeLens {
            data: Some(json!(["C", 1])),
            ..lens
        };
        assert!(chain_from_lens_data(&lens).is_none());
    }

    #[test]
    fn test_chain_from_hover_variants() {
        let array = Hover {
            contents: HoverContents::Array(vec![
                MarkedString::String("A".to_string()),
                MarkedString::String("object".to_string()),
            ]),
            range: None,
        };
        assert_eq!(chain_from_hover(&array), vec!["A", "object"]);

        let markup = Hover {
            contents: HoverContents::Markup(MarkupContent {
                kind: MarkupKind::PlainText,
                value: "A\nobject\n".to_string(),
            }),
            range: None,
        };
        assert_eq!(chain_from_hover(&markup), vec!["A", "object"]);
    }

    #[test]
    fn test_join_chain() {
        let chain = vec!["A".to_string(), "object".to_string()];
        assert_eq!(join_chain(&chain), "A\nobject");
    }

    #[test]
    fn test_language_id() {
        assert_eq!(language_id(Path::new("diamond.py")), "python");
        assert_eq!(language_id(Path::new("stubs.pyi")), "python");
        assert_eq!(language_id(Path::new("README")), "plaintext");
    }

    #[test]
    fn test_path_to_uri() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("mro_lens_test.py");
        std::fs::write(&file, "class A: pass\n").unwrap();

        let uri = file.to_lsp_uri().unwrap();
        assert!(uri.as_str().starts_with("file://"));
        assert!(uri.as_str().ends_with("mro_lens_test.py"));
    }
}
