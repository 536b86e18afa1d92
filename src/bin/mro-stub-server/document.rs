//! Open document text and the classes found in it.

use lsp_types::{Position, Range, TextDocumentContentChangeEvent};

use crate::c3;
use crate::scan::{self, ClassDef};

/// A class with its name span and resolution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysedClass {
    /// Span of the class name.
    pub range: Range,
    /// The class first, `object` last.
    pub chain: Vec<String>,
}

/// Text of one document.
#[derive(Debug, Clone, Default)]
pub struct Document {
    text: String,
}

impl Document {
    pub fn new(text: String) -> Self {
        Self { text }
    }

    #[cfg(test)]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Applies one change. A change without a range replaces everything.
    pub fn apply(&mut self, change: TextDocumentContentChangeEvent) {
        match change.range {
            Some(range) => {
                let start = self.offset_at(range.start);
                let end = self.offset_at(range.end).max(start);
                self.text.replace_range(start..end, &change.text);
            }
            None => self.text = change.text,
        }
    }

    /// Classes in source order.
    pub fn classes(&self) -> Vec<AnalysedClass> {
        let defs = scan::scan(&self.text);
        let chains = c3::linearize_all(&defs);
        defs.iter()
            .zip(chains)
            .map(|(def, chain)| AnalysedClass {
                range: self.name_range(def),
                chain,
            })
            .collect()
    }

    /// The class whose name covers `position`.
    pub fn class_at(&self, position: Position) -> Option<AnalysedClass> {
        self.classes()
            .into_iter()
            .find(|class| class.range.start <= position && position < class.range.end)
    }

    fn name_range(&self, def: &ClassDef) -> Range {
        Range {
            start: self.position_at(def.name_start),
            end: self.position_at(def.name_end),
        }
    }

    /// Byte offset of a UTF-16 position, clamped to the text.
    fn offset_at(&self, position: Position) -> usize {
        let mut line_start = 0;
        for _ in 0..position.line {
            match self.text[line_start..].find('\n') {
                Some(newline) => line_start += newline + 1,
                None => return self.text.len(),
            }
        }
        let line_end = self.text[line_start..]
            .find('\n')
            .map_or(self.text.len(), |n| line_start + n);

        let mut units = 0u32;
        for (offset, ch) in self.text[line_start..line_end].char_indices() {
            if units >= position.character {
                return line_start + offset;
            }
            units += u32::try_from(ch.len_utf16()).unwrap_or(2);
        }
        line_end
    }

    fn position_at(&self, offset: usize) -> Position {
        let before = &self.text[..offset];
        let line_start = before.rfind('\n').map_or(0, |n| n + 1);
        let line = before.matches('\n').count();
        let character: usize = before[line_start..].chars().map(char::len_utf16).sum();
        Position::new(
            u32::try_from(line).unwrap_or(u32::MAX),
            u32::try_from(character).unwrap_or(u32::MAX),
        )
    }
}
