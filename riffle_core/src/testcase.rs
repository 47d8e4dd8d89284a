use std::fs;
use std::path::Path;

use crate::state::{StateError, TestcaseState};

/// One program under mutation: the source text as lines plus the probed
/// state describing it. All structural edits go through this type so the
/// text and the state can never drift apart.
#[derive(Debug, Clone, PartialEq)]
pub struct Testcase {
    lines: Vec<String>,
    pub state: TestcaseState,
}

fn split_lines(text: &str) -> Vec<String> {
    // Trailing whitespace is stripped on the way in; the on-disk format
    // never carries it.
    text.lines().map(|l| l.trim_end().to_string()).collect()
}

impl Testcase {
    pub fn new(text: &str, state: TestcaseState) -> Self {
        Testcase {
            lines: split_lines(text),
            state,
        }
    }

    /// A testcase with an empty state sized to the text, for paths that
    /// probe afterwards.
    pub fn from_text(text: &str) -> Self {
        let lines = split_lines(text);
        let state = TestcaseState::new(lines.len(), text.len());
        Testcase { lines, state }
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn line(&self, idx: usize) -> Option<&str> {
        self.lines.get(idx).map(|l| l.as_str())
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// The recorded line count matches the actual text. A mismatch means
    /// the state no longer describes this program.
    pub fn is_consistent(&self) -> bool {
        self.state.number_of_lines == self.lines.len()
    }

    /// Splice `text` in before line `at` (`at == line_count()` appends)
    /// and remap the state to match.
    pub fn insert_line(&mut self, at: usize, text: &str) {
        let at = at.min(self.lines.len());
        let new_lines = split_lines(text);
        if new_lines.is_empty() {
            self.lines.insert(at, String::new());
        } else {
            self.lines.splice(at..at, new_lines);
        }
        self.state.insert_line(at, text);
    }

    /// Remove `count` lines starting at `start`, remap the state, and
    /// return the removed text.
    pub fn remove_lines(&mut self, start: usize, count: usize) -> String {
        let end = (start + count).min(self.lines.len());
        if start >= end {
            return String::new();
        }
        let removed: Vec<String> = self.lines.drain(start..end).collect();
        let removed_text = removed.join("\n");
        self.state.remove_lines(start, end - start, &removed_text);
        removed_text
    }

    /// Splice another whole program in before line `point`.
    pub fn merge_at(&mut self, point: usize, other: &Testcase) {
        let point = point.min(self.lines.len());
        self.lines
            .splice(point..point, other.lines.iter().cloned());
        self.state.merge_at(point, &other.state);
    }

    pub fn save(&self, path: &Path) -> Result<(), StateError> {
        let mut text = self.text();
        if !text.is_empty() {
            text.push('\n');
        }
        fs::write(path, text)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SyntaxClass;
    use tempfile::tempdir;

    #[test]
    fn test_from_text_strips_trailing_whitespace() {
        let tc = Testcase::from_text("var a = 1;   \nprint(a);\t\n");
        assert_eq!(tc.lines(), &["var a = 1;", "print(a);"]);
        assert_eq!(tc.text(), "var a = 1;\nprint(a);");
    }

    #[test]
    fn test_insert_line_keeps_text_and_state_in_step() {
        let mut tc = Testcase::from_text("a();\nb();\nc();");
        tc.state.mark_line(1, SyntaxClass::Statement);
        tc.insert_line(1, "x();");
        assert_eq!(tc.lines(), &["a();", "x();", "b();", "c();"]);
        assert_eq!(tc.state.number_of_lines, 4);
        assert!(tc.is_consistent());
        assert_eq!(tc.state.statement_lines, vec![1, 2]);
    }

    #[test]
    fn test_insert_multi_line_text() {
        let mut tc = Testcase::from_text("a();\nb();");
        tc.insert_line(2, "x();\ny();");
        assert_eq!(tc.lines(), &["a();", "b();", "x();", "y();"]);
        assert!(tc.is_consistent());
    }

    #[test]
    fn test_remove_lines_returns_removed_text() {
        let mut tc = Testcase::from_text("a();\nb();\nc();\nd();");
        let removed = tc.remove_lines(1, 2);
        assert_eq!(removed, "b();\nc();");
        assert_eq!(tc.lines(), &["a();", "d();"]);
        assert!(tc.is_consistent());
    }

    #[test]
    fn test_remove_lines_clamps_to_end() {
        let mut tc = Testcase::from_text("a();\nb();");
        let removed = tc.remove_lines(1, 10);
        assert_eq!(removed, "b();");
        assert_eq!(tc.line_count(), 1);
        assert!(tc.is_consistent());
    }

    #[test]
    fn test_merge_at_combines_programs() {
        let mut a = Testcase::from_text("a0();\na1();");
        a.state.mark_line(0, SyntaxClass::Statement);
        let mut b = Testcase::from_text("b0();");
        b.state.mark_line(0, SyntaxClass::Statement);
        a.merge_at(1, &b);
        assert_eq!(a.lines(), &["a0();", "b0();", "a1();"]);
        assert!(a.is_consistent());
        assert_eq!(a.state.statement_lines, vec![0, 1]);
    }

    #[test]
    fn test_save_appends_final_newline() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tc1.js");
        let tc = Testcase::from_text("a();\nb();");
        tc.save(&path).unwrap();
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk, "a();\nb();\n");
        let reloaded = Testcase::from_text(&on_disk);
        assert_eq!(reloaded.lines(), tc.lines());
    }
}
