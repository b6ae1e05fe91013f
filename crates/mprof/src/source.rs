//! Source file lookup and block extent discovery.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

/// Find `path` on disk.
///
/// Relative paths are tried against the working directory and then each of
/// its ancestors, `file!()` paths are relative to the workspace root while
/// tests run from the package directory.
pub fn locate(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return Some(path.to_path_buf());
    }

    if path.is_absolute() {
        return None;
    }

    let cwd = env::current_dir().ok()?;

    cwd.ancestors()
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.is_file())
}

/// Read all lines of `path`, each keeping its line terminator.
pub fn read_lines(path: &Path) -> std::io::Result<Vec<String>> {
    let text = fs::read_to_string(path)?;

    Ok(text.split_inclusive('\n').map(str::to_owned).collect())
}

/// Number of lines of the block starting at the 1-based `first_line`.
///
/// Brace delimited blocks end on the line closing the first `{`. Without a
/// brace on the first line the block is indentation delimited: it extends
/// over the following lines indented deeper than the first one, trailing
/// blank lines excluded.
pub fn block_extent(lines: &[String], first_line: u32) -> Option<u32> {
    let start = (first_line as usize).checked_sub(1)?;
    let head = lines.get(start)?;

    if contains_open_brace(head) {
        brace_extent(&lines[start..])
    } else {
        Some(indent_extent(&lines[start..]))
    }
}

fn contains_open_brace(line: &str) -> bool {
    let mut scanner = Scanner::default();

    line.chars().any(|c| scanner.feed(c) == Some('{'))
}

fn brace_extent(lines: &[String]) -> Option<u32> {
    let mut scanner = Scanner::default();
    let mut depth = 0usize;
    let mut opened = false;

    for (index, line) in lines.iter().enumerate() {
        for c in line.chars() {
            match scanner.feed(c) {
                Some('{') => {
                    depth += 1;
                    opened = true;
                }
                Some('}') => {
                    depth = depth.saturating_sub(1);

                    if opened && depth == 0 {
                        return Some(index as u32 + 1);
                    }
                }
                _ => {}
            }
        }

        scanner.end_line();
    }

    None
}

fn indent_extent(lines: &[String]) -> u32 {
    let base = indent(&lines[0]);
    let mut last = 0;

    for (index, line) in lines.iter().enumerate().skip(1) {
        if line.trim().is_empty() {
            continue;
        }

        if indent(line) <= base {
            break;
        }

        last = index;
    }

    last as u32 + 1
}

fn indent(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Tracks string literals and comments so braces inside them are ignored.
#[derive(Default)]
struct Scanner {
    in_string: bool,
    escaped: bool,
    block_comment: usize,
    line_comment: bool,
    prev: Option<char>,
}

impl Scanner {
    /// Feed one char, returns it when it is structural code.
    fn feed(&mut self, c: char) -> Option<char> {
        let prev = self.prev.replace(c);

        if self.line_comment {
            return None;
        }

        if self.block_comment > 0 {
            if prev == Some('*') && c == '/' {
                self.block_comment -= 1;
                self.prev = None;
            } else if prev == Some('/') && c == '*' {
                self.block_comment += 1;
                self.prev = None;
            }
            return None;
        }

        if self.in_string {
            if self.escaped {
                self.escaped = false;
            } else if c == '\\' {
                self.escaped = true;
            } else if c == '"' {
                self.in_string = false;
            }
            return None;
        }

        match c {
            '/' if prev == Some('/') => {
                self.line_comment = true;
                None
            }
            '*' if prev == Some('/') => {
                self.block_comment += 1;
                self.prev = None;
                None
            }
            '#' => {
                self.line_comment = true;
                None
            }
            '"' => {
                self.in_string = true;
                None
            }
            '{' | '}' => Some(c),
            _ => None,
        }
    }

    fn end_line(&mut self) {
        self.line_comment = false;
        self.prev = None;
    }
}
