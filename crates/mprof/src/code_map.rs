use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap},
    hash::{Hash, Hasher},
    ops::Range,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{source, Probe, Result};

/// Identity of a [`CodeUnit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeId(u64);

impl CodeId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

/// A function or closure body: its file, first line and the units nested in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeUnit {
    name: String,
    file: PathBuf,
    first_line: u32,
    line_count: Option<u32>,
    nested: Vec<CodeUnit>,
}

impl CodeUnit {
    pub fn new(name: impl Into<String>, file: impl Into<PathBuf>, first_line: u32) -> Self {
        Self {
            name: name.into(),
            file: file.into(),
            first_line,
            line_count: None,
            nested: vec![],
        }
    }

    /// Fix the textual extent instead of discovering it from the source.
    pub fn with_line_count(mut self, line_count: u32) -> Self {
        self.line_count = Some(line_count);
        self
    }

    /// Declare a unit textually embedded in this one.
    pub fn with_nested(mut self, unit: CodeUnit) -> Self {
        self.nested.push(unit);
        self
    }

    pub fn id(&self) -> CodeId {
        let mut hasher = DefaultHasher::new();

        self.name.hash(&mut hasher);
        self.file.hash(&mut hasher);
        self.first_line.hash(&mut hasher);

        CodeId(hasher.finish())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    pub fn first_line(&self) -> u32 {
        self.first_line
    }

    pub fn line_count(&self) -> Option<u32> {
        self.line_count
    }

    pub fn nested(&self) -> &[CodeUnit] {
        &self.nested
    }
}

/// Memory statistics of one source line, in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineStat {
    /// Largest delta observed against the previously executed line.
    pub increment: f64,
    /// Largest memory level observed at this line.
    pub level: f64,
    /// Number of measurements attributed to this line.
    pub occurrences: u64,
}

type Table = BTreeMap<u32, LineStat>;

struct Registered {
    table: usize,
    file: PathBuf,
}

struct TopLevel {
    name: String,
    file: PathBuf,
    lines: Range<u32>,
    table: usize,
}

/// Per-line statistics of registered code units.
///
/// Nested units share the table of their top-level unit, so memory used by
/// an inner closure shows up in the report of the function enclosing it.
pub struct CodeMap<P> {
    probe: P,
    units: HashMap<CodeId, Registered>,
    tables: Vec<Table>,
    toplevel: Vec<TopLevel>,
    last_level: Option<f64>,
}

impl<P: Probe> CodeMap<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            units: Default::default(),
            tables: Default::default(),
            toplevel: Default::default(),
            last_level: None,
        }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Register `unit` and everything nested in it.
    ///
    /// Returns false when the unit was already known or when its source
    /// file can not be found, the latter is logged.
    pub fn register(&mut self, unit: &CodeUnit) -> bool {
        if self.contains(unit.id()) {
            return false;
        }

        let Some(file) = source::locate(unit.file()) else {
            log::error!("Could not find file {}", unit.file().display());

            if unit.file().to_string_lossy().starts_with('<') {
                log::error!(
                    "NOTE: only code defined in physical files can be profiled line by line"
                );
            }

            return false;
        };

        let line_count = match unit.line_count() {
            Some(line_count) => line_count,
            None => {
                let extent = source::read_lines(&file)
                    .ok()
                    .and_then(|lines| source::block_extent(&lines, unit.first_line()));

                match extent {
                    Some(line_count) => line_count,
                    None => {
                        log::warn!(
                            "Could not find the body of `{}` at {}:{}, skipping",
                            unit.name(),
                            file.display(),
                            unit.first_line()
                        );
                        return false;
                    }
                }
            }
        };

        let table = self.tables.len();

        self.tables.push(Table::new());

        self.toplevel.push(TopLevel {
            name: unit.name().to_owned(),
            file: file.clone(),
            lines: unit.first_line()..unit.first_line() + line_count,
            table,
        });

        self.alias(unit, table, &file);

        true
    }

    fn alias(&mut self, unit: &CodeUnit, table: usize, file: &Path) {
        if self.contains(unit.id()) {
            return;
        }

        self.units.insert(
            unit.id(),
            Registered {
                table,
                file: file.to_path_buf(),
            },
        );

        for nested in unit.nested() {
            self.alias(nested, table, file);
        }
    }

    pub fn contains(&self, code: CodeId) -> bool {
        self.units.contains_key(&code)
    }

    /// Resolved source file of a registered unit.
    pub fn file_of(&self, code: CodeId) -> Option<&Path> {
        self.units.get(&code).map(|unit| unit.file.as_path())
    }

    /// Take a reading and attribute it to `line` of `code`.
    ///
    /// The increment is measured against the level stored for
    /// `previous_line` in the same table, falling back to the last reading
    /// this map took and then to zero. Unregistered units are ignored.
    pub fn record(&mut self, code: CodeId, line: u32, previous_line: Option<u32>) -> Result<()> {
        let Some(unit) = self.units.get(&code) else {
            return Ok(());
        };

        let memory = self.probe.probe(Some(&unit.file))?;

        let table = &mut self.tables[unit.table];

        let baseline = previous_line
            .and_then(|previous| table.get(&previous))
            .map(|stat| stat.level)
            .or(self.last_level)
            .unwrap_or_default();

        let increment = memory - baseline;

        table
            .entry(line)
            .and_modify(|stat| {
                stat.increment = stat.increment.max(increment);
                stat.level = stat.level.max(memory);
                stat.occurrences += 1;
            })
            .or_insert(LineStat {
                increment,
                level: memory,
                occurrences: 1,
            });

        self.last_level = Some(memory);

        Ok(())
    }

    pub fn stat(&self, code: CodeId, line: u32) -> Option<&LineStat> {
        let unit = self.units.get(&code)?;

        self.tables[unit.table].get(&line)
    }

    /// Top-level units that accumulated at least one measurement.
    pub fn iter(&self) -> impl Iterator<Item = Block<'_>> {
        self.toplevel
            .iter()
            .filter(|top| !self.tables[top.table].is_empty())
            .map(|top| Block {
                name: &top.name,
                file: &top.file,
                lines: top.lines.clone(),
                stats: &self.tables[top.table],
            })
    }
}

/// The report view of one top-level unit.
#[derive(Clone)]
pub struct Block<'a> {
    name: &'a str,
    file: &'a Path,
    lines: Range<u32>,
    stats: &'a Table,
}

impl<'a> Block<'a> {
    pub fn name(&self) -> &'a str {
        self.name
    }

    pub fn file(&self) -> &'a Path {
        self.file
    }

    /// Every line of the unit's extent, measured or not.
    ///
    /// Can be called any number of times.
    pub fn lines(&self) -> Lines<'a> {
        Lines {
            range: self.lines.clone(),
            stats: self.stats,
        }
    }
}

#[derive(Clone)]
pub struct Lines<'a> {
    range: Range<u32>,
    stats: &'a Table,
}

impl<'a> Iterator for Lines<'a> {
    type Item = (u32, Option<&'a LineStat>);

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.range.next()?;

        Some((line, self.stats.get(&line)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.range.size_hint()
    }
}

impl ExactSizeIterator for Lines<'_> {}
