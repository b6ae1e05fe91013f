#![allow(dead_code)]

use std::{cell::Cell, io::Write, path::Path, rc::Rc};

use hala_mprof::{Probe, Result};
use tempfile::NamedTempFile;

/// A fake process memory level, moved by hand between trace events.
#[derive(Clone, Default)]
pub struct Heap {
    level: Rc<Cell<f64>>,
    reads: Rc<Cell<usize>>,
}

impl Heap {
    pub fn new(level: f64) -> Self {
        let heap = Self::default();
        heap.level.set(level);
        heap
    }

    pub fn alloc(&self, mib: f64) {
        self.level.set(self.level.get() + mib);
    }

    pub fn free(&self, mib: f64) {
        self.level.set(self.level.get() - mib);
    }

    pub fn reads(&self) -> usize {
        self.reads.get()
    }
}

impl Probe for Heap {
    fn probe(&self, _filename: Option<&Path>) -> Result<f64> {
        self.reads.set(self.reads.get() + 1);
        Ok(self.level.get())
    }
}

/// Write `text` to a temporary `.rs` file.
pub fn source_file(text: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".rs")
        .tempfile()
        .unwrap();

    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();

    file
}

pub const ALLOC_FREE: &str = "\
fn alloc_free() {
    let a = vec![0u8; 10 << 20];
    let b = vec![0u8; 20 << 20];
    drop(b);
}
";

pub const LOOPED: &str = "\
fn looped() {
    for _ in 0..3 {
        let c = vec![0u8; 50 << 20];
    }
}
";

pub const NESTED: &str = "\
fn outer() -> usize {
    let inner = |n: usize| {
        vec![0u8; n]
    };
    let v = inner(30 << 20);
    v.len()
}
";
