use std::{
    cell::{Cell, Ref, RefCell},
    io::{self, Write},
};

use serde::{Deserialize, Serialize};

use crate::{Measurement, Probe, Result, Sampler, SENTINEL};

/// Memory and time at the start and end of one stamped call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamp {
    pub name: String,
    pub start: Measurement,
    /// `None` while the call is still running.
    pub end: Option<Measurement>,
    /// Number of stamped calls enclosing this one.
    pub depth: usize,
}

/// Records memory at entry and exit of named calls instead of per line.
pub struct TimeStamper<P = Sampler> {
    probe: P,
    stamps: RefCell<Vec<Stamp>>,
    depth: Cell<usize>,
}

impl<P: Probe> TimeStamper<P> {
    pub fn new(probe: P) -> Self {
        Self {
            probe,
            stamps: Default::default(),
            depth: Cell::new(0),
        }
    }

    /// Start stamping `name`, the end reading is taken when the guard drops.
    pub fn stamp(&self, name: impl Into<String>) -> Result<StampGuard<'_, P>> {
        let start = Measurement::new(self.probe.probe(None)?, true);

        let depth = self.depth.get();
        self.depth.set(depth + 1);

        let mut stamps = self.stamps.borrow_mut();
        let index = stamps.len();

        stamps.push(Stamp {
            name: name.into(),
            start,
            end: None,
            depth,
        });

        Ok(StampGuard {
            stamper: self,
            index,
        })
    }

    /// Run `f` inside a stamp named `name`.
    pub fn time<R>(&self, name: impl Into<String>, f: impl FnOnce() -> R) -> Result<R> {
        let _guard = self.stamp(name)?;
        Ok(f())
    }

    pub fn stamps(&self) -> Ref<'_, Vec<Stamp>> {
        self.stamps.borrow()
    }

    /// Write one `FUNC` line per finished stamp.
    pub fn show_results<W: Write + ?Sized>(&self, stream: &mut W) -> io::Result<()> {
        for stamp in self.stamps.borrow().iter() {
            let Some(end) = &stamp.end else {
                continue;
            };

            writeln!(
                stream,
                "FUNC {} {:.4} {:.4} {:.4} {:.4} {}",
                stamp.name,
                stamp.start.mib,
                stamp.start.epoch_secs().unwrap_or_default(),
                end.mib,
                end.epoch_secs().unwrap_or_default(),
                stamp.depth
            )?;
        }

        Ok(())
    }
}

pub struct StampGuard<'a, P: Probe> {
    stamper: &'a TimeStamper<P>,
    index: usize,
}

impl<P: Probe> Drop for StampGuard<'_, P> {
    fn drop(&mut self) {
        let mib = self.stamper.probe.probe(None).unwrap_or_else(|err| {
            log::debug!("end of stamp not measured: {}", err);
            SENTINEL
        });

        if let Some(stamp) = self.stamper.stamps.borrow_mut().get_mut(self.index) {
            stamp.end = Some(Measurement::new(mib, true));
        }

        self.stamper.depth.set(self.stamper.depth.get().saturating_sub(1));
    }
}
