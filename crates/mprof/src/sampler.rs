use std::{
    collections::HashSet,
    fmt::Display,
    path::Path,
    process::Command,
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

use crate::{snapshot, Error, Result};

/// Bytes per MiB.
pub const TWO_20: f64 = (1u64 << 20) as f64;

/// Value reported when a reading could not be taken.
pub const SENTINEL: f64 = -1.0;

/// Memory sampling strategies, in fallback priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Backend {
    /// Resident set size from the OS process table.
    ProcessTable,
    /// Resident set size read by shelling out to `ps`.
    ExternalProbe,
    /// Live heap bytes attributed to a source file by [`SnapshotAlloc`](crate::SnapshotAlloc).
    Snapshot,
}

impl Backend {
    pub const PRIORITY: [Backend; 3] = [
        Backend::ProcessTable,
        Backend::ExternalProbe,
        Backend::Snapshot,
    ];

    pub fn is_available(self) -> bool {
        match self {
            Backend::ProcessTable => sysinfo::IS_SUPPORTED_SYSTEM,
            Backend::ExternalProbe => cfg!(unix),
            Backend::Snapshot => snapshot::is_installed(),
        }
    }
}

impl Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::ProcessTable => write!(f, "process-table"),
            Backend::ExternalProbe => write!(f, "external-probe"),
            Backend::Snapshot => write!(f, "snapshot"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "process-table" | "psutil" => Ok(Backend::ProcessTable),
            "external-probe" | "posix" => Ok(Backend::ExternalProbe),
            "snapshot" | "tracemalloc" => Ok(Backend::Snapshot),
            _ => Err(format!("unknown memory backend `{}`", s)),
        }
    }
}

/// Pick the first available backend, trying `requested` first.
///
/// Falling back to another backend only logs a warning.
pub fn choose_backend(requested: Option<Backend>) -> Backend {
    let mut candidates = Backend::PRIORITY.to_vec();

    if let Some(requested) = requested {
        candidates.retain(|backend| *backend != requested);
        candidates.insert(0, requested);
    }

    let chosen = candidates
        .into_iter()
        .find(|backend| backend.is_available())
        .unwrap_or(Backend::ProcessTable);

    if let Some(requested) = requested {
        if requested != chosen {
            log::warn!("{} can not be used, {} used instead", requested, chosen);
        }
    }

    chosen
}

/// One memory reading in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub mib: f64,
    pub timestamp: Option<DateTime<Local>>,
}

impl Measurement {
    pub fn new(mib: f64, timestamps: bool) -> Self {
        Self {
            mib,
            timestamp: timestamps.then(Local::now),
        }
    }

    /// Seconds since the unix epoch, with sub-second precision.
    pub fn epoch_secs(&self) -> Option<f64> {
        self.timestamp
            .map(|ts| ts.timestamp_micros() as f64 / 1_000_000.0)
    }

    pub fn is_sentinel(&self) -> bool {
        self.mib == SENTINEL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleTarget {
    Current,
    Pid(u32),
}

impl SampleTarget {
    pub fn pid(self) -> u32 {
        match self {
            SampleTarget::Current => std::process::id(),
            SampleTarget::Pid(pid) => pid,
        }
    }
}

/// Takes memory readings with one [`Backend`].
pub struct Sampler {
    backend: Backend,
    include_children: bool,
    timestamps: bool,
    system: Mutex<System>,
}

impl Sampler {
    /// Create a sampler, falling back through [`Backend::PRIORITY`] when
    /// `backend` is not available.
    pub fn new(backend: Option<Backend>) -> Self {
        Self::with_backend(choose_backend(backend))
    }

    /// Create a sampler for exactly `backend`, without fallback.
    pub fn with_backend(backend: Backend) -> Self {
        Self {
            backend,
            include_children: false,
            timestamps: false,
            system: Mutex::new(System::new()),
        }
    }

    /// Count descendant processes toward each reading.
    pub fn include_children(mut self, flag: bool) -> Self {
        self.include_children = flag;
        self
    }

    /// Attach a wall-clock timestamp to each reading.
    pub fn timestamps(mut self, flag: bool) -> Self {
        self.timestamps = flag;
        self
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Take one reading of `target`.
    ///
    /// `filename` is the source file memory is attributed to, only the
    /// snapshot backend uses it.
    pub fn sample(&self, target: SampleTarget, filename: Option<&Path>) -> Result<Measurement> {
        let mib = match self.backend {
            Backend::ProcessTable => self.process_table(target.pid()),
            Backend::ExternalProbe => {
                if self.include_children {
                    return Err(Error::ChildrenUnsupported(self.backend));
                }

                external_probe(target.pid())
            }
            Backend::Snapshot => {
                if self.include_children {
                    return Err(Error::ChildrenUnsupported(self.backend));
                }

                let filename = match filename {
                    Some(filename) if !is_synthetic(filename) => filename,
                    _ => return Err(Error::UnknownSource(filename.map(Path::to_path_buf))),
                };

                if target.pid() != std::process::id() {
                    return Err(Error::InvalidOptions(
                        "the snapshot backend only observes the current process",
                    ));
                }

                let snapshot = snapshot::Snapshot::take()
                    .ok_or(Error::BackendUnavailable(self.backend))?;

                snapshot.size_for(filename) as f64 / TWO_20
            }
        };

        Ok(Measurement::new(mib, self.timestamps))
    }

    fn process_table(&self, pid: u32) -> f64 {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);

        let pid = Pid::from_u32(pid);
        let pids = [pid];

        let update = if self.include_children {
            ProcessesToUpdate::All
        } else {
            ProcessesToUpdate::Some(&pids)
        };

        system.refresh_processes_specifics(update, true, ProcessRefreshKind::nothing().with_memory());

        let Some(process) = system.process(pid) else {
            log::debug!("process {} is gone, reporting sentinel", pid);
            return SENTINEL;
        };

        let mut bytes = process.memory();

        if self.include_children {
            bytes += children_memory(&system, pid);
        }

        bytes as f64 / TWO_20
    }
}

/// Sum the resident memory of every descendant of `root`.
///
/// Processes that vanished between refresh and lookup simply do not appear.
fn children_memory(system: &System, root: Pid) -> u64 {
    let mut total = 0;
    let mut visited = HashSet::from([root]);
    let mut frontier = vec![root];

    while let Some(parent) = frontier.pop() {
        for (pid, process) in system.processes() {
            if process.thread_kind().is_some() || process.parent() != Some(parent) {
                continue;
            }

            if visited.insert(*pid) {
                total += process.memory();
                frontier.push(*pid);
            }
        }
    }

    total
}

fn external_probe(pid: u32) -> f64 {
    let output = match Command::new("ps")
        .args(["v", "-p", &pid.to_string()])
        .output()
    {
        Ok(output) => output,
        Err(err) => {
            log::debug!("ps probe failed: {}", err);
            return SENTINEL;
        }
    };

    parse_ps_rss(&String::from_utf8_lossy(&output.stdout)).unwrap_or(SENTINEL)
}

/// Parse the `RSS` column (KiB) of `ps v` output into MiB.
pub(crate) fn parse_ps_rss(output: &str) -> Option<f64> {
    let mut lines = output.lines();

    let column = lines
        .next()?
        .split_whitespace()
        .position(|name| name == "RSS")?;

    let kib: f64 = lines.next()?.split_whitespace().nth(column)?.parse().ok()?;

    Some(kib / 1024.0)
}

/// Names like `<stdin>` or `<unknown>` do not refer to physical files.
pub(crate) fn is_synthetic(path: &Path) -> bool {
    let name = path.to_string_lossy();

    name.is_empty() || (name.starts_with('<') && name.ends_with('>'))
}

/// A source of memory readings for the line tracer.
pub trait Probe {
    /// Memory in MiB, attributed to `filename` when the source cares.
    fn probe(&self, filename: Option<&Path>) -> Result<f64>;
}

impl Probe for Sampler {
    fn probe(&self, filename: Option<&Path>) -> Result<f64> {
        self.sample(SampleTarget::Current, filename)
            .map(|measurement| measurement.mib)
    }
}

impl<F> Probe for F
where
    F: Fn(Option<&Path>) -> Result<f64>,
{
    fn probe(&self, filename: Option<&Path>) -> Result<f64> {
        self(filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_ps_output() {
        let out = "  PID TTY      STAT   TIME  MAJFL   TRS   DRS   RSS %MEM COMMAND\n\
                   4242 pts/0    S+     0:00      0  1234 56789  2048  0.1 sleep 10\n";

        assert_eq!(parse_ps_rss(out), Some(2.0));
        assert_eq!(parse_ps_rss("  PID TTY\n"), None);
        assert_eq!(parse_ps_rss(""), None);
    }

    #[test]
    fn synthetic_names() {
        assert!(is_synthetic(Path::new("<unknown>")));
        assert!(is_synthetic(Path::new("<ipython-input-1>")));
        assert!(is_synthetic(Path::new("")));
        assert!(!is_synthetic(Path::new("src/lib.rs")));
    }

    #[test]
    fn backend_names() {
        assert_eq!("psutil".parse::<Backend>(), Ok(Backend::ProcessTable));
        assert_eq!("posix".parse::<Backend>(), Ok(Backend::ExternalProbe));
        assert_eq!("tracemalloc".parse::<Backend>(), Ok(Backend::Snapshot));
        assert!("bogus".parse::<Backend>().is_err());
        assert_eq!(Backend::ExternalProbe.to_string(), "external-probe");
    }

    #[test]
    fn requested_backend_goes_first() {
        assert_eq!(choose_backend(None), Backend::ProcessTable);
        assert_eq!(
            choose_backend(Some(Backend::ProcessTable)),
            Backend::ProcessTable
        );

        #[cfg(unix)]
        assert_eq!(
            choose_backend(Some(Backend::ExternalProbe)),
            Backend::ExternalProbe
        );

        // no tracking allocator in the unit test binary
        assert_eq!(choose_backend(Some(Backend::Snapshot)), Backend::ProcessTable);
    }

    #[test]
    fn snapshot_needs_a_source_file() {
        let sampler = Sampler::with_backend(Backend::Snapshot);

        assert!(matches!(
            sampler.sample(SampleTarget::Current, None),
            Err(Error::UnknownSource(None))
        ));

        assert!(matches!(
            sampler.sample(SampleTarget::Current, Some(Path::new("<unknown>"))),
            Err(Error::UnknownSource(Some(_)))
        ));

        assert!(matches!(
            sampler.sample(SampleTarget::Current, Some(Path::new("src/lib.rs"))),
            Err(Error::BackendUnavailable(Backend::Snapshot))
        ));
    }

    #[test]
    fn external_probe_rejects_children() {
        let sampler = Sampler::with_backend(Backend::ExternalProbe).include_children(true);

        assert!(matches!(
            sampler.sample(SampleTarget::Current, None),
            Err(Error::ChildrenUnsupported(Backend::ExternalProbe))
        ));
    }

    #[test]
    fn snapshot_rejects_children() {
        let sampler = Sampler::with_backend(Backend::Snapshot).include_children(true);

        assert!(matches!(
            sampler.sample(SampleTarget::Current, Some(Path::new("src/lib.rs"))),
            Err(Error::ChildrenUnsupported(Backend::Snapshot))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn ps_backend_vanished_process_is_sentinel() {
        let sampler = Sampler::with_backend(Backend::ExternalProbe);

        let measurement = sampler
            .sample(SampleTarget::Pid(u32::MAX - 7), None)
            .unwrap();

        assert!(measurement.is_sentinel());
    }

    #[test]
    fn process_table_reads_current_process() {
        let sampler = Sampler::with_backend(Backend::ProcessTable).timestamps(true);

        let measurement = sampler.sample(SampleTarget::Current, None).unwrap();

        assert!(measurement.mib > 0.0);
        assert!(measurement.epoch_secs().is_some());
    }

    #[test]
    fn vanished_process_is_sentinel() {
        let sampler = Sampler::with_backend(Backend::ProcessTable);

        let measurement = sampler
            .sample(SampleTarget::Pid(u32::MAX - 7), None)
            .unwrap();

        assert!(measurement.is_sentinel());
    }
}
