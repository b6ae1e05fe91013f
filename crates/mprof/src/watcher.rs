//! Whole-process memory sampling over time.

use std::{
    any::Any,
    io::Write,
    panic::{self, AssertUnwindSafe},
    process::{Child, Command, ExitStatus},
    sync::mpsc::{self, RecvTimeoutError},
    thread,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};

use crate::{Backend, Error, Measurement, Result, SampleTarget, Sampler};

#[derive(Debug, Clone)]
pub struct WatchOptions {
    /// Time between two readings.
    pub interval: Duration,
    /// Stop after `timeout / interval` readings, [`watch_fn`] and
    /// [`watch_command`] also stop waiting for their target.
    pub timeout: Option<Duration>,
    /// Stop after this many readings, `timeout` wins when both are set.
    pub max_iterations: Option<usize>,
    pub include_children: bool,
    /// Keep only the largest reading.
    pub max_usage: bool,
    pub timestamps: bool,
    pub backend: Option<Backend>,
    /// Report a panicking callable as [`Error::TargetPanicked`] instead of
    /// returning the readings with no return value.
    pub propagate_panics: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(100),
            timeout: None,
            max_iterations: None,
            include_children: false,
            max_usage: false,
            timestamps: false,
            backend: None,
            propagate_panics: true,
        }
    }
}

impl WatchOptions {
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    pub fn include_children(mut self, flag: bool) -> Self {
        self.include_children = flag;
        self
    }

    pub fn max_usage(mut self, flag: bool) -> Self {
        self.max_usage = flag;
        self
    }

    pub fn timestamps(mut self, flag: bool) -> Self {
        self.timestamps = flag;
        self
    }

    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn propagate_panics(mut self, flag: bool) -> Self {
        self.propagate_panics = flag;
        self
    }

    /// The reading budget implied by `timeout` or `max_iterations`.
    pub fn iteration_limit(&self) -> Option<usize> {
        match self.timeout {
            Some(timeout) => {
                let readings = timeout.as_secs_f64() / self.interval.as_secs_f64();
                Some((readings.round() as usize).max(1))
            }
            None => self.max_iterations.map(|limit| limit.max(1)),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::InvalidOptions("interval must be greater than zero"));
        }

        Ok(())
    }

    fn sampler(&self, timestamps: bool) -> Sampler {
        Sampler::new(self.backend)
            .include_children(self.include_children)
            .timestamps(timestamps)
    }
}

/// Result of a watch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Usage {
    /// Every reading, in order.
    Series(Vec<Measurement>),
    /// The largest reading, see [`WatchOptions::max_usage`].
    Max(Measurement),
    /// Readings went to a stream, this many of them.
    Streamed(usize),
}

impl Usage {
    pub fn series(&self) -> Option<&[Measurement]> {
        match self {
            Usage::Series(series) => Some(series),
            _ => None,
        }
    }

    /// The largest reading in MiB.
    pub fn max(&self) -> Option<f64> {
        match self {
            Usage::Series(series) => series.iter().map(|m| m.mib).reduce(f64::max),
            Usage::Max(measurement) => Some(measurement.mib),
            Usage::Streamed(_) => None,
        }
    }
}

/// Readings of a watched callable plus its return value.
#[derive(Debug)]
pub struct Watched<R> {
    pub usage: Usage,
    /// `None` when the callable panicked and panics are not propagated, or
    /// when it was still running at the timeout.
    pub retval: Option<R>,
    /// The timeout passed before the callable returned.
    pub timed_out: bool,
}

struct Collector {
    max_usage: bool,
    limit: Option<usize>,
    series: Vec<Measurement>,
    max: Option<Measurement>,
    count: usize,
}

impl Collector {
    fn new(max_usage: bool, limit: Option<usize>) -> Self {
        Self {
            max_usage,
            limit,
            series: vec![],
            max: None,
            count: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.limit.is_some_and(|limit| self.count >= limit)
    }

    fn push(&mut self, measurement: Measurement) {
        self.count += 1;

        if self.max_usage {
            if self.max.map_or(true, |max| measurement.mib > max.mib) {
                self.max = Some(measurement);
            }
        } else {
            self.series.push(measurement);
        }
    }

    fn finish(self) -> Usage {
        match (self.max_usage, self.max) {
            (true, Some(max)) => Usage::Max(max),
            (true, None) => Usage::Series(vec![]),
            (false, _) => Usage::Series(self.series),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Run `f` on a worker thread while this thread samples the process.
///
/// A reading is taken before `f` starts, so sampler errors are reported
/// without running it. Then one reading per interval until `f` returns and
/// a last one, the iteration limit caps the total.
///
/// With a timeout, control returns once it passes even if `f` is still
/// running: the readings so far are returned with no return value and the
/// worker thread is left to finish on its own.
pub fn watch_fn<F, R>(f: F, options: &WatchOptions) -> Result<Watched<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    options.validate()?;

    let sampler = options.sampler(options.timestamps);
    let mut collector = Collector::new(options.max_usage, options.iteration_limit());

    collector.push(sampler.sample(SampleTarget::Current, None)?);

    let deadline = options.timeout.map(|timeout| Instant::now() + timeout);
    let (done_sender, done_receiver) = mpsc::channel();

    let worker = thread::Builder::new()
        .name("mprof-target".into())
        .spawn(move || {
            // the receiver is gone once the watch timed out
            _ = done_sender.send(panic::catch_unwind(AssertUnwindSafe(f)));
        })?;

    let outcome = loop {
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now());

                if left.is_zero() {
                    break None;
                }

                left.min(options.interval)
            }
            None => options.interval,
        };

        match done_receiver.recv_timeout(wait) {
            Ok(outcome) => break Some(outcome),
            Err(RecvTimeoutError::Timeout) => {
                if !collector.is_full() {
                    collector.push(sampler.sample(SampleTarget::Current, None)?);
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                break Some(Err(Box::new("watched callable vanished") as Box<dyn Any + Send>));
            }
        }
    };

    let Some(outcome) = outcome else {
        log::warn!(
            "watched callable still running after {:?}, returning partial readings",
            options.timeout.unwrap_or_default()
        );

        return Ok(Watched {
            usage: collector.finish(),
            retval: None,
            timed_out: true,
        });
    };

    // the worker sent its outcome, it is about to exit
    _ = worker.join();

    if !collector.is_full() {
        collector.push(sampler.sample(SampleTarget::Current, None)?);
    }

    let usage = collector.finish();

    match outcome {
        Ok(retval) => Ok(Watched {
            usage,
            retval: Some(retval),
            timed_out: false,
        }),
        Err(payload) => {
            let message = panic_message(payload.as_ref());

            if options.propagate_panics {
                Err(Error::TargetPanicked(message))
            } else {
                log::warn!("watched callable panicked: {}", message);

                Ok(Watched {
                    usage,
                    retval: None,
                    timed_out: false,
                })
            }
        }
    }
}

/// Sample a running child until it exits or the iteration limit is reached.
///
/// With a `stream`, every reading is written right away as
/// `MEM <MiB> <epoch seconds>` and only their number is returned.
pub fn watch_child(
    child: &mut Child,
    options: &WatchOptions,
    mut stream: Option<&mut dyn Write>,
) -> Result<Usage> {
    options.validate()?;

    if stream.is_some() && options.max_usage {
        return Err(Error::InvalidOptions(
            "streaming and max_usage are mutually exclusive",
        ));
    }

    let sampler = options.sampler(options.timestamps || stream.is_some());
    let target = SampleTarget::Pid(child.id());
    let mut collector = Collector::new(options.max_usage, options.iteration_limit());

    loop {
        let measurement = sampler.sample(target, None)?;

        match stream.as_deref_mut() {
            Some(stream) => {
                writeln!(
                    stream,
                    "MEM {:.6} {:.4}",
                    measurement.mib,
                    measurement.epoch_secs().unwrap_or_default()
                )?;

                collector.count += 1;
            }
            None => collector.push(measurement),
        }

        if child.try_wait()?.is_some() || collector.is_full() {
            break;
        }

        thread::sleep(options.interval);
    }

    match stream {
        Some(stream) => {
            stream.flush()?;
            Ok(Usage::Streamed(collector.count))
        }
        None => Ok(collector.finish()),
    }
}

/// Spawn `command` and [`watch_child`] it.
///
/// A child still running when the watch ends (timeout or iteration limit)
/// is killed, it is always reaped before returning.
pub fn watch_command(
    mut command: Command,
    options: &WatchOptions,
    stream: Option<&mut dyn Write>,
) -> Result<(Usage, ExitStatus)> {
    let program = command.get_program().to_string_lossy().into_owned();

    let mut child = command
        .spawn()
        .map_err(|source| Error::Spawn { program, source })?;

    let usage = watch_child(&mut child, options, stream);

    if child.try_wait()?.is_none() {
        log::warn!("process {} still running after the watch, killing it", child.id());
        child.kill()?;
    }

    let status = child.wait()?;

    Ok((usage?, status))
}

/// Sample a process with no liveness control.
///
/// Takes exactly one reading unless the options set a timeout or an
/// iteration limit.
pub fn watch_pid(target: SampleTarget, options: &WatchOptions) -> Result<Usage> {
    options.validate()?;

    let sampler = options.sampler(options.timestamps);
    let readings = options.iteration_limit().unwrap_or(1);
    let mut collector = Collector::new(options.max_usage, Some(readings));

    while !collector.is_full() {
        collector.push(sampler.sample(target, None)?);

        if !collector.is_full() {
            thread::sleep(options.interval);
        }
    }

    Ok(collector.finish())
}
