use std::{future::Future, io::Write};

use crate::{
    show_results, Backend, CodeUnit, LineProfiler, PauseBreakpoint, Result, Sampler, TimeStamper,
};

/// Options of the [`profile`] entry points.
pub struct ProfileConfig {
    /// Requested sampler backend, falls back when unavailable.
    pub backend: Option<Backend>,
    /// Digits after the decimal point in the report.
    pub precision: usize,
    /// Pause at the first line running above this many MiB instead of
    /// recording statistics.
    pub max_mem: Option<f64>,
    pub include_children: bool,
    /// Report destination, stdout when `None`.
    pub stream: Option<Box<dyn Write>>,
    /// Record start/end stamps instead of per-line statistics.
    pub timestamp: bool,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            backend: None,
            precision: 1,
            max_mem: None,
            include_children: false,
            stream: None,
            timestamp: false,
        }
    }
}

impl ProfileConfig {
    pub fn backend(mut self, backend: Backend) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn precision(mut self, precision: usize) -> Self {
        self.precision = precision;
        self
    }

    pub fn max_mem(mut self, max_mem: f64) -> Self {
        self.max_mem = Some(max_mem);
        self
    }

    pub fn include_children(mut self, flag: bool) -> Self {
        self.include_children = flag;
        self
    }

    pub fn stream<W: Write + 'static>(mut self, stream: W) -> Self {
        self.stream = Some(Box::new(stream));
        self
    }

    pub fn timestamp(mut self, flag: bool) -> Self {
        self.timestamp = flag;
        self
    }

    fn sampler(&self) -> Sampler {
        Sampler::new(self.backend).include_children(self.include_children)
    }

    fn line_profiler(&self) -> LineProfiler {
        match self.max_mem {
            Some(max_mem) => LineProfiler::with_threshold(self.sampler(), max_mem, PauseBreakpoint),
            None => LineProfiler::new(self.sampler()),
        }
    }

    fn write_with(&mut self, render: impl FnOnce(&mut dyn Write) -> std::io::Result<()>) -> Result<()> {
        match self.stream.as_deref_mut() {
            Some(stream) => {
                render(stream)?;
                stream.flush()?;
            }
            None => render(&mut std::io::stdout().lock())?,
        }

        Ok(())
    }

    fn report(&mut self, profiler: &LineProfiler) -> Result<()> {
        if let Some(err) = profiler.take_error() {
            return Err(err);
        }

        let precision = self.precision;

        self.write_with(|stream| show_results(&*profiler.code_map(), stream, precision))
    }
}

/// Profile one call of `f`, the body of `unit`, then write the report.
pub fn profile<R>(unit: &CodeUnit, mut config: ProfileConfig, f: impl FnOnce() -> R) -> Result<R> {
    if config.timestamp {
        let stamper = TimeStamper::new(config.sampler());
        let retval = stamper.time(unit.name(), f)?;

        config.write_with(|stream| stamper.show_results(stream))?;

        return Ok(retval);
    }

    let profiler = config.line_profiler();

    profiler.add_function(unit);

    let retval = profiler.run(f);

    config.report(&profiler)?;

    Ok(retval)
}

/// [`profile`] for a future, tracing only while it is being polled.
pub async fn profile_future<F>(unit: &CodeUnit, mut config: ProfileConfig, future: F) -> Result<F::Output>
where
    F: Future,
{
    if config.timestamp {
        let stamper = TimeStamper::new(config.sampler());
        let retval = {
            let _guard = stamper.stamp(unit.name())?;
            future.await
        };

        config.write_with(|stream| stamper.show_results(stream))?;

        return Ok(retval);
    }

    let profiler = config.line_profiler();

    profiler.add_function(unit);

    let retval = profiler.wrap_future(future).await;

    config.report(&profiler)?;

    Ok(retval)
}
