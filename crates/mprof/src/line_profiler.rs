use std::{
    cell::{Cell, Ref, RefCell},
    fmt::Display,
    future::Future,
    io::{BufRead, Write},
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use crate::{
    trace::{self, Event, Frame, FrameScope, FrameStack, TraceHook},
    Backend, CodeMap, CodeUnit, Error, Probe, Sampler,
};

/// Memory crossed the ceiling of a threshold profiler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breach {
    /// The frame running when the reading was taken.
    pub frame: Frame,
    pub current: f64,
    pub ceiling: f64,
}

impl Display for Breach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Current memory {:.2} MiB exceeded the maximum of {:.2} MiB",
            self.current, self.ceiling
        )
    }
}

/// Invoked by a threshold profiler when memory crosses its ceiling.
pub trait Breakpoint {
    fn hit(&mut self, breach: &Breach);
}

impl<F> Breakpoint for F
where
    F: FnMut(&Breach),
{
    fn hit(&mut self, breach: &Breach) {
        self(breach)
    }
}

/// Stops the traced thread until a line is entered on stdin.
pub struct PauseBreakpoint;

impl Breakpoint for PauseBreakpoint {
    fn hit(&mut self, breach: &Breach) {
        let mut stderr = std::io::stderr().lock();

        _ = writeln!(stderr, "{}", breach);
        _ = writeln!(
            stderr,
            "Stepping into the debugger at line {} (depth {}), press enter to continue",
            breach.frame.line, breach.frame.depth
        );

        let mut input = String::new();
        _ = std::io::stdin().lock().read_line(&mut input);
    }
}

enum Mode {
    Record,
    Threshold {
        ceiling: f64,
        breakpoint: Box<dyn Breakpoint>,
    },
}

struct Inner<P> {
    code_map: RefCell<CodeMap<P>>,
    mode: RefCell<Mode>,
    enable_count: Cell<usize>,
    previous: RefCell<Option<Rc<dyn TraceHook>>>,
    prevlines: RefCell<Vec<u32>>,
    prev_lineno: Cell<Option<u32>>,
    error: RefCell<Option<Error>>,
}

impl<P: Probe> Inner<P> {
    fn record(&self, code: crate::CodeId, line: u32) {
        let result = self
            .code_map
            .borrow_mut()
            .record(code, line, self.prev_lineno.get());

        if let Err(err) = result {
            log::error!("memory sampling failed, recording stopped: {}", err);
            *self.error.borrow_mut() = Some(err);
        }
    }

    fn trace_memory_usage(&self, frame: &Frame, event: Event) {
        if self.error.borrow().is_some() {
            return;
        }

        match event {
            Event::Call => self.prevlines.borrow_mut().push(frame.line),
            Event::Line => {
                let current = {
                    let mut prevlines = self.prevlines.borrow_mut();

                    match prevlines.last_mut() {
                        Some(top) => Some(std::mem::replace(top, frame.line)),
                        None => {
                            // frame entered while tracing was off
                            prevlines.push(frame.line);
                            None
                        }
                    }
                };

                if let Some(lineno) = current {
                    self.record(frame.code, lineno);
                    self.prev_lineno.set(Some(lineno));
                }
            }
            Event::Return => {
                let lineno = self.prevlines.borrow_mut().pop().unwrap_or(frame.line);

                self.record(frame.code, lineno);
                self.prev_lineno.set(Some(lineno));
            }
        }
    }

    fn trace_max_mem(&self, frame: &Frame, event: Event, ceiling: f64) -> Option<Breach> {
        if event == Event::Call {
            return None;
        }

        let reading = {
            let code_map = self.code_map.borrow();
            code_map.probe().probe(code_map.file_of(frame.code))
        };

        match reading {
            Ok(current) if current >= ceiling => Some(Breach {
                frame: *frame,
                current,
                ceiling,
            }),
            Ok(_) => None,
            Err(err) => {
                log::error!("memory sampling failed, threshold checks stopped: {}", err);
                *self.error.borrow_mut() = Some(err);
                None
            }
        }
    }

    fn check_threshold(&self, frame: &Frame, event: Event, ceiling: f64) {
        if self.error.borrow().is_some() {
            return;
        }

        let Some(breach) = self.trace_max_mem(frame, event, ceiling) else {
            return;
        };

        log::warn!("{}", breach);

        // a breakpoint running instrumented code must not re-enter itself
        if let Ok(mut mode) = self.mode.try_borrow_mut() {
            if let Mode::Threshold { breakpoint, .. } = &mut *mode {
                breakpoint.hit(&breach);
            }
        }
    }
}

impl<P: Probe> TraceHook for Inner<P> {
    fn on_event(&self, frame: &Frame, event: Event) {
        // a disabled profiler still chained to by a later one only forwards
        if self.enable_count.get() > 0 && self.code_map.borrow().contains(frame.code) {
            let ceiling = match self.mode.try_borrow().as_deref() {
                Ok(Mode::Record) => Ok(None),
                Ok(Mode::Threshold { ceiling, .. }) => Ok(Some(*ceiling)),
                Err(_) => Err(()),
            };

            match ceiling {
                Ok(None) => self.trace_memory_usage(frame, event),
                Ok(Some(ceiling)) => self.check_threshold(frame, event, ceiling),
                // re-entered from a breakpoint
                Err(()) => {}
            }
        }

        let previous = self.previous.borrow().clone();

        if let Some(previous) = previous {
            previous.on_event(frame, event);
        }
    }

    fn rechain(&self, removed: &Rc<dyn TraceHook>, replacement: Option<Rc<dyn TraceHook>>) {
        let mut previous = self.previous.borrow_mut();

        if previous
            .as_ref()
            .is_some_and(|previous| trace::same_hook(previous, removed))
        {
            *previous = replacement;
        }
    }
}

/// A profiler that records the amount of memory for each line.
///
/// Cloning yields another handle to the same profiler.
pub struct LineProfiler<P: Probe + 'static = Sampler> {
    inner: Rc<Inner<P>>,
}

impl<P: Probe + 'static> Clone for LineProfiler<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl LineProfiler<Sampler> {
    /// Create a recording profiler reading process memory with `backend`.
    pub fn with_backend(backend: Option<Backend>, include_children: bool) -> Self {
        Self::new(Sampler::new(backend).include_children(include_children))
    }
}

impl<P: Probe + 'static> LineProfiler<P> {
    /// Create a profiler recording per-line statistics.
    pub fn new(probe: P) -> Self {
        Self::with_mode(probe, Mode::Record)
    }

    /// Create a profiler that records nothing and calls `breakpoint` whenever
    /// a registered line runs with memory at or above `ceiling` MiB.
    pub fn with_threshold<B>(probe: P, ceiling: f64, breakpoint: B) -> Self
    where
        B: Breakpoint + 'static,
    {
        Self::with_mode(
            probe,
            Mode::Threshold {
                ceiling,
                breakpoint: Box::new(breakpoint),
            },
        )
    }

    fn with_mode(probe: P, mode: Mode) -> Self {
        Self {
            inner: Rc::new(Inner {
                code_map: RefCell::new(CodeMap::new(probe)),
                mode: RefCell::new(mode),
                enable_count: Cell::new(0),
                previous: RefCell::new(None),
                prevlines: RefCell::new(vec![]),
                prev_lineno: Cell::new(None),
                error: RefCell::new(None),
            }),
        }
    }

    /// Record line profiling information for `unit`.
    pub fn add_function(&self, unit: &CodeUnit) -> bool {
        self.inner.code_map.borrow_mut().register(unit)
    }

    pub fn code_map(&self) -> Ref<'_, CodeMap<P>> {
        self.inner.code_map.borrow()
    }

    /// Returns the sampling error that stopped recording, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.inner.error.borrow_mut().take()
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enable_count.get() > 0
    }

    pub fn enable_count(&self) -> usize {
        self.inner.enable_count.get()
    }

    /// Enable the profiler if it hasn't been enabled before.
    pub fn enable_by_count(&self) {
        if self.inner.enable_count.get() == 0 {
            self.enable();
        }

        self.inner.enable_count.set(self.inner.enable_count.get() + 1);
    }

    /// Disable the profiler if the number of disable requests matches the
    /// number of enable requests.
    pub fn disable_by_count(&self) {
        self.release(true);
    }

    fn release(&self, end_session: bool) {
        let count = self.inner.enable_count.get();

        if count == 0 {
            return;
        }

        self.inner.enable_count.set(count - 1);

        if count == 1 {
            self.disable();

            if end_session {
                self.inner.prevlines.borrow_mut().clear();
            }
        }
    }

    fn hook(&self) -> Rc<dyn TraceHook> {
        self.inner.clone()
    }

    fn enable(&self) {
        *self.inner.previous.borrow_mut() = trace::push_hook(self.hook());
    }

    fn disable(&self) {
        trace::pop_hook(&self.hook());
        self.inner.previous.borrow_mut().take();
    }

    /// Enable by count until the guard drops.
    pub fn enabled(&self) -> EnableGuard<P> {
        self.enable_by_count();

        EnableGuard {
            profiler: self.clone(),
        }
    }

    /// Run `f` with the profiler enabled.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enabled();
        f()
    }

    /// Wrap `f` so that every call runs with the profiler enabled.
    pub fn wrap<A, R, F>(&self, f: F) -> impl Fn(A) -> R
    where
        F: Fn(A) -> R,
    {
        let profiler = self.clone();

        move |args| profiler.run(|| f(args))
    }

    /// Wrap a future so the profiler is enabled around each poll only.
    ///
    /// Time spent suspended, while other tasks run, is never traced. The
    /// future keeps its own frames and line stack across suspensions.
    pub fn wrap_future<F: Future>(&self, future: F) -> Profiled<F, P> {
        Profiled {
            future: Box::pin(future),
            profiler: self.clone(),
            frames: FrameStack::default(),
            lines: LineState::default(),
        }
    }
}

#[must_use = "the profiler is disabled as soon as the guard drops"]
pub struct EnableGuard<P: Probe + 'static> {
    profiler: LineProfiler<P>,
}

impl<P: Probe + 'static> Drop for EnableGuard<P> {
    fn drop(&mut self) {
        self.profiler.disable_by_count();
    }
}

/// Future returned by [`LineProfiler::wrap_future`].
pub struct Profiled<F, P: Probe + 'static> {
    future: Pin<Box<F>>,
    profiler: LineProfiler<P>,
    frames: FrameStack,
    lines: LineState,
}

/// Line stack and previous line of one task.
#[derive(Default)]
struct LineState {
    prevlines: Vec<u32>,
    prev_lineno: Option<u32>,
}

impl LineState {
    fn swap<P>(&mut self, inner: &Inner<P>) {
        std::mem::swap(&mut *inner.prevlines.borrow_mut(), &mut self.prevlines);
        self.prev_lineno = inner.prev_lineno.replace(self.prev_lineno);
    }
}

/// One poll of a [`Profiled`] future: the profiler is enabled and the
/// future's frames and line state are swapped in.
struct PollScope<'a, P: Probe + 'static> {
    profiler: &'a LineProfiler<P>,
    lines: &'a mut LineState,
    _frames: FrameScope<'a>,
}

impl<'a, P: Probe + 'static> PollScope<'a, P> {
    fn new(profiler: &'a LineProfiler<P>, frames: &'a mut FrameStack, lines: &'a mut LineState) -> Self {
        profiler.enable_by_count();
        lines.swap(&profiler.inner);

        Self {
            profiler,
            lines,
            _frames: FrameScope::new(frames),
        }
    }
}

impl<P: Probe + 'static> Drop for PollScope<'_, P> {
    fn drop(&mut self) {
        self.lines.swap(&self.profiler.inner);
        self.profiler.release(false);
    }
}

impl<F: Future, P: Probe + 'static> Future for Profiled<F, P> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let poll = {
            let _scope = PollScope::new(&this.profiler, &mut this.frames, &mut this.lines);

            this.future.as_mut().poll(cx)
        };

        if poll.is_ready() {
            this.lines = LineState::default();
        }

        poll
    }
}
