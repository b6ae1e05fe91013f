//! Per-thread instrumentation runtime.
//!
//! Instrumented code reports its execution with [`enter`] (a `call` event,
//! plus a `return` event when the returned [`FrameGuard`] drops) and [`step`]
//! (a `line` event for the innermost frame). Each event is delivered to the
//! hook on top of the thread's hook stack, hooks chain to the one they
//! displaced.
//!
//! Frames live on a per-thread stack. Futures swap a [`FrameStack`] of their
//! own in while they are polled, see [`isolate`].

use std::{
    cell::{Cell, RefCell},
    future::Future,
    marker::PhantomData,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use crate::CodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Call,
    Line,
    Return,
}

/// The innermost execution frame at the time of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub code: CodeId,
    /// Line about to run for `line` events, the entry line for `call` events
    /// and the last line run for `return` events.
    pub line: u32,
    /// Number of live frames below this one.
    pub depth: usize,
}

/// Receives trace events, see [`push_hook`].
pub trait TraceHook {
    fn on_event(&self, frame: &Frame, event: Event);

    /// `removed` was popped from under this hook. A hook chaining to
    /// `removed` must chain to `replacement` from now on.
    fn rechain(&self, removed: &Rc<dyn TraceHook>, replacement: Option<Rc<dyn TraceHook>>) {
        _ = (removed, replacement);
    }
}

struct LiveFrame {
    serial: u64,
    frame: Frame,
}

thread_local! {
    static HOOKS: RefCell<Vec<Rc<dyn TraceHook>>> = const { RefCell::new(Vec::new()) };
    static FRAMES: RefCell<Vec<LiveFrame>> = const { RefCell::new(Vec::new()) };
    static SERIAL: Cell<u64> = const { Cell::new(0) };
}

/// Identity comparison of two hooks.
pub fn same_hook(a: &Rc<dyn TraceHook>, b: &Rc<dyn TraceHook>) -> bool {
    Rc::as_ptr(a) as *const () == Rc::as_ptr(b) as *const ()
}

/// Install `hook` on top of the hook stack.
///
/// Returns the hook it displaced, which the new hook is expected to call
/// after its own handling.
pub fn push_hook(hook: Rc<dyn TraceHook>) -> Option<Rc<dyn TraceHook>> {
    HOOKS.with(|hooks| {
        let mut hooks = hooks.borrow_mut();
        let previous = hooks.last().cloned();
        hooks.push(hook);
        previous
    })
}

/// Remove the most recently pushed entry of `hook`.
///
/// When hooks were pushed above it, the one right above is rechained to the
/// hook right below. Returns false if `hook` was not installed.
pub fn pop_hook(hook: &Rc<dyn TraceHook>) -> bool {
    let removed = HOOKS.with(|hooks| {
        let mut hooks = hooks.borrow_mut();

        let index = hooks
            .iter()
            .rposition(|installed| same_hook(installed, hook))?;

        let removed = hooks.remove(index);
        let above = hooks.get(index).cloned();
        let below = index.checked_sub(1).and_then(|below| hooks.get(below)).cloned();

        Some((removed, above, below))
    });

    let Some((removed, above, below)) = removed else {
        return false;
    };

    // called with the stack released, hooks may inspect it
    if let Some(above) = above {
        log::warn!("trace hook removed out of order, rechaining the hook above it");
        above.rechain(&removed, below);
    }

    true
}

/// The hook receiving events right now.
pub fn current_hook() -> Option<Rc<dyn TraceHook>> {
    HOOKS.with(|hooks| hooks.borrow().last().cloned())
}

/// Number of installed hooks.
pub fn hook_depth() -> usize {
    HOOKS.with(|hooks| hooks.borrow().len())
}

fn dispatch(frame: &Frame, event: Event) {
    // clone out of the slot so hooks may push or pop while handling
    if let Some(hook) = current_hook() {
        hook.on_event(frame, event);
    }
}

/// Enter a frame of `code` at `line`, firing a `call` event.
///
/// The `return` event fires when the guard drops.
pub fn enter(code: CodeId, line: u32) -> FrameGuard {
    let serial = SERIAL.with(|serial| {
        let next = serial.get() + 1;
        serial.set(next);
        next
    });

    let frame = FRAMES.with(|frames| {
        let mut frames = frames.borrow_mut();

        let frame = Frame {
            code,
            line,
            depth: frames.len(),
        };

        frames.push(LiveFrame { serial, frame });

        frame
    });

    dispatch(&frame, Event::Call);

    FrameGuard {
        serial,
        _not_send: PhantomData,
    }
}

/// Move the innermost frame to `line`, firing a `line` event.
///
/// Does nothing outside of any frame.
pub fn step(line: u32) {
    let frame = FRAMES.with(|frames| {
        frames.borrow_mut().last_mut().map(|live| {
            live.frame.line = line;
            live.frame
        })
    });

    if let Some(frame) = frame {
        dispatch(&frame, Event::Line);
    }
}

/// The innermost live frame.
pub fn current_frame() -> Option<Frame> {
    FRAMES.with(|frames| frames.borrow().last().map(|live| live.frame))
}

/// A frame stack detached from the thread, see [`swap_frames`].
///
/// Suspendable code keeps its frames in one of these while it is not
/// running, so frames of interleaved tasks never mix on the thread's stack.
#[derive(Default)]
pub struct FrameStack(Vec<LiveFrame>);

impl FrameStack {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Exchange the thread's frame stack with `stack`.
pub fn swap_frames(stack: &mut FrameStack) {
    FRAMES.with(|frames| std::mem::swap(&mut *frames.borrow_mut(), &mut stack.0));
}

/// Runs with a [`FrameStack`] swapped in, swaps it back out on drop.
pub(crate) struct FrameScope<'a> {
    stack: &'a mut FrameStack,
}

impl<'a> FrameScope<'a> {
    pub(crate) fn new(stack: &'a mut FrameStack) -> Self {
        swap_frames(stack);
        Self { stack }
    }
}

impl Drop for FrameScope<'_> {
    fn drop(&mut self) {
        swap_frames(self.stack);
    }
}

/// Give an instrumented future a frame stack of its own.
///
/// [`LineProfiler::wrap_future`](crate::LineProfiler::wrap_future) does this
/// already, use it for instrumented futures that are not profiled but run
/// interleaved with profiled ones.
pub fn isolate<F: Future>(future: F) -> Isolated<F> {
    Isolated {
        future: Box::pin(future),
        frames: FrameStack::default(),
    }
}

/// Future returned by [`isolate`].
pub struct Isolated<F> {
    future: Pin<Box<F>>,
    frames: FrameStack,
}

impl<F: Future> Future for Isolated<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _scope = FrameScope::new(&mut this.frames);

        this.future.as_mut().poll(cx)
    }
}

/// Keeps a frame alive, see [`enter`].
#[must_use = "the frame returns as soon as the guard drops"]
pub struct FrameGuard {
    serial: u64,
    _not_send: PhantomData<*const ()>,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        let frame = FRAMES.with(|frames| {
            frames
                .borrow()
                .iter()
                .rfind(|live| live.serial == self.serial)
                .map(|live| live.frame)
        });

        let Some(frame) = frame else {
            return;
        };

        dispatch(&frame, Event::Return);

        FRAMES.with(|frames| {
            let mut frames = frames.borrow_mut();

            if let Some(index) = frames.iter().rposition(|live| live.serial == self.serial) {
                frames.remove(index);
            }
        });
    }
}
