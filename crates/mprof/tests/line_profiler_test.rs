mod common;

use std::{
    cell::RefCell,
    future::Future,
    path::Path,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use common::{source_file, Heap, ALLOC_FREE, LOOPED, NESTED};
use hala_mprof::{trace, Breach, CodeUnit, Error, LineProfiler};

fn alloc_free(unit: &CodeUnit, heap: &Heap) {
    let _frame = trace::enter(unit.id(), 1);

    trace::step(2);
    heap.alloc(10.0);

    trace::step(3);
    heap.alloc(20.0);

    trace::step(4);
    heap.free(20.0);
}

fn looped(unit: &CodeUnit, heap: &Heap) {
    let _frame = trace::enter(unit.id(), 1);

    for i in 0..3 {
        trace::step(2);

        if i > 0 {
            // the previous `c` goes away when it is rebound
            heap.free(50.0);
        }

        trace::step(3);
        heap.alloc(50.0);
    }
}

fn outer(outer_unit: &CodeUnit, inner_unit: &CodeUnit, heap: &Heap) {
    let _frame = trace::enter(outer_unit.id(), 1);

    trace::step(2);
    trace::step(5);

    {
        let _inner = trace::enter(inner_unit.id(), 2);

        trace::step(3);
        heap.alloc(30.0);
    }

    trace::step(6);
}

#[test]
fn increments_follow_allocations() {
    _ = pretty_env_logger::try_init();

    let file = source_file(ALLOC_FREE);
    let unit = CodeUnit::new("alloc_free", file.path(), 1);
    let heap = Heap::new(100.0);
    let profiler = LineProfiler::new(heap.clone());

    assert!(profiler.add_function(&unit));

    profiler.run(|| alloc_free(&unit, &heap));

    let code_map = profiler.code_map();
    let stat = |line| *code_map.stat(unit.id(), line).unwrap();

    assert_eq!(stat(2).increment, 10.0);
    assert_eq!(stat(3).increment, 20.0);
    assert_eq!(stat(3).level, 130.0);
    assert_eq!(stat(4).increment, -20.0);
    assert_eq!(stat(3).increment + stat(4).increment, 0.0);
    assert!(code_map.stat(unit.id(), 5).is_none());
}

#[test]
fn repeated_lines_keep_the_largest_increment() {
    let file = source_file(LOOPED);
    let unit = CodeUnit::new("looped", file.path(), 1);
    let heap = Heap::new(100.0);
    let profiler = LineProfiler::new(heap.clone());

    profiler.add_function(&unit);
    profiler.run(|| looped(&unit, &heap));

    let code_map = profiler.code_map();
    let stat = code_map.stat(unit.id(), 3).unwrap();

    assert_eq!(stat.occurrences, 3);
    assert_eq!(stat.increment, 50.0);
    assert_eq!(stat.level, 150.0);
}

#[test]
fn nested_units_report_in_the_outer_table() {
    let file = source_file(NESTED);
    let inner = CodeUnit::new("outer::{closure}", file.path(), 2);
    let unit = CodeUnit::new("outer", file.path(), 1).with_nested(inner.clone());
    let heap = Heap::new(100.0);
    let profiler = LineProfiler::new(heap.clone());

    profiler.add_function(&unit);

    // registered through its parent
    assert!(!profiler.add_function(&inner));

    profiler.run(|| outer(&unit, &inner, &heap));

    let code_map = profiler.code_map();
    let blocks = code_map.iter().collect::<Vec<_>>();

    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].name(), "outer");
    assert_eq!(blocks[0].lines().len(), 7);

    let (_, stat) = blocks[0].lines().nth(2).unwrap();

    assert_eq!(stat.unwrap().increment, 30.0);
    assert_eq!(code_map.stat(unit.id(), 5).unwrap().increment, 0.0);
}

#[test]
fn unregistered_code_is_not_measured() {
    let file = source_file(ALLOC_FREE);
    let unit = CodeUnit::new("alloc_free", file.path(), 1);
    let heap = Heap::new(100.0);
    let profiler = LineProfiler::new(heap.clone());

    profiler.run(|| alloc_free(&unit, &heap));

    assert_eq!(heap.reads(), 0);
    assert_eq!(profiler.code_map().iter().count(), 0);
}

#[test]
fn disabled_profiler_is_not_measured() {
    let file = source_file(ALLOC_FREE);
    let unit = CodeUnit::new("alloc_free", file.path(), 1);
    let heap = Heap::new(100.0);
    let profiler = LineProfiler::new(heap.clone());

    profiler.add_function(&unit);

    alloc_free(&unit, &heap);

    assert_eq!(heap.reads(), 0);
    assert!(profiler.code_map().stat(unit.id(), 2).is_none());
}

#[test]
fn enable_is_reference_counted() {
    let profiler = LineProfiler::new(Heap::default());

    assert_eq!(trace::hook_depth(), 0);

    profiler.enable_by_count();
    profiler.enable_by_count();

    assert_eq!(profiler.enable_count(), 2);
    assert_eq!(trace::hook_depth(), 1);

    profiler.disable_by_count();

    assert!(profiler.is_enabled());
    assert_eq!(trace::hook_depth(), 1);

    profiler.disable_by_count();

    assert!(!profiler.is_enabled());
    assert_eq!(trace::hook_depth(), 0);

    // unbalanced disable is a no-op
    profiler.disable_by_count();

    assert_eq!(profiler.enable_count(), 0);
}

#[test]
fn stacked_profilers_both_see_their_code() {
    let file_a = source_file(ALLOC_FREE);
    let file_b = source_file(LOOPED);
    let unit_a = CodeUnit::new("alloc_free", file_a.path(), 1);
    let unit_b = CodeUnit::new("looped", file_b.path(), 1);
    let heap = Heap::new(100.0);

    let outer = LineProfiler::new(heap.clone());
    let inner = LineProfiler::new(heap.clone());

    outer.add_function(&unit_a);
    inner.add_function(&unit_b);

    outer.run(|| {
        inner.run(|| {
            assert_eq!(trace::hook_depth(), 2);

            alloc_free(&unit_a, &heap);
            looped(&unit_b, &heap);
        });

        assert_eq!(trace::hook_depth(), 1);
    });

    assert!(outer.code_map().stat(unit_a.id(), 3).is_some());
    assert!(outer.code_map().stat(unit_b.id(), 3).is_none());
    assert!(inner.code_map().stat(unit_b.id(), 3).is_some());
    assert!(inner.code_map().stat(unit_a.id(), 3).is_none());
}

#[test]
fn wrapped_functions_run_enabled() {
    let profiler = LineProfiler::new(Heap::default());
    let wrapped = profiler.wrap(|x: u32| {
        assert_eq!(trace::hook_depth(), 1);
        x + 1
    });

    assert_eq!(wrapped(1), 2);
    assert_eq!(wrapped(2), 3);
    assert_eq!(trace::hook_depth(), 0);
}

#[test]
fn threshold_calls_the_breakpoint() {
    let file = source_file(ALLOC_FREE);
    let unit = CodeUnit::new("alloc_free", file.path(), 1);
    let heap = Heap::new(100.0);
    let breaches = Rc::new(RefCell::new(Vec::<Breach>::new()));

    let profiler = LineProfiler::with_threshold(heap.clone(), 105.0, {
        let breaches = breaches.clone();
        move |breach: &Breach| breaches.borrow_mut().push(*breach)
    });

    profiler.add_function(&unit);
    profiler.run(|| alloc_free(&unit, &heap));

    let breaches = breaches.borrow();

    // lines 3 and 4 run above the ceiling, and so does the return
    assert_eq!(breaches.len(), 3);
    assert_eq!(breaches[0].frame.line, 3);
    assert_eq!(breaches[0].current, 110.0);
    assert_eq!(breaches[1].frame.line, 4);
    assert_eq!(breaches[1].current, 130.0);
    assert_eq!(breaches[2].current, 110.0);
    assert_eq!(breaches[0].ceiling, 105.0);
    assert_eq!(
        breaches[1].to_string(),
        "Current memory 130.00 MiB exceeded the maximum of 105.00 MiB"
    );

    assert_eq!(profiler.code_map().iter().count(), 0);
}

#[test]
fn sampling_errors_stop_recording() {
    let file = source_file(ALLOC_FREE);
    let unit = CodeUnit::new("alloc_free", file.path(), 1);
    let heap = Heap::new(100.0);

    let profiler =
        LineProfiler::new(|_: Option<&Path>| -> hala_mprof::Result<f64> { Err(Error::UnknownSource(None)) });

    profiler.add_function(&unit);
    profiler.run(|| alloc_free(&unit, &heap));

    assert!(matches!(profiler.take_error(), Some(Error::UnknownSource(None))));
    assert!(profiler.take_error().is_none());
    assert_eq!(profiler.code_map().iter().count(), 0);
}

#[test]
fn missing_source_is_not_registered() {
    let profiler = LineProfiler::new(Heap::default());

    assert!(!profiler.add_function(&CodeUnit::new("ghost", "/no/such/file.rs", 1)));
    assert!(!profiler.add_function(&CodeUnit::new("<closure>", "<string>", 1)));
}

/// Pending once, waking itself right away.
struct YieldNow(bool);

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.0 {
            return Poll::Ready(());
        }

        self.0 = true;
        cx.waker().wake_by_ref();

        Poll::Pending
    }
}

#[test]
fn futures_are_traced_only_while_polled() {
    let file = source_file(ALLOC_FREE);
    let unit = CodeUnit::new("alloc_free", file.path(), 1);
    let heap = Heap::new(100.0);
    let profiler = LineProfiler::new(heap.clone());

    profiler.add_function(&unit);

    let task = {
        let (unit, heap) = (unit.clone(), heap.clone());

        async move {
            let _frame = trace::enter(unit.id(), 1);

            trace::step(2);
            heap.alloc(10.0);

            YieldNow(false).await;

            trace::step(3);
            heap.free(10.0);

            42
        }
    };

    let other = async {
        assert_eq!(trace::hook_depth(), 0);
        YieldNow(false).await;
        assert_eq!(trace::hook_depth(), 0);
    };

    let (retval, ()) = futures::executor::block_on(async {
        futures::join!(profiler.wrap_future(task), other)
    });

    assert_eq!(retval, 42);
    assert_eq!(trace::hook_depth(), 0);
    assert_eq!(profiler.enable_count(), 0);

    let code_map = profiler.code_map();

    // the line stack survived the suspension
    assert_eq!(code_map.stat(unit.id(), 2).unwrap().increment, 10.0);
    assert_eq!(code_map.stat(unit.id(), 3).unwrap().increment, -10.0);
}

async fn alloc_in_steps(unit: CodeUnit, heap: Heap) {
    let _frame = trace::enter(unit.id(), 1);

    trace::step(2);
    heap.alloc(10.0);

    YieldNow(false).await;

    trace::step(3);
    heap.alloc(20.0);

    trace::step(4);
}

async fn step_across_yields(unit: CodeUnit) {
    let _frame = trace::enter(unit.id(), 1);

    trace::step(2);

    YieldNow(false).await;
    YieldNow(false).await;

    trace::step(3);
}

#[test]
fn interleaved_future_keeps_its_lines() {
    let file_a = source_file(ALLOC_FREE);
    let file_b = source_file(LOOPED);
    let unit_a = CodeUnit::new("alloc_free", file_a.path(), 1);
    let unit_b = CodeUnit::new("looped", file_b.path(), 1);
    let heap = Heap::new(100.0);
    let profiler = LineProfiler::new(heap.clone());

    profiler.add_function(&unit_a);

    futures::executor::block_on(async {
        futures::join!(
            profiler.wrap_future(alloc_in_steps(unit_a.clone(), heap.clone())),
            step_across_yields(unit_b.clone())
        )
    });

    let code_map = profiler.code_map();
    let increment = |line| code_map.stat(unit_a.id(), line).map(|stat| stat.increment);

    assert_eq!(increment(2), Some(10.0));
    assert_eq!(increment(3), Some(20.0));
    assert_eq!(increment(4), Some(0.0));
    assert!(trace::current_frame().is_none());
}

#[test]
fn interleaved_profiled_futures() {
    let file_a = source_file(ALLOC_FREE);
    let file_b = source_file(LOOPED);
    let unit_a = CodeUnit::new("alloc_free", file_a.path(), 1);
    let unit_b = CodeUnit::new("looped", file_b.path(), 1);
    let heap = Heap::new(100.0);
    let profiler = LineProfiler::new(heap.clone());

    profiler.add_function(&unit_a);
    profiler.add_function(&unit_b);

    futures::executor::block_on(async {
        futures::join!(
            profiler.wrap_future(alloc_in_steps(unit_a.clone(), heap.clone())),
            profiler.wrap_future(step_across_yields(unit_b.clone()))
        )
    });

    let code_map = profiler.code_map();
    let increment = |unit: &CodeUnit, line| code_map.stat(unit.id(), line).map(|stat| stat.increment);

    assert_eq!(increment(&unit_a, 2), Some(10.0));
    assert_eq!(increment(&unit_a, 3), Some(20.0));
    assert_eq!(increment(&unit_a, 4), Some(0.0));

    for line in 1..=3 {
        assert_eq!(code_map.stat(unit_b.id(), line).unwrap().occurrences, 1);
    }

    // line 2 of the second future spans the allocations of the first
    assert_eq!(increment(&unit_b, 2), Some(20.0));
    assert_eq!(profiler.enable_count(), 0);
}

#[test]
fn disabled_profiler_under_an_enabled_one_stops_recording() {
    let file_a = source_file(ALLOC_FREE);
    let file_b = source_file(LOOPED);
    let unit_a = CodeUnit::new("alloc_free", file_a.path(), 1);
    let unit_b = CodeUnit::new("looped", file_b.path(), 1);
    let heap = Heap::new(100.0);

    let below = LineProfiler::new(heap.clone());
    let above = LineProfiler::new(heap.clone());

    below.add_function(&unit_a);
    above.add_function(&unit_b);

    below.enable_by_count();
    above.enable_by_count();
    below.disable_by_count();

    assert!(!below.is_enabled());
    assert_eq!(trace::hook_depth(), 1);

    alloc_free(&unit_a, &heap);
    looped(&unit_b, &heap);

    above.disable_by_count();

    assert_eq!(below.code_map().iter().count(), 0);
    assert!(above.code_map().stat(unit_b.id(), 3).is_some());
}

#[test]
fn removing_a_middle_profiler_keeps_the_chain() {
    let file_a = source_file(ALLOC_FREE);
    let unit_a = CodeUnit::new("alloc_free", file_a.path(), 1);
    let heap = Heap::new(100.0);

    let bottom = LineProfiler::new(heap.clone());
    let middle = LineProfiler::new(heap.clone());
    let top = LineProfiler::new(heap.clone());

    bottom.add_function(&unit_a);

    bottom.enable_by_count();
    middle.enable_by_count();
    top.enable_by_count();

    middle.disable_by_count();

    alloc_free(&unit_a, &heap);

    top.disable_by_count();
    bottom.disable_by_count();

    assert_eq!(trace::hook_depth(), 0);
    assert_eq!(bottom.code_map().stat(unit_a.id(), 3).unwrap().increment, 20.0);

    // enabling again must not form a cycle with a stale chain
    middle.run(|| top.run(|| alloc_free(&unit_a, &heap)));
}
