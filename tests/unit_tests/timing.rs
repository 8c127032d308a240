use parfem::comm::{CollectiveContext, CommError, SerialContext, ThreadedUniverse};
use parfem::timing::{format_g, format_time_report, time_collective, Timings, TimingSummary};
use std::thread;
use std::time::Duration;

#[test]
fn time_report_uses_five_significant_digits() {
    assert_eq!(format_time_report(Duration::from_millis(1234)), "TIME: 1.234");
    assert_eq!(format_time_report(Duration::from_micros(12_345_678)), "TIME: 12.346");
    assert_eq!(format_time_report(Duration::from_nanos(5)), "TIME: 5e-09");
    assert_eq!(format_g(1.0e-4, 5), "0.0001");
}

#[test]
fn collective_timing_is_bounded_by_slowest_rank() {
    let delay = Duration::from_millis(50);
    let timed = ThreadedUniverse::new(3).run(|ctx| {
        time_collective(&ctx, || {
            if ctx.rank() == 2 {
                thread::sleep(delay);
            }
            ctx.rank() * 10
        })
        .unwrap()
    });

    for (rank, timed) in timed.iter().enumerate() {
        assert_eq!(timed.value, rank * 10);
        // Every rank waits for the sleeping rank at the second barrier
        assert!(timed.elapsed >= delay / 2);
    }
}

#[test]
fn timing_summary_over_ranks() {
    let summaries = ThreadedUniverse::new(4).run(|ctx| {
        let elapsed = Duration::from_secs(ctx.rank() as u64 + 1);
        TimingSummary::reduce(&ctx, elapsed).unwrap()
    });
    for summary in summaries {
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 4.0);
        assert_eq!(summary.avg, 2.5);
    }
}

#[test]
fn timing_tables_are_reduced_by_task() {
    let tables = ThreadedUniverse::new(2).run(|ctx| {
        let mut timings = Timings::new();
        timings.record("pattern", Duration::from_millis(10 * (ctx.rank() as u64 + 1)));
        timings.record("assembly", Duration::from_millis(100));
        timings.reduce(&ctx).unwrap()
    });

    for table in &tables {
        let pattern = table.get("pattern").unwrap();
        assert_eq!(pattern.min, 0.01);
        assert_eq!(pattern.max, 0.02);
        assert!(table.get("assembly").is_some());
        assert!(table.get("solve").is_none());
        assert_eq!(table.iter().count(), 2);
    }
    let text = tables[0].to_string();
    assert!(text.starts_with("task"));
    assert!(text.contains("pattern"));
    assert!(text.contains("0.01"));
}

#[test]
fn timing_tables_with_different_tasks_cannot_be_reduced() {
    let results = ThreadedUniverse::new(2).run(|ctx| {
        let mut timings = Timings::new();
        timings.record("assembly", Duration::from_millis(1));
        if ctx.rank() == 1 {
            timings.record("extra", Duration::from_millis(1));
        }
        timings.reduce(&ctx)
    });
    for result in results {
        assert!(matches!(result, Err(CommError::Mismatch(_))));
    }
}

#[test]
fn local_timings_return_the_computed_value() {
    let mut timings = Timings::new();
    assert!(timings.is_empty());
    let value = timings.time("work", || 42);
    assert_eq!(value, 42);
    assert!(timings.get("work").is_some());

    let table = timings.reduce(&SerialContext).unwrap();
    let summary = table.get("work").unwrap();
    assert_eq!(summary.min, summary.max);
}

#[test]
fn timing_tables_with_tasks_in_different_order_cannot_be_reduced() {
    let results = ThreadedUniverse::new(3).run(|ctx| {
        let mut timings = Timings::new();
        if ctx.rank() == 2 {
            timings.record("assembly", Duration::from_millis(2));
            timings.record("pattern", Duration::from_millis(1));
        } else {
            timings.record("pattern", Duration::from_millis(1));
            timings.record("assembly", Duration::from_millis(2));
        }
        timings.reduce(&ctx)
    });
    for result in results {
        assert!(matches!(result, Err(CommError::Mismatch(_))));
    }
}

#[test]
fn timing_tables_with_renamed_task_cannot_be_reduced() {
    let results = ThreadedUniverse::new(2).run(|ctx| {
        let mut timings = Timings::new();
        let name = if ctx.rank() == 0 { "mesh" } else { "meshing" };
        timings.record(name, Duration::from_millis(1));
        timings.reduce(&ctx)
    });
    for result in results {
        assert!(matches!(result, Err(CommError::Mismatch(_))));
    }
}
