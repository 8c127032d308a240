//! Timing of collective operations.
//!
//! A collective operation is timed between two barriers, so that the elapsed time measured on
//! every rank is determined by the slowest rank.
use itertools::Itertools;
use parfem_comm::{CollectiveContext, CommError};
use rustc_hash::FxHasher;
use std::fmt;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

/// The result of a timed operation together with the elapsed wall time.
#[derive(Debug, Clone, PartialEq)]
pub struct Timed<R> {
    pub value: R,
    pub elapsed: Duration,
}

/// Time a collective operation: barrier, run `f`, barrier.
///
/// The returned value of `f` is passed through unchanged, including any error it contains.
/// Only a failure of one of the two barriers is reported as an error.
pub fn time_collective<C, R>(ctx: &C, f: impl FnOnce() -> R) -> Result<Timed<R>, CommError>
where
    C: CollectiveContext + ?Sized,
{
    ctx.barrier()?;
    let start = Instant::now();
    let value = f();
    ctx.barrier()?;
    Ok(Timed {
        value,
        elapsed: start.elapsed(),
    })
}

/// Minimum, maximum and average of an elapsed time over all ranks, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimingSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl TimingSummary {
    /// Reduce the elapsed time of every rank into a summary. Collective.
    pub fn reduce<C>(ctx: &C, elapsed: Duration) -> Result<Self, CommError>
    where
        C: CollectiveContext + ?Sized,
    {
        let times = ctx.all_gather(elapsed.as_secs_f64())?;
        Ok(Self::from_times(&times))
    }

    fn from_times(times: &[f64]) -> Self {
        if times.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                avg: 0.0,
            };
        }
        let min = times.iter().copied().fold(f64::INFINITY, f64::min);
        let max = times.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let avg = times.iter().sum::<f64>() / times.len() as f64;
        Self { min, max, avg }
    }
}

/// Named timings of several tasks, recorded in order.
///
/// Every rank must record the same tasks in the same order before the table is reduced.
#[derive(Debug, Clone, Default)]
pub struct Timings {
    tasks: Vec<(String, Duration)>,
}

impl Timings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the elapsed time of a task. Times of tasks with the same name are accumulated.
    pub fn record(&mut self, name: impl Into<String>, elapsed: Duration) {
        let name = name.into();
        match self.tasks.iter_mut().find(|(task, _)| *task == name) {
            Some((_, total)) => *total += elapsed,
            None => self.tasks.push((name, elapsed)),
        }
    }

    /// Time a local computation and record it under the given name.
    pub fn time<R>(&mut self, name: impl Into<String>, f: impl FnOnce() -> R) -> R {
        let start = Instant::now();
        let value = f();
        self.record(name, start.elapsed());
        value
    }

    pub fn get(&self, name: &str) -> Option<Duration> {
        self.tasks
            .iter()
            .find(|(task, _)| task == name)
            .map(|(_, elapsed)| *elapsed)
    }

    pub fn tasks(&self) -> impl Iterator<Item = (&str, Duration)> {
        self.tasks.iter().map(|(name, elapsed)| (name.as_str(), *elapsed))
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Hash of the task names in recording order. Identical on every rank for identical names.
    fn task_names_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for (name, _) in &self.tasks {
            name.hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Summarize every task over all ranks. Collective.
    ///
    /// Fails with [`CommError::Mismatch`] on every rank if the ranks did not record the same
    /// tasks in the same order.
    pub fn reduce<C>(&self, ctx: &C) -> Result<TimingSummaries, CommError>
    where
        C: CollectiveContext + ?Sized,
    {
        let counts = ctx.all_gather(self.tasks.len())?;
        if counts.iter().any(|&count| count != self.tasks.len()) {
            return Err(CommError::Mismatch(format!(
                "ranks recorded different numbers of timed tasks: {counts:?}"
            )));
        }
        let hashes = ctx.all_gather(self.task_names_hash())?;
        if hashes.iter().any(|&hash| hash != hashes[0]) {
            let ranks = hashes.iter().positions(|&hash| hash != hashes[0]).collect::<Vec<_>>();
            return Err(CommError::Mismatch(format!(
                "timed tasks of ranks {ranks:?} differ in name or order from those of rank 0"
            )));
        }
        let summaries = self
            .tasks
            .iter()
            .map(|(name, elapsed)| Ok((name.clone(), TimingSummary::reduce(ctx, *elapsed)?)))
            .collect::<Result<_, CommError>>()?;
        Ok(TimingSummaries { summaries })
    }
}

/// Timings of several tasks reduced over all ranks. Displays as a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSummaries {
    summaries: Vec<(String, TimingSummary)>,
}

impl TimingSummaries {
    pub fn get(&self, name: &str) -> Option<&TimingSummary> {
        self.summaries
            .iter()
            .find(|(task, _)| task == name)
            .map(|(_, summary)| summary)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TimingSummary)> {
        self.summaries.iter().map(|(name, summary)| (name.as_str(), summary))
    }
}

impl Display for TimingSummaries {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let width = self
            .summaries
            .iter()
            .map(|(name, _)| name.len())
            .max()
            .unwrap_or(0)
            .max("task".len());
        writeln!(f, "{:<width$}  {:>12}  {:>12}  {:>12}", "task", "min", "max", "avg")?;
        for (name, summary) in &self.summaries {
            writeln!(
                f,
                "{:<width$}  {:>12}  {:>12}  {:>12}",
                name,
                format_g(summary.min, 5),
                format_g(summary.max, 5),
                format_g(summary.avg, 5)
            )?;
        }
        Ok(())
    }
}

/// The report line printed by the lowest rank after a timed run.
pub fn format_time_report(elapsed: Duration) -> String {
    format!("TIME: {}", format_g(elapsed.as_secs_f64(), 5))
}

/// Format a number with `precision` significant digits, like `%g` in C.
///
/// Fixed notation is used unless the decimal exponent is below -4 or at least `precision`.
/// Trailing zeros are removed.
pub fn format_g(value: f64, precision: usize) -> String {
    let precision = precision.max(1);
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return format!("{value}");
    }

    // Round to the requested number of significant digits first, since rounding may change
    // the exponent (e.g. 9.99999 -> 1.0000e1)
    let scientific = format!("{:.*e}", precision - 1, value);
    let (mantissa, exponent) = scientific
        .split_once('e')
        .expect("Scientific formatting always contains an exponent");
    let exponent: i32 = exponent
        .parse()
        .expect("Scientific formatting always produces an integer exponent");

    if exponent < -4 || exponent >= precision as i32 {
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_zeros(mantissa), sign, exponent.abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        trim_zeros(&format!("{:.*}", decimals, value)).to_string()
    }
}

fn trim_zeros(number: &str) -> &str {
    if number.contains('.') {
        number.trim_end_matches('0').trim_end_matches('.')
    } else {
        number
    }
}
