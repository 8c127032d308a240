use eyre::eyre;
use log::info;
use parfem::config::AssemblyConfig;
use parfem::error::AssemblyError;
use parfem::poisson::{run_poisson_benchmark, PoissonReport};
use parfem::timing::format_time_report;
use std::error::Error;
use std::path::PathBuf;
use std::process;
use structopt::clap::ErrorKind;
use structopt::StructOpt;

/// Command line options
#[derive(StructOpt, Debug)]
#[structopt(
    name = "solve-poisson",
    about = "Times the distributed assembly of the Poisson stiffness matrix on the unit cube"
)]
struct Options {
    /// Number of cubes along each axis of the unit cube
    n: usize,

    /// Number of in-process ranks (ignored when running under MPI)
    #[structopt(short, long, default_value = "1")]
    processes: usize,

    /// JSON file with assembly options
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
}

fn main() -> eyre::Result<()> {
    env_logger::init();

    let options = match Options::from_args_safe() {
        Ok(options) => options,
        Err(err) if matches!(err.kind, ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed) => err.exit(),
        Err(_) => {
            println!("Usage: solve-poisson n");
            process::exit(1);
        }
    };

    let config = match &options.config {
        Some(path) => AssemblyConfig::from_json_file(path)?,
        None => AssemblyConfig::default(),
    };

    let results = run(&options, &config)?;
    let mut failed = false;
    for (rank, result) in &results {
        let rank = *rank;
        match result {
            Ok(report) if rank == 0 => println!("{}", format_time_report(report.elapsed)),
            Ok(_) => {}
            Err(err) => {
                failed = true;
                report_failure(rank, err);
            }
        }
    }

    if failed {
        process::exit(1);
    }
    Ok(())
}

fn report_failure(rank: usize, err: &AssemblyError) {
    // Only the failing rank reports the cause
    if err.is_remote_failure() {
        info!("rank {rank}: {err}");
        return;
    }
    let mut message = format!("rank {rank} failed during {}: {err}", err.stage());
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(&format!(": {cause}"));
        source = cause.source();
    }
    eprintln!("{message}");
}

/// Run the benchmark on every in-process rank. Returns the result of every rank, in rank order.
#[cfg(not(feature = "mpi"))]
fn run(options: &Options, config: &AssemblyConfig) -> eyre::Result<Vec<(usize, Result<PoissonReport, AssemblyError>)>> {
    use parfem::comm::{CollectiveContext, ThreadedUniverse};

    if options.processes == 0 {
        return Err(eyre!("At least one process is required"));
    }
    let universe = ThreadedUniverse::new(options.processes).with_timeout(config.communication_timeout());
    Ok(universe.run(|ctx| {
        let result = run_poisson_benchmark(&ctx, options.n, config).map(|(_, report)| report);
        (ctx.rank(), result)
    }))
}

/// Run the benchmark on this MPI rank. Returns the result of this rank only.
#[cfg(feature = "mpi")]
fn run(options: &Options, config: &AssemblyConfig) -> eyre::Result<Vec<(usize, Result<PoissonReport, AssemblyError>)>> {
    use parfem::comm::{CollectiveContext, MpiContext};

    if options.processes != 1 {
        log::warn!("--processes is ignored when running under MPI, use the MPI launcher instead");
    }
    let universe = mpi::initialize().ok_or_else(|| eyre!("Failed to initialize MPI"))?;
    let ctx = MpiContext::new(universe.world());
    let result = run_poisson_benchmark(&ctx, options.n, config).map(|(_, report)| report);
    Ok(vec![(ctx.rank(), result)])
}
