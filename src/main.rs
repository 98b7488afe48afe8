mod args;

use std::io::{self, Write};
use std::time::Instant;

use clap::Parser;
use log::{Level, LevelFilter, Log, Metadata, Record};

use args::{Args, Mode};
use fieldcorr::container::ContainerStore;
use fieldcorr::engine::{compute_correlation, CorrelationOptions, CorrelationRequest};
use fieldcorr::error::DynError;
use fieldcorr::report::write_lag_table;

struct StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = match record.level() {
            Level::Error => "error",
            Level::Warn => "warn",
            Level::Info => "info",
            Level::Debug => "debug",
            Level::Trace => "trace",
        };
        eprintln!("[{tag}] {}", record.args());
    }

    fn flush(&self) {}
}

static LOGGER: StderrLogger = StderrLogger;

fn init_logging(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

fn progress_printer() -> impl FnMut(usize, usize, f64) {
    move |done: usize, total: usize, first_window_secs: f64| {
        let eta = first_window_secs * (total - done) as f64;
        print!("\rCorrelating ({done}/{total}) ETA {eta:.1}s   ");
        io::stdout().flush().ok();
    }
}

fn main() -> Result<(), DynError> {
    let args = Args::parse();
    init_logging(args.debug);

    let options = CorrelationOptions {
        halo: args.halo.into(),
        cancel: None,
    };
    let kind = if args.field2.is_some() { "cross" } else { "auto" };
    println!(
        "[info] {kind}-correlation of {} ({:?} mode, cutoff {}, halo {:?})",
        args.field1, args.mode, args.cutoff, options.halo
    );
    if args.mode == Mode::Full && args.winmulti != 2 {
        println!("[warn] --winmulti is ignored in full mode");
    }

    let started = Instant::now();
    let counts = match args.mode {
        Mode::Full => {
            let field1 = ContainerStore::open(&args.field1)?.load()?;
            let request = match &args.field2 {
                Some(reference) => {
                    let field2 = ContainerStore::open(reference)?.load()?;
                    compute_correlation(
                        CorrelationRequest::FullCross {
                            field1: field1.view(),
                            field2: field2.view(),
                        },
                        args.cutoff,
                        &options,
                        None,
                    )
                }
                None => compute_correlation(
                    CorrelationRequest::FullAuto {
                        field: field1.view(),
                    },
                    args.cutoff,
                    &options,
                    None,
                ),
            };
            request?
        }
        Mode::Patched => {
            let request = match args.field2.clone() {
                Some(field2) => CorrelationRequest::PatchedCross {
                    field1: args.field1.clone(),
                    winmulti: args.winmulti,
                    field2,
                },
                None => CorrelationRequest::PatchedAuto {
                    field: args.field1.clone(),
                    winmulti: args.winmulti,
                },
            };
            let mut progress = progress_printer();
            let result = compute_correlation(request, args.cutoff, &options, Some(&mut progress));
            println!();
            result?
        }
    };

    write_lag_table(&args.output, &counts, args.cutoff)?;
    let centre = vec![args.cutoff; counts.ndim()];
    println!("[info] Zero-lag count: {:.6e}", counts[centre.as_slice()]);
    println!(
        "[info] Wrote {} lags to {} in {:.3} s",
        counts.len(),
        args.output.display(),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}
