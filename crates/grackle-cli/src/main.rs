//! The `grackle` binary.
//!
//! Wires the logger chain together and drives the single-threaded loop:
//! generate a statement, fan out `generated`, submit it, fan out the
//! outcome, flush the persistent sink when due.

use std::io;
use std::path::PathBuf;
use std::process;

use clap::Parser;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing_subscriber::EnvFilter;

use grackle::log::{ImpedanceFeedback, Logger, PgLogger, ProgressLogger, QueryDumper};
use grackle::{Dut, Error, FailureKind, ImpedanceHandle, KnownErrors, Schema, grammar};

/// Random query fuzzer for PostgreSQL.
#[derive(Parser, Debug)]
#[command(name = "grackle", version, about)]
struct Args {
    /// Connection string of the database under test.
    #[arg(long, env = "DATABASE_URL")]
    target: String,

    /// Record statistics and unknown errors into this database as well.
    #[arg(long)]
    log_to: Option<String>,

    /// File of known error prefixes, one per line.
    #[arg(long)]
    known_errors: Option<PathBuf>,

    /// Seed for the generator; random when omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Stop after this many generated queries (0 = run forever).
    #[arg(long, default_value_t = 0)]
    queries: u64,

    /// Leave pg_catalog and information_schema relations out of scope.
    #[arg(long)]
    no_catalog: bool,

    /// Print every generated query on stdout.
    #[arg(long)]
    dump_all: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("grackle: {e}");
        process::exit(1);
    }
}

async fn run(args: Args) -> grackle::Result<()> {
    let seed = args.seed.unwrap_or_else(rand::random);
    tracing::info!(seed, "seeding generator");
    let mut rng = SmallRng::seed_from_u64(seed);

    let known = match &args.known_errors {
        Some(path) => match KnownErrors::load(path) {
            Ok(known) => {
                tracing::info!(count = known.len(), "loaded known errors");
                known
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "could not load known errors, continuing without"
                );
                KnownErrors::default()
            }
        },
        None => KnownErrors::default(),
    };

    let schema = Schema::load(&args.target, args.no_catalog).await?;
    let mut dut = Dut::connect(&args.target).await?;

    let imp = ImpedanceHandle::new();
    let mut loggers: Vec<Box<dyn Logger>> = vec![
        Box::new(ImpedanceFeedback::new(imp.clone())),
        Box::new(ProgressLogger::stderr(imp.clone())),
    ];
    if args.dump_all {
        loggers.push(Box::new(QueryDumper));
    }
    let mut pg_logger = match &args.log_to {
        Some(conninfo) => Some(
            PgLogger::connect(conninfo, &args.target, &schema.version, seed, imp.clone()).await?,
        ),
        None => None,
    };

    let mut generated = 0u64;
    while args.queries == 0 || generated < args.queries {
        let query = match grammar::select_stmt(&mut rng, &schema, &imp) {
            Ok(query) => query,
            Err(e @ (Error::EmptySchema | Error::UnknownTyptype { .. })) => return Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "query construction failed");
                continue;
            }
        };
        generated += 1;

        for logger in &mut loggers {
            logger.generated(&query);
        }
        if let Some(pg) = &mut pg_logger {
            pg.generated(&query);
        }

        match dut.test(&query.to_string()).await {
            Ok(()) => {
                for logger in &mut loggers {
                    logger.executed(&query);
                }
                if let Some(pg) = &mut pg_logger {
                    pg.executed(&query);
                }
            }
            Err(failure) => {
                for logger in &mut loggers {
                    logger.dispatch_error(&query, &failure, &known);
                }
                if let Some(pg) = &mut pg_logger {
                    pg.dispatch_error(&query, &failure, &known);
                }
                if failure.kind == FailureKind::Broken {
                    tracing::warn!("dut session lost, reconnecting on next submission");
                }
            }
        }

        if let Some(pg) = &mut pg_logger {
            pg.flush_if_due().await;
        }
    }

    eprintln!();
    eprint!("{}", imp.report_string());
    Ok(())
}
