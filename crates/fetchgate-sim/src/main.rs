use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context;
use chrono::{NaiveDate, NaiveTime, TimeDelta};
use fetchgate::{GateError, RateLimitConfig};
use fetchgate_sim::label::sample_tickers;
use fetchgate_sim::{BarRequest, SimConfig, SimError, Simulation};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "\
Usage: fetchgate-sim [options]

Options:
  --config <file>        JSON config (host, coordinator, feed sections)
  --tickers <n>          Number of synthetic tickers [default: 25]
  --symbols <a,b,...>    Explicit tickers instead of synthetic ones
  --from <YYYY-MM-DD>    First day requested [default: 2016-08-01]
  --to <YYYY-MM-DD>      Last day requested [default: 2016-08-31]
  --window <minutes>     Split each trading day's session (09:30-16:00)
                         into intraday windows of this length
  --concurrency <n>      Permits in the first round
  --deadline-ms <ms>     Per-request deadline
  --max-rounds <n>       Round ceiling, first round included
  --rate <n>/<ms>        At most n submissions per ms window
  --late-pct <pct>       Share of requests that answer late at first
  --latency-ms <ms>      Feed response latency";

#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    tickers: Option<usize>,
    symbols: Option<Vec<String>>,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
    window_minutes: Option<u32>,
    concurrency: Option<usize>,
    deadline_ms: Option<u64>,
    max_rounds: Option<usize>,
    rate: Option<RateLimitConfig>,
    late_pct: Option<u8>,
    latency_ms: Option<u64>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options) {
        if let Some(SimError::Batch(GateError::Interrupted)) = e.downcast_ref::<SimError>() {
            eprintln!("interrupted");
            process::exit(130);
        }
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("FETCHGATE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("trace") => "trace",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("fetchgate={level},fetchgate_sim={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .map(String::as_str)
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match flag {
            "--config" => options.config = Some(PathBuf::from(value()?)),
            "--tickers" => options.tickers = Some(parse_number(flag, value()?)?),
            "--symbols" => {
                options.symbols = Some(
                    value()?
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect(),
                )
            }
            "--from" => options.from = Some(parse_date(flag, value()?)?),
            "--to" => options.to = Some(parse_date(flag, value()?)?),
            "--window" => options.window_minutes = Some(parse_number(flag, value()?)?),
            "--concurrency" => options.concurrency = Some(parse_number(flag, value()?)?),
            "--deadline-ms" => options.deadline_ms = Some(parse_number(flag, value()?)?),
            "--max-rounds" => options.max_rounds = Some(parse_number(flag, value()?)?),
            "--rate" => options.rate = Some(parse_rate(value()?)?),
            "--late-pct" => options.late_pct = Some(parse_number(flag, value()?)?),
            "--latency-ms" => options.latency_ms = Some(parse_number(flag, value()?)?),
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unknown argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

fn parse_number<T: std::str::FromStr>(flag: &str, raw: &str) -> Result<T, String> {
    raw.parse()
        .map_err(|_| format!("{flag} expects a non-negative number, got '{raw}'"))
}

fn parse_date(flag: &str, raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| format!("{flag} expects YYYY-MM-DD, got '{raw}': {e}"))
}

fn parse_rate(raw: &str) -> Result<RateLimitConfig, String> {
    let (permits, period) = raw
        .split_once('/')
        .ok_or_else(|| format!("--rate expects <n>/<ms>, got '{raw}'"))?;
    Ok(RateLimitConfig {
        permits: parse_number("--rate", permits)?,
        period: Duration::from_millis(parse_number("--rate", period)?),
    })
}

fn build_config(options: &Options) -> anyhow::Result<SimConfig> {
    let mut config = match &options.config {
        Some(path) => SimConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SimConfig::default(),
    };

    let coordinator = &mut config.coordinator;
    if let Some(n) = options.concurrency {
        coordinator.concurrency = n;
        coordinator.min_concurrency = coordinator.min_concurrency.min(n.max(1));
    }
    if let Some(ms) = options.deadline_ms {
        coordinator.deadline = Duration::from_millis(ms);
    }
    if let Some(n) = options.max_rounds {
        coordinator.max_rounds = n;
    }
    if let Some(rate) = &options.rate {
        coordinator.rate_limit = Some(rate.clone());
    }
    coordinator.validate().context("invalid coordinator settings")?;

    if let Some(pct) = options.late_pct {
        config.feed.late_pct = pct.min(100);
    }
    if let Some(ms) = options.latency_ms {
        config.feed.latency_ms = ms;
    }
    Ok(config)
}

fn build_requests(options: &Options) -> anyhow::Result<Vec<BarRequest>> {
    let from = options
        .from
        .or_else(|| NaiveDate::from_ymd_opt(2016, 8, 1))
        .context("invalid default start date")?;
    let to = options
        .to
        .or_else(|| NaiveDate::from_ymd_opt(2016, 8, 31))
        .context("invalid default end date")?;
    anyhow::ensure!(from <= to, "--from {from} is after --to {to}");

    let tickers = match &options.symbols {
        Some(symbols) => symbols.clone(),
        None => sample_tickers(options.tickers.unwrap_or(25)),
    };
    let daily = tickers
        .into_iter()
        .map(|ticker| BarRequest::daily(ticker, from, to));

    let Some(minutes) = options.window_minutes else {
        return Ok(daily.collect());
    };
    anyhow::ensure!(minutes > 0, "--window must be at least 1 minute");
    let open = NaiveTime::from_hms_opt(9, 30, 0).context("invalid session open")?;
    let close = NaiveTime::from_hms_opt(16, 0, 0).context("invalid session close")?;
    let step = TimeDelta::minutes(i64::from(minutes));

    Ok(daily
        .flat_map(|day_range| {
            day_range
                .trading_days()
                .into_iter()
                .flat_map(|date| BarRequest::windows(&day_range.ticker, date, open, close, step))
                .collect::<Vec<_>>()
        })
        .collect())
}

fn run(options: Options) -> anyhow::Result<()> {
    let config = build_config(&options)?;
    let requests = build_requests(&options)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("fetchgate-feed")
        .build()
        .context("failed to start tokio runtime")?;

    let simulation = Simulation::new(&config, runtime.handle().clone())?;
    let done = CancellationToken::new();

    let interrupter = simulation.interrupter();
    let watcher_done = done.clone();
    runtime.spawn(async move {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => {
                    tracing::warn!("Interrupt received, aborting batch");
                    interrupter.interrupt();
                }
                Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C"),
            },
            _ = watcher_done.cancelled() => {}
        }
    });

    // The driver blocks; this thread is not one of the runtime's workers.
    let result = simulation.run(requests);

    done.cancel();
    simulation.shutdown();
    drop(simulation);
    runtime.shutdown_timeout(Duration::from_secs(1));

    let report = result?;
    let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
    println!("{json}");
    Ok(())
}
