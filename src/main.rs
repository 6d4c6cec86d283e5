// src/main.rs
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use decision_joiner::JoinerConfig;
use decision_joiner::services::joined_event::ExampleLine;
use decision_joiner::services::{
    BinaryParser, ExampleJoiner, Joiner, JoinerMetrics, JsonRecordDecoder, MultistepJoiner,
};
use decision_joiner::utils::logbook::DsJsonLog;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Missing command. Try: joiner convert <input> [--config <file>] | help");
        std::process::exit(2);
    }

    match args[1].as_str() {
        "convert" => {
            if let Err(e) = convert(&args[2..]) {
                eprintln!("error: {e:#}");
                std::process::exit(1);
            }
        }
        "help" => {
            println!("Available commands:");
            println!("  convert <input> [--config <file>]  - Join a binary log and print a summary");
            println!("  help                               - Show this help message");
        }
        unknown => {
            eprintln!("Unknown command: {}", unknown);
            std::process::exit(2);
        }
    }
}

fn convert(args: &[String]) -> Result<()> {
    let mut input: Option<PathBuf> = None;
    let mut config_path = PathBuf::from("joiner.toml");
    let mut it = args.iter();
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" => {
                let Some(p) = it.next() else {
                    bail!("--config needs a file argument");
                };
                config_path = PathBuf::from(p);
            }
            other if input.is_none() => input = Some(PathBuf::from(other)),
            other => bail!("unexpected argument: {other}"),
        }
    }
    let Some(input) = input else {
        bail!("convert needs an input file");
    };

    let cfg = JoinerConfig::load(&config_path)?;
    init_logging(&cfg.logging.level);

    let limit = cfg.parser.max_segment_bytes;
    let metrics = if cfg.parser.multistep {
        let joiner = MultistepJoiner::new(JsonRecordDecoder::new()).with_payload_limit(limit);
        run(joiner, &cfg, &input)?
    } else {
        let joiner = ExampleJoiner::new(JsonRecordDecoder::new()).with_payload_limit(limit);
        run(joiner, &cfg, &input)?
    };

    if let Some(path) = &cfg.output.metrics_path {
        metrics.persist(path)?;
    }
    println!(
        "learned={} skip_learn={} dropped={} zero_actions={} sum_original_reward={}",
        metrics.number_of_learned_events,
        metrics.number_of_skip_learn_events,
        metrics.number_of_dropped_events,
        metrics.number_of_events_zero_actions,
        metrics.sum_original_reward,
    );
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

fn run<J: Joiner>(mut joiner: J, cfg: &JoinerConfig, input: &Path) -> Result<JoinerMetrics> {
    cfg.loop_overrides.apply(&mut joiner);
    if let Some(path) = &cfg.output.dsjson_path {
        joiner.set_dsjson_log(DsJsonLog::create(path)?);
    }

    let file = File::open(input).with_context(|| format!("opening {}", input.display()))?;
    let mut parser = BinaryParser::new(BufReader::new(file), cfg.parser.max_segment_bytes);

    let mut examples: u64 = 0;
    let mut lines: Vec<ExampleLine<J::Record>> = Vec::new();
    loop {
        lines.clear();
        match parser.parse_examples(&mut joiner, &mut lines) {
            Ok(true) => examples += 1,
            Ok(false) => break,
            Err(e) if e.is_fatal() => {
                return Err(e).with_context(|| format!("reading {}", input.display()));
            }
            Err(e) => {
                tracing::warn!(error = %e, bytes_read = parser.bytes_read(), "stream ended early");
                break;
            }
        }
    }

    let stats = parser.stats();
    tracing::info!(
        examples,
        batches = stats.batches_read,
        skipped_batches = stats.batches_skipped,
        events = stats.events_read,
        rejected_events = stats.events_rejected,
        "conversion finished"
    );
    Ok(joiner.get_metrics())
}
