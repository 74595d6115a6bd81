//! Developer utility: train on one annotated image from the command line.

use std::path::PathBuf;

use mregion::Session;
use mregion::config::{self, PipelineSettings};
use mregion::logging::{self, Console, LogOptions};
use mregion::metrics::MetricEvent;

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let settings = config::load_or_default().unwrap_or_else(|err| {
        eprintln!("Using default settings: {err}");
        PipelineSettings::default()
    });
    let options = parse_args(std::env::args().skip(1).collect(), settings)?;
    let log_options = LogOptions {
        console: Console::Stderr,
        ..LogOptions::default()
    };
    if let Err(err) = logging::init_with(log_options) {
        eprintln!("Logging disabled: {err}");
    }

    let session = Session::new(options.settings.clone());
    let info = session
        .open_image(&options.image)
        .map_err(|err| err.to_string())?;
    let summary = session
        .import_annotations(&info.id, &options.annotations)
        .map_err(|err| err.to_string())?;
    println!(
        "image {} ({}x{}, {} levels): {} regions imported, {} skipped",
        info.id,
        info.width,
        info.height,
        info.level_count(),
        summary.regions_added,
        summary.regions_skipped
    );

    let dataset = session
        .build_default_dataset(&info.id)
        .map_err(|err| err.to_string())?;
    println!(
        "dataset {}: {} train / {} validation, classes [{}]",
        &dataset.fingerprint()[..12],
        dataset.train().len(),
        dataset.validation().len(),
        dataset.classes().join(", ")
    );

    let job = session
        .start_default_training(dataset)
        .map_err(|err| err.to_string())?;
    let events = session
        .subscribe_with_history(&job)
        .map_err(|err| err.to_string())?;
    for event in events {
        println!("{}", format_event(&event));
    }
    let state = session.wait(&job).map_err(|err| err.to_string())?;
    println!("job {} finished as {}", job.id, state);
    if let Some(failure) = session.job_failure(&job).map_err(|err| err.to_string())? {
        println!("failure: {failure}");
    }

    let path = session
        .save_job_record(&job, options.record_dir.as_deref())
        .map_err(|err| err.to_string())?;
    println!("record written to {}", path.display());
    Ok(())
}

fn format_event(event: &MetricEvent) -> String {
    let values: Vec<String> = event
        .values
        .iter()
        .map(|(name, value)| format!("{name}={value:.4}"))
        .collect();
    format!(
        "epoch {:>3} step {:>6}  {}",
        event.epoch,
        event.step,
        values.join("  ")
    )
}

#[derive(Debug, Clone)]
struct CliOptions {
    image: PathBuf,
    annotations: PathBuf,
    record_dir: Option<PathBuf>,
    settings: PipelineSettings,
}

fn parse_args(args: Vec<String>, defaults: PipelineSettings) -> Result<CliOptions, String> {
    let mut settings = defaults;
    let mut positional: Vec<PathBuf> = Vec::new();
    let mut record_dir: Option<PathBuf> = None;

    let mut idx = 0usize;
    while idx < args.len() {
        match args[idx].as_str() {
            "-h" | "--help" => return Err(help_text()),
            "--seed" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--seed requires a value".to_string())?;
                settings.dataset.seed = value
                    .parse::<u64>()
                    .map_err(|_| format!("Invalid --seed value: {value}"))?;
            }
            "--split" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--split requires a value".to_string())?;
                settings.dataset.split_ratio = value
                    .parse::<f64>()
                    .map_err(|_| format!("Invalid --split value: {value}"))?;
            }
            "--epochs" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--epochs requires a value".to_string())?;
                settings.model.epochs = value
                    .parse::<u32>()
                    .map_err(|_| format!("Invalid --epochs value: {value}"))?;
            }
            "--crop" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--crop requires a value".to_string())?;
                settings.sampling.crop_size = value
                    .parse::<u32>()
                    .map_err(|_| format!("Invalid --crop value: {value}"))?;
            }
            "--per-region" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--per-region requires a value".to_string())?;
                settings.sampling.samples_per_region = value
                    .parse::<u32>()
                    .map_err(|_| format!("Invalid --per-region value: {value}"))?;
            }
            "--labels" => {
                idx += 1;
                let value = args.get(idx).ok_or_else(|| "--labels requires a value".to_string())?;
                let labels: Vec<String> = value
                    .split(',')
                    .map(str::trim)
                    .filter(|label| !label.is_empty())
                    .map(str::to_string)
                    .collect();
                if labels.is_empty() {
                    return Err(format!("Invalid --labels value: {value}"));
                }
                settings.sampling.labels = Some(labels);
            }
            "--record-dir" => {
                idx += 1;
                let value = args
                    .get(idx)
                    .ok_or_else(|| "--record-dir requires a value".to_string())?;
                record_dir = Some(PathBuf::from(value));
            }
            other if other.starts_with("--") => {
                return Err(format!("Unknown argument: {other}\n\n{}", help_text()));
            }
            other => positional.push(PathBuf::from(other)),
        }
        idx += 1;
    }

    let [image, annotations]: [PathBuf; 2] = positional
        .try_into()
        .map_err(|_| format!("Expected <image> <annotations.json>\n\n{}", help_text()))?;
    Ok(CliOptions {
        image,
        annotations,
        record_dir,
        settings,
    })
}

fn help_text() -> String {
    [
        "mregion-train <image> <annotations.json> [options]",
        "",
        "Options:",
        "  --seed N            dataset and training seed (default from config, 1337)",
        "  --split R           train fraction in (0, 1) (default 0.8)",
        "  --epochs N          training epochs",
        "  --crop N            crop edge in pixels",
        "  --per-region N      samples drawn per region",
        "  --labels a,b        only train on these labels",
        "  --record-dir DIR    where to write the job record (default <app root>/jobs)",
    ]
    .join("\n")
}
