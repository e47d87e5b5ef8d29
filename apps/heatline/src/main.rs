use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use heatline::annotate::{AnnotationRequest, annotate};
use heatline::client::EngineClient;
use heatline::client::progress::{IndicatorEvent, ProgressBridge, Settled};
use heatline::settings::{EngineSettings, SettingsHub, remap_path};
use heatline::transport::pipe::PipeConnector;

#[derive(Parser, Debug)]
#[command(
    name = "heatline",
    about = "Query a profiling recording through the analysis engine"
)]
struct Cli {
    /// Path to the recording to open.
    recording: PathBuf,

    /// Engine executable override.
    #[arg(long)]
    engine: Option<PathBuf>,

    /// How many of the hottest functions to list.
    #[arg(long, default_value_t = 5)]
    hot: u32,

    /// Print line annotations for this function id (requires --process).
    #[arg(long)]
    function: Option<u64>,

    /// Process key the function was sampled in.
    #[arg(long)]
    process: Option<u64>,

    /// Run the engine with verbose diagnostics.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    if let Err(err) = run(cli).await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn init_tracing(debug: bool) {
    let default_filter = if debug { "heatline=debug" } else { "heatline=info" };
    let filter = std::env::var("HEATLINE_LOG").unwrap_or_else(|_| default_filter.to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let mut settings = EngineSettings::from_env();
    if cli.engine.is_some() {
        settings.executable = cli.engine.clone();
    }
    settings.debug |= cli.debug;

    let hub = SettingsHub::new(settings);
    let client = EngineClient::new(PipeConnector::new(), hub.subscribe());
    client.start().await.context("starting the engine")?;

    let outcome = inspect(&client, &hub, &cli).await;

    if let Err(err) = client.stop().await {
        tracing::warn!(error = %err, "engine stop failed");
    }
    outcome
}

async fn inspect(client: &EngineClient, hub: &SettingsHub, cli: &Cli) -> Result<()> {
    let (indicator_tx, mut indicator_rx) = tokio::sync::mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        let mut percent = 0u32;
        while let Some(event) = indicator_rx.recv().await {
            match event {
                IndicatorEvent::Begin { title, .. } => eprintln!("{title}..."),
                IndicatorEvent::Report { message, delta } => {
                    percent += delta;
                    if let Some(message) = message {
                        eprintln!("  {percent:>3}% {message}");
                    }
                }
                IndicatorEvent::End { .. } => percent = 0,
            }
        }
    });
    let bridge = ProgressBridge::new(indicator_tx);

    let recording = cli.recording.to_string_lossy();
    let document_id = match client.read_document_tracked(&bridge, &recording).await? {
        Settled::Done(id) => id,
        Settled::Cancelled => bail!("opening the recording was cancelled"),
    };

    let session = client.retrieve_session_info(document_id).await?;
    println!("recording : {}", recording);
    println!("command   : {}", session.command_line);
    println!("captured  : {}", session.date);
    println!(
        "runtime   : {:.3}s over {} processes / {} threads, {} samples",
        session.runtime as f64 / 1e9,
        session.number_of_processes,
        session.number_of_threads,
        session.number_of_samples,
    );

    let system = client.retrieve_system_info(document_id).await?;
    println!(
        "system    : {} ({} {}), {} x {}",
        system.hostname, system.platform, system.architecture, system.number_of_processors,
        system.cpu_name,
    );

    let sources = client.retrieve_sample_sources(document_id).await?;
    for source in &sources {
        println!(
            "source    : [{}] {} ({} samples @ {:.0}/s{})",
            source.id,
            source.name,
            source.number_of_samples,
            source.average_sampling_rate,
            if source.has_stacks { ", stacks" } else { "" },
        );
    }

    let processes = client.retrieve_processes(document_id).await?;
    for process in &processes {
        println!(
            "process   : [{}] {} ({} threads)",
            process.key,
            process.name,
            process.threads.len()
        );
    }

    if let Some(source) = sources.first() {
        let hottest = match client
            .retrieve_hottest_functions_tracked(&bridge, document_id, source.id, cli.hot)
            .await?
        {
            Settled::Done(functions) => functions,
            Settled::Cancelled => bail!("hottest-function query was cancelled"),
        };
        println!("hottest   :");
        for entry in &hottest {
            let function = &entry.function;
            let self_samples = function
                .hits
                .first()
                .map(|hits| hits.self_samples)
                .unwrap_or(0);
            println!(
                "  {:>10}  {} ({})",
                self_samples, function.name, function.module
            );
        }
    }

    if let (Some(function_id), Some(process_key)) = (cli.function, cli.process) {
        print_line_annotations(client, hub, &sources, document_id, process_key, function_id)
            .await?;
    }

    client.close_document(document_id).await?;
    drop(bridge);
    let _ = printer.await;
    Ok(())
}

async fn print_line_annotations(
    client: &EngineClient,
    hub: &SettingsHub,
    sources: &[engine_proto::SampleSourceInfo],
    document_id: u32,
    process_key: u64,
    function_id: u64,
) -> Result<()> {
    let Some(info) = client
        .retrieve_line_info(document_id, process_key, function_id)
        .await?
    else {
        println!("no line info available for function {function_id}");
        return Ok(());
    };

    let path = remap_path(&hub.current().module_path_maps, &info.file_path);

    // Without the file on disk the hit extent stands in for its length;
    // sentinel line numbers are excluded the same way the renderer does.
    let plausible = 1..=i64::from(info.line_number).saturating_add(100_000);
    let last_line = info
        .line_hits
        .iter()
        .map(|hits| hits.line_number)
        .filter(|line| plausible.contains(line))
        .max()
        .unwrap_or(i64::from(info.line_number)) as u32;

    let annotations = annotate(&AnnotationRequest::from_line_info(
        &info,
        sources,
        0,
        last_line,
    ));

    println!("{path}:{}", info.line_number);
    for label in &annotations.gutter {
        if label.text.is_empty() {
            continue;
        }
        let bucket = annotations
            .heat
            .iter()
            .position(|spans| spans.iter().any(|span| span.start <= label.line && label.line <= span.end))
            .unwrap_or(0);
        println!(
            "  {:>width$}  line {:>5}  heat {}/{}",
            label.text,
            label.line,
            bucket + 1,
            annotations.heat.len(),
            width = label.width,
        );
    }
    Ok(())
}
