use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use pagert_host::{build_request, load_page, load_site, serve_once};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "pagert-host")]
#[command(about = "Serve one request through a page program and print a JSON report.", long_about = None)]
struct Cli {
    /// Site config JSON (`pagert.site@0.1.0`).
    #[arg(long)]
    site: PathBuf,

    /// Page program JSON (`pagert.page@0.1.0`).
    #[arg(long)]
    page: PathBuf,

    #[arg(long, default_value = "GET")]
    method: String,

    #[arg(long, default_value = "/")]
    url: String,

    /// Request header as `Name: value`; may repeat.
    #[arg(long = "header", value_name = "NAME:VALUE")]
    headers: Vec<String>,

    /// File whose bytes become the request body.
    #[arg(long)]
    body: Option<PathBuf>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() -> std::process::ExitCode {
    let handle = std::thread::Builder::new()
        .name("pagert-host".to_string())
        .spawn(run);

    match handle {
        Ok(handle) => match handle.join() {
            Ok(code) => code,
            Err(panic) => {
                if let Some(message) = panic.downcast_ref::<&str>() {
                    eprintln!("pagert-host panicked: {message}");
                } else if let Some(message) = panic.downcast_ref::<String>() {
                    eprintln!("pagert-host panicked: {message}");
                } else {
                    eprintln!("pagert-host panicked");
                }
                std::process::ExitCode::from(2)
            }
        },
        Err(err) => {
            eprintln!("failed to spawn pagert-host thread: {err}");
            run()
        }
    }
}

fn run() -> std::process::ExitCode {
    match try_main() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            std::process::ExitCode::from(2)
        }
    }
}

fn try_main() -> Result<std::process::ExitCode> {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("install tracing subscriber")?;

    let site = load_site(&cli.site)?;
    let page = load_page(&cli.page)?;
    let body = match &cli.body {
        Some(path) => {
            Some(std::fs::read(path).with_context(|| format!("read body: {}", path.display()))?)
        }
        None => None,
    };
    let request = build_request(&cli.method, &cli.url, &cli.headers, body)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    tracing::debug!(site = %site.name, page = %page.path.display(), "serving request");
    let report = rt.block_on(serve_once(site, &page, request));

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(std::process::ExitCode::SUCCESS)
}
