//! Hearth CLI

use std::path::Path;
use std::process;

use anyhow::Context;
use http::{Response, StatusCode};
use tracing::info;

use hearth::{Handler, ResponseBody, ServerEngine, ServerOptions};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Hearth v{}", env!("CARGO_PKG_VERSION"));
        eprintln!();
        eprintln!("Usage: hearth <command> [options]");
        eprintln!();
        eprintln!("Commands:");
        eprintln!("  serve [config.toml]   Start the demo server");
        eprintln!("  check <config.toml>   Validate a configuration file");
        process::exit(1);
    }

    match args[1].as_str() {
        "serve" => serve(args.get(2).map(Path::new)),
        "check" => {
            let Some(path) = args.get(2) else {
                eprintln!("Usage: hearth check <config.toml>");
                process::exit(1);
            };
            check(Path::new(path))
        }
        command => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'hearth' for usage information.");
            process::exit(1);
        }
    }
}

fn demo_handler() -> Handler {
    Handler::new(|req| async move {
        let body = format!("{} {}\n", req.method(), req.uri());
        Ok::<_, std::convert::Infallible>(
            Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/plain")
                .body(ResponseBody::from(body))
                .expect("static response is valid"),
        )
    })
}

fn load_options(config: Option<&Path>) -> anyhow::Result<ServerOptions> {
    let handler = demo_handler();
    match config {
        Some(path) => ServerOptions::from_file(path, handler)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(ServerOptions::new(handler)
            .with_bind_addr("127.0.0.1:8080".parse()?)
            .with_banner(["hearth demo server"])),
    }
}

fn serve(config: Option<&Path>) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let options = load_options(config)?;

    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(async {
        let server = ServerEngine::start(options)
            .await
            .context("starting engine")?;
        info!(address = %server.local_addr(), "serving; press ctrl-c to stop");

        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        info!("received SIGINT, shutting down");
        server.shutdown().await;
        Ok(())
    })
}

fn check(path: &Path) -> anyhow::Result<()> {
    let options = load_options(Some(path))?;
    let options = options.validate().context("validating configuration")?;
    println!("Configuration OK");
    println!("  bind address:     {}", options.bind_addr);
    println!("  max connections:  {}", options.max_connections);
    println!(
        "  timeouts (ms):    header={} request={} idle={}",
        options.response_header_timeout.as_millis(),
        options.request_timeout.as_millis(),
        options.idle_timeout.as_millis()
    );
    println!("  tls:              {}", options.tls.is_some());
    Ok(())
}
