use rosetta_relay::config::{config_path_from_env, RelayConfig};
use rosetta_relay::http::{run_http_server, HttpApp};
use rosetta_relay::relay::{spawn_shutdown_watcher, RelayService};
use rosetta_relay::{log_error, log_info, logging};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

fn print_usage() {
    eprintln!("Usage: server [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --config <PATH>    Path to config.toml (default: ./config.toml if present)");
    eprintln!("  --verbose          Log every SMTP step");
    eprintln!("  --sample-config    Print a sample configuration file");
    eprintln!("  --help             Show this help message");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  RELAY_CONFIG_PATH            Alternative way to set the config path");
    eprintln!("  SMTP_SERVER_DOMAIN, SMTP_SERVER_PORT, SMTP_CLIENT_DOMAIN");
    eprintln!("  SOURCE_EMAIL_ADDRESS, SOURCE_EMAIL_PASSWORD, TARGET_EMAIL_ADDRESS");
    eprintln!("  HTTP_SERVER_PORT, CORS_ALLOWED_ORIGINS, TIMEOUT_REQUEST_PROCESSING");
    eprintln!("  VERBOSE=1, RUST_LOG");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut verbose = logging::verbose_from_env();

    let mut iter = args[1..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            "--sample-config" => {
                println!("{}", RelayConfig::sample());
                return Ok(());
            }
            "--verbose" | "-v" => verbose = true,
            "--config" => match iter.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => {
                    eprintln!("Error: --config needs a path");
                    print_usage();
                    std::process::exit(1);
                }
            },
            other => {
                eprintln!("Unknown option: {}", other);
                print_usage();
                std::process::exit(1);
            }
        }
    }

    logging::init(verbose);

    let config_path = config_path.or_else(config_path_from_env);
    let config = RelayConfig::load(config_path.as_deref()).await?;
    config.validate()?;

    let service = RelayService::from_config(&config);
    let shutdown = CancellationToken::new();
    let watcher = spawn_shutdown_watcher(service.cell(), shutdown.clone());

    let listener = TcpListener::bind(("0.0.0.0", config.http.port)).await?;
    let app = Arc::new(HttpApp::new(service, &config.http));
    let server = tokio::spawn(run_http_server(listener, app, shutdown.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => log_info!("Interrupt received, shutting down"),
        Err(e) => log_error!("Failed to listen for interrupt: {}", e),
    }
    shutdown.cancel();

    if let Err(e) = watcher.await {
        log_error!("Shutdown watcher failed: {}", e);
    }
    match server.await {
        Ok(Err(e)) => log_error!("HTTP server failed: {}", e),
        Err(e) => log_error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    log_info!("Server stopped");
    Ok(())
}
