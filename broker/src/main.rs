use clap::Parser;
use tokio::signal;
use tracing::info;

use broker::config::{Args, Config};
use broker::{Application, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args).map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;

    if args.validate {
        println!("configuration is valid");
        return Ok(());
    }

    telemetry::init_telemetry(&config.log_filter)?;

    info!(port = config.port, "starting broker");
    let app = Application::new(config).await?;
    app.serve(shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
