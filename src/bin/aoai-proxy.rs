#[path = "aoai_proxy/cli.rs"]
mod cli;

use std::sync::Arc;

use clap::Parser;

use aoai_proxy::Env;
use aoai_proxy::gateway::{
    AzureOpenAiUpstream, Gateway, GatewayConfig, GatewayHttpState, Upstream, router,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = cli::Cli::parse();

    let mut config = match cli.config.as_ref() {
        Some(path) => GatewayConfig::from_toml_file(path)?,
        None => GatewayConfig::default(),
    };
    config.apply_env(&Env::from_dotenv_file(&cli.dotenv)?)?;
    cli.apply(&mut config);

    #[cfg(feature = "otel")]
    let _otel_guard = if cli.otel {
        Some(aoai_proxy::gateway::otel::init_tracing(
            aoai_proxy::gateway::http::SERVICE_ID,
            cli.otel_endpoint.as_deref(),
            &config.server.log_level,
            config.server.json_logs,
        )?)
    } else {
        aoai_proxy::gateway::telemetry::init_tracing(
            &config.server.log_level,
            config.server.json_logs,
        )?;
        None
    };
    #[cfg(not(feature = "otel"))]
    aoai_proxy::gateway::telemetry::init_tracing(
        &config.server.log_level,
        config.server.json_logs,
    )?;

    if let Err(err) = config.validate() {
        tracing::error!(error = %err, "invalid configuration");
        return Err(err.into());
    }

    let auth = config.credentials.token_provider()?;
    let upstream = Arc::new(AzureOpenAiUpstream::new(config.upstream.clone(), auth)?);

    if cli.skip_startup_check {
        tracing::warn!("skipping upstream connectivity check");
    } else if let Err(err) = upstream.validate().await {
        tracing::error!(error = %err, "Azure OpenAI connection validation failed");
        return Err(err.into());
    } else {
        tracing::info!("Azure OpenAI connection validation successful");
    }

    let gateway = Gateway::new(&config, upstream);
    let app = router(GatewayHttpState::new(gateway, &config.upstream));

    let listen = config.server.bind_addr();
    tracing::info!(
        listen = %listen,
        endpoint = %config.upstream.endpoint,
        deployment = %config.upstream.deployment,
        "starting Azure OpenAI proxy"
    );
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("proxy stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
