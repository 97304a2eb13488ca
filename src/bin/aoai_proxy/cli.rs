use std::path::PathBuf;

use clap::Parser;

use aoai_proxy::gateway::GatewayConfig;

#[derive(Parser, Debug)]
#[command(name = "aoai-proxy")]
#[command(version)]
#[command(about = "OpenAI-compatible chat completion proxy for Azure OpenAI", long_about = None)]
pub(crate) struct Cli {
    /// TOML settings file; environment variables override it
    #[arg(short, long, env = "AOAI_PROXY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Dotenv file layered under the process environment
    #[arg(long, default_value = ".env")]
    pub dotenv: PathBuf,

    /// Listen host
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Start without the upstream connectivity check
    #[arg(long)]
    pub skip_startup_check: bool,

    /// Export spans over OTLP/HTTP
    #[cfg(feature = "otel")]
    #[arg(long)]
    pub otel: bool,

    /// OTLP collector endpoint
    #[cfg(feature = "otel")]
    #[arg(long, requires = "otel")]
    pub otel_endpoint: Option<String>,
}

impl Cli {
    /// Flags win over every other settings source.
    pub(crate) fn apply(&self, config: &mut GatewayConfig) {
        if let Some(host) = self.host.as_ref() {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(level) = self.log_level.as_ref() {
            config.server.log_level = level.clone();
        }
        if self.json_logs {
            config.server.json_logs = true;
        }
    }
}
