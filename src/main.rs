#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use adb_trace_proxy::proxy::config::{
    TraceTimings, resolve_adb_path, resolve_port, resolve_token_path,
};
use adb_trace_proxy::proxy::token::load_or_create_token;
use adb_trace_proxy::proxy::{ProxyContext, VERSION, build_app};
use clap::Parser;
use dotenv::dotenv;
use poem::{EndpointExt, Server, listener::TcpListener, middleware::Tracing};
use tracing::info;

/// Proxies ADB commands from the Winscope web client to attached devices.
#[derive(Parser, Debug)]
#[command(name = "adb-trace-proxy", version)]
struct Args {
    /// Port to listen on (env: WINSCOPE_PROXY_PORT, default 5544)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log at info level instead of debug
    #[arg(short, long)]
    info: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let args = Args::parse();

    let level = if args.info { "info" } else { "debug" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.parse().expect("valid directive")),
        )
        .init();

    let token = load_or_create_token(&resolve_token_path(None));
    let adb_path = resolve_adb_path(None);
    let timings = TraceTimings::from_env();

    println!("Winscope ADB Connect proxy version: {}", VERSION);
    println!("Winscope token: {}", token);

    let addr = format!("127.0.0.1:{}", resolve_port(args.port));
    info!("Starting Winscope ADB proxy on {} using {}", addr, adb_path);
    info!(
        "Keep-alive {:?}, command timeout {:?}",
        timings.keep_alive, timings.command_timeout
    );

    let app = build_app(ProxyContext::new(token, &adb_path, timings)).with(Tracing);

    Server::new(TcpListener::bind(addr))
        .name("Winscope ADB Proxy")
        .run_with_graceful_shutdown(
            app,
            async {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down");
            },
            None,
        )
        .await?;

    Ok(())
}
