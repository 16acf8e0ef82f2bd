use std::net::SocketAddr;

use axum::Router;

mod bridge;
mod config;
mod error;
mod mkm;
mod routes;
mod runtime;
mod session;

use config::Settings;
use runtime::Runtime;

/// Debug builds default to `debug`, release to `info`; `RUST_LOG` overrides
/// either when the caller sets it (§9 Design notes: ambient logging).
fn init_logger() {
    if std::env::var("RUST_LOG").is_err() {
        let level = if cfg!(debug_assertions) { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }
    env_logger::init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let settings = Settings::from_env();
    let addr = SocketAddr::new(settings.ip.parse()?, settings.port);

    let runtime = std::sync::Arc::new(Runtime::build(settings).await?);
    let culler = runtime.mkm.spawn_culler();

    let app = Router::new()
        .merge(routes::router())
        .merge(bridge::router())
        .with_state(runtime.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, app).await?;

    culler.abort();
    Ok(())
}
