use std::path::PathBuf;
use std::sync::Arc;

use eyre::{Context, Result};
use tokio::task;

use crate::config::Config;
use crate::config::forward::Forward;
use crate::control::{ControlServer, DEFAULT_SOCKET};
use crate::engine::Engine;
use crate::signal::Signals;

#[derive(Debug, Default, Clone)]
pub struct Options {
    /// Overrides the `control` directive of the configuration.
    pub socket: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

/// Run the forwarder until it is told to stop.
pub async fn serve(opts: Options) -> Result<()> {
    let config = match &opts.config {
        Some(path) => Config::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => Config::default(),
    };

    let socket = opts
        .socket
        .or(config.control)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));

    let mut signals = Signals::new().context("failed to register signal handlers")?;
    let engine = Arc::new(Engine::new().context("failed to create the poller")?);

    for Forward { src, dest } in config.forward {
        let engine = Arc::clone(&engine);
        task::spawn_blocking(move || engine.add_mapping(src, dest))
            .await?
            .context("failed to apply the configuration")?;
    }

    let server = ControlServer::bind(&socket)
        .with_context(|| format!("failed to bind control socket {}", socket.display()))?;

    info!("starting...");

    let mut runner = {
        let engine = Arc::clone(&engine);
        task::spawn_blocking(move || engine.run())
    };

    let mut finished = None;
    tokio::select! {
        x = signals.wait_terminate() => info!("received {x}"),
        _ = server.serve(Arc::clone(&engine)) => {},
        r = &mut runner => finished = Some(r),
    }

    info!("exiting...");
    engine.request_shutdown();

    let r = match finished {
        Some(r) => r,
        None => runner.await,
    };
    r.context("forwarding engine panicked")?
        .context("forwarding engine failed")?;

    Ok(())
}
