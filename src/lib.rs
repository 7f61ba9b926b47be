pub mod config;
pub mod console;
pub mod server;

use self::config::Config;

use std::sync::Arc;

use tokio::task::JoinSet;

/// In order to let the integration test directly use the websocketd crate and
/// start the server, a function is opened to replace the main function to
/// directly start the server.
pub async fn start_server(config: Arc<Config>) -> anyhow::Result<()> {
    let mut workers = JoinSet::new();

    workers.spawn(server::start_server(config));

    if let Some(res) = workers.join_next().await {
        workers.abort_all();

        return res?;
    }

    Ok(())
}
