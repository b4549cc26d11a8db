use anyhow::Result;

use stagehand::config::Config;
use stagehand::server;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    server::start_server(config).await
}
