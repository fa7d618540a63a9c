use anyhow::{Error, Result};
use notification_dispatch::{app, config::Config, utils::init_tracing};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_format)?;

    app::run(config).await
}
