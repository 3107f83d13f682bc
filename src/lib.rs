pub mod app;
pub mod config;
pub mod front;
pub mod logging;
pub mod net;
pub mod tunnel;

pub async fn run(cli: app::CliOverrides) -> anyhow::Result<()> {
    app::run(cli).await
}
