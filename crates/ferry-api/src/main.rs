use ferry_core::Config;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let config = Config::from_env()?;

    let (pipeline, router) = ferry_api::setup::initialize_app(config.clone()).await?;

    ferry_api::setup::server::start_server(&config, router).await?;

    pipeline.shutdown().await;
    Ok(())
}
