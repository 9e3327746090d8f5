use std::sync::Arc;

use chancopy_core::config::Config;

// Jobs are cooperative tasks on one event loop; nothing in the pipeline needs
// worker threads.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), chancopy_core::Error> {
    chancopy_core::logging::init("chancopy")?;

    let cfg = Arc::new(Config::load()?);

    chancopy_telegram::router::run_polling(cfg)
        .await
        .map_err(|e| chancopy_core::Error::External(format!("telegram bot failed: {e}")))?;

    tracing::info!("shutdown complete");
    Ok(())
}
