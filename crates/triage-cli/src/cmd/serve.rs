use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::RuntimeArgs;

pub fn run(config_path: &Path, args: &RuntimeArgs, port: u16) -> Result<()> {
    let scheduler = super::build_scheduler(config_path, args)?;
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async move {
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupted, shutting down");
                }
                cancel.cancel();
            }
        });

        println!("triage-party serving on http://127.0.0.1:{port}");
        triage_server::serve(scheduler, port, cancel).await
    })
}
