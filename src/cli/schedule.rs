use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::scheduler::Scheduler;
use crate::sync::Orchestrator;

use super::{open_db, runtime};

/// Host the scheduler until Ctrl-C. Runs already in progress are allowed to
/// finish.
pub fn run() -> anyhow::Result<()> {
    let (settings, conn) = open_db()?;
    settings.validate()?;
    drop(conn);

    let orchestrator = Arc::new(Orchestrator::from_settings(&settings));
    let scheduler = Scheduler::new(orchestrator, &settings);
    let cancel = CancellationToken::new();

    runtime()?.block_on(async {
        let stop = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received");
            }
            stop.cancel();
        });
        scheduler.run(cancel).await.context("scheduler stopped with an error")
    })
}
