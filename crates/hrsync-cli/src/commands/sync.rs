use std::sync::Arc;

use hrsync_core::remote::RemoteApi;
use hrsync_core::scheduler::BackgroundScheduler;
use hrsync_core::sync::{PullReport, PushReport};

use crate::cli::SyncCommands;
use crate::commands::common::{authenticated_remote, CliContext};
use crate::error::CliError;

pub async fn run_sync(command: Option<SyncCommands>, context: &CliContext) -> Result<(), CliError> {
    let engine = context.engine().await?;
    let remote = authenticated_remote(engine.settings())?;

    match command.unwrap_or(SyncCommands::Once) {
        SyncCommands::Once => {
            let report = engine.run_cycle(remote.as_ref()).await?;
            print_pull(&report.pull);
            print_push(&report.push);
        }
        SyncCommands::Pull => print_pull(&engine.pull(remote.as_ref()).await?),
        SyncCommands::Push => print_push(&engine.push(remote.as_ref()).await?),
        SyncCommands::Daemon => {
            let remote: Arc<dyn RemoteApi> = remote;
            let scheduler = Arc::new(BackgroundScheduler::new(Arc::new(engine)));
            scheduler.start(remote)?;
            println!(
                "Background sync running every {}s; press Ctrl-C to stop",
                scheduler.current_interval().as_secs()
            );
            tokio::signal::ctrl_c().await?;
            println!("Stopping after the current cycle...");
            scheduler.shutdown().await;
        }
    }
    Ok(())
}

fn print_pull(report: &PullReport) {
    println!(
        "Pulled {} employees, {} balances, {} leave requests ({} deleted)",
        report.employees_pulled,
        report.balances_pulled,
        report.leave_requests_pulled,
        report.tombstones_applied
    );
    if report.conflicts_detected > 0 {
        println!(
            "Detected {} conflicts, resolved {} automatically",
            report.conflicts_detected, report.conflicts_resolved
        );
    }
}

fn print_push(report: &PushReport) {
    println!(
        "Pushed {} writes ({} failed, {} dead-lettered, {} deferred, {} rejected)",
        report.pushed, report.failed, report.dead_lettered, report.skipped, report.conflicts
    );
}
