/// Local Ctrl-C handling.
///
/// First SIGINT: enqueue a Close, so the dashboard is finalized and the child
/// stopped the same way a remote Close would do it.
/// Second SIGINT: exit immediately with status 130.
use crate::channel::{CommandKind, InboundCommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const INTERRUPTED_EXIT_CODE: i32 = 130;

pub struct SignalHandler {
    task: JoinHandle<()>,
}

impl SignalHandler {
    /// Listen for Ctrl-C and route it into the command queue.
    pub fn install(tx: mpsc::Sender<InboundCommand>) -> Self {
        let task = tokio::spawn(async move {
            let mut interrupts = 0u32;
            while tokio::signal::ctrl_c().await.is_ok() {
                interrupts += 1;
                if interrupts > 1 {
                    tracing::warn!("second interrupt, exiting immediately");
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
                tracing::info!("interrupt received, closing (press Ctrl-C again to force)");
                if tx.send(InboundCommand::new(CommandKind::Close)).await.is_err() {
                    std::process::exit(INTERRUPTED_EXIT_CODE);
                }
            }
        });
        Self { task }
    }

    pub fn uninstall(self) {
        self.task.abort();
    }
}
