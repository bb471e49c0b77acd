//! Supervisor task.
//!
//! One task owns the [`RestartController`]; everything else (watcher,
//! control readers, child monitors, teardown threads, Ctrl+C) only sends
//! [`SupervisorMsg`]s. The loop waits for the next message or the pending
//! retry timer, whichever comes first.

mod controller;
mod messages;
mod state;

pub use controller::{RestartController, SupervisorError};
pub use messages::{AppSignal, SupervisorMsg};
pub use state::{LastError, Phase, RETRY_DELAY, ReloadState, TimerAction};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, Instant, sleep_until};

use crate::debug;
use crate::loader::AppLoader;

/// Channel every component uses to reach the supervisor.
pub fn channel() -> (UnboundedSender<SupervisorMsg>, UnboundedReceiver<SupervisorMsg>) {
    mpsc::unbounded_channel()
}

pub struct Supervisor<L: AppLoader> {
    controller: RestartController<L>,
    rx: UnboundedReceiver<SupervisorMsg>,
}

impl<L: AppLoader> Supervisor<L> {
    pub fn new(controller: RestartController<L>, rx: UnboundedReceiver<SupervisorMsg>) -> Self {
        Self { controller, rx }
    }

    /// Run until Ctrl+C (`Ok`) or a fatal error.
    ///
    /// The application is always stopped before this returns.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        self.controller.boot()?;

        loop {
            let deadline = self.controller.deadline();
            let idle = Instant::now() + Duration::from_secs(3600);

            tokio::select! {
                biased;
                msg = self.rx.recv() => {
                    let Some(msg) = msg else { break };
                    if !self.controller.handle(msg)? {
                        break;
                    }
                }
                () = sleep_until(deadline.unwrap_or(idle)), if deadline.is_some() => {
                    self.controller.on_timer(Instant::now())?;
                }
            }
        }

        debug!("app"; "stopping");
        self.controller.shutdown();
        Ok(())
    }
}
