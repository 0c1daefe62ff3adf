//! Kit availability loop.
//!
//! Every tick pings the kit. The first time it answers, SSH trust and the
//! library sync are set up; on success the kit becomes available. A status
//! event is published on every tick whether or not anything changed.

use std::sync::Arc;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Inner;
use crate::events::{Event, EventKind, PowerupStatus};
use crate::runners::RunnerKind;
use crate::runners::exec::run_status;

impl Inner {
    async fn reachable(&self) -> bool {
        let cfg = &self.cfg;
        let wait = cfg.timeout.as_secs().max(1).to_string();
        let mut ping = Command::new(&cfg.ping);
        ping.args(["-c", "1", "-W", wait.as_str()]).arg(&cfg.host);

        // ping bounds itself with -W; allow it a little extra.
        let bound = cfg.command_timeout().map(|t| t * 2);
        match run_status(&mut ping, "ping", bound).await {
            Ok(out) => out.status.success(),
            Err(e) => {
                debug!(error = %e.as_message(), "ping did not run");
                false
            }
        }
    }

    /// One heartbeat tick. Returns the status it published.
    pub(super) async fn beat(&self) -> PowerupStatus {
        let mut status = self.status();
        let reachable = self.reachable().await;

        if reachable && !status.available {
            if !status.detected {
                status.detected = true;
                info!(host = %self.cfg.host, "kit detected");
                self.store_status(status);
                self.bus.publish(Event::new(EventKind::PowerupStatus).with_status(status));
            }

            let ready = match self.ensure_ssh().await {
                Ok(()) if !status.setup_complete => self.ensure_lib().await,
                other => other,
            };
            match ready {
                Ok(()) => {
                    status.setup_complete = true;
                    status.available = true;
                    info!(host = %self.cfg.host, "kit available");
                }
                Err(e) => {
                    warn!(error = %e.as_message(), "kit setup failed");
                    self.bus.publish(
                        Event::error(e.as_message()).with_runner(RunnerKind::Remote),
                    );
                }
            }
        } else if !reachable && status.available {
            status.available = false;
            warn!(host = %self.cfg.host, "kit lost");
        }

        self.store_status(status);
        self.bus.publish(Event::new(EventKind::PowerupStatus).with_status(status));
        status
    }
}

/// Runs [`Inner::beat`] every `heartbeat_interval` until `token` is cancelled.
pub(super) async fn run(inner: Arc<Inner>, token: CancellationToken) {
    let period = inner.cfg.heartbeat_interval;
    debug!(period_ms = period.as_millis() as u64, "heartbeat started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = inner.beat() => {}
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }
    debug!("heartbeat stopped");
}
