//! Signal handling and kill escalation.
//!
//! The first fatal signal asks every stage to wind down cooperatively; a
//! later signal past the grace window removes the pilot source directory
//! and terminates the whole process group.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::signal::unix::{Signal, SignalKind, signal};
use tracing::warn;

use crate::context::PilotContext;

/// Seconds a stuck pilot gets to wind down after the first kill signal.
pub const MAX_KILL_WAIT_TIME: i64 = 120;

async fn recv_or_pending(slot: &mut Option<Signal>) {
    match slot {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending().await,
    }
}

fn install_hook(name: &'static str, kind: SignalKind) -> Option<Signal> {
    match signal(kind) {
        Ok(hook) => Some(hook),
        Err(err) => {
            warn!("cannot install handler for {name}: {err}");
            None
        }
    }
}

/// Install the interrupt hooks. SIGSEGV cannot be hooked safely from user
/// space and keeps its default action.
pub fn install(ctx: Arc<PilotContext>) {
    tokio::spawn(async move {
        let mut sigint = install_hook("SIGINT", SignalKind::interrupt());
        let mut sigterm = install_hook("SIGTERM", SignalKind::terminate());
        let mut sigquit = install_hook("SIGQUIT", SignalKind::quit());
        let mut sigxcpu = install_hook("SIGXCPU", SignalKind::from_raw(libc::SIGXCPU));
        let mut sigusr1 = install_hook("SIGUSR1", SignalKind::user_defined1());
        let mut sigbus = install_hook("SIGBUS", SignalKind::from_raw(libc::SIGBUS));

        loop {
            let name = tokio::select! {
                _ = recv_or_pending(&mut sigint) => "SIGINT",
                _ = recv_or_pending(&mut sigterm) => "SIGTERM",
                _ = recv_or_pending(&mut sigquit) => "SIGQUIT",
                _ = recv_or_pending(&mut sigxcpu) => "SIGXCPU",
                _ = recv_or_pending(&mut sigusr1) => "SIGUSR1",
                _ = recv_or_pending(&mut sigbus) => "SIGBUS",
            };
            on_signal(&ctx, name);
        }
    });
}

fn on_signal(ctx: &PilotContext, name: &str) {
    let now = chrono::Utc::now().timestamp();
    let first = ctx
        .kill_time
        .compare_exchange(0, now, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok();

    if !first {
        let kill_time = ctx.kill_time.load(Ordering::SeqCst);
        // extra minute of grace on top of the wind-down budget
        if now - kill_time > MAX_KILL_WAIT_TIME + 60 {
            warn!("passed maximum waiting time after first kill signal, terminating process group");
            if let Some(sourcedir) = &ctx.config.sourcedir {
                let _ = std::fs::remove_dir_all(sourcedir);
            }
            // SAFETY: last-resort teardown; no further Rust code depends on
            // the process state after SIGKILL to our own group.
            unsafe {
                libc::killpg(libc::getpgrp(), libc::SIGKILL);
            }
        }
    }

    warn!("caught signal: {name}, instructing stages to abort and stop");
    *ctx.signal.lock().unwrap_or_else(|e| e.into_inner()) = Some(name.to_string());
    ctx.abort_job.set();
    ctx.graceful_stop.set();
}

#[cfg(test)]
mod tests {
    use gridpilot_core::config::PilotConfig;
    use gridpilot_core::infosys::InfoService;

    use super::*;

    #[test]
    fn first_signal_sets_flags_and_kill_time() {
        let ctx = PilotContext::new(PilotConfig::default(), InfoService::default());
        assert_eq!(ctx.kill_time.load(Ordering::SeqCst), 0);

        on_signal(&ctx, "SIGTERM");

        assert!(ctx.graceful_stop.is_set());
        assert!(ctx.abort_job.is_set());
        assert!(ctx.kill_time.load(Ordering::SeqCst) > 0);
        assert_eq!(
            ctx.signal.lock().unwrap().as_deref(),
            Some("SIGTERM")
        );
    }

    #[test]
    fn second_signal_within_grace_does_not_reset_kill_time() {
        let ctx = PilotContext::new(PilotConfig::default(), InfoService::default());
        on_signal(&ctx, "SIGINT");
        let first = ctx.kill_time.load(Ordering::SeqCst);
        on_signal(&ctx, "SIGINT");
        assert_eq!(ctx.kill_time.load(Ordering::SeqCst), first);
    }
}
