use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use tracing::{error, info};

use crate::error::{Error, Result};
use crate::pipeline::RunState;
use crate::planner::Plan;

pub type PhaseFn = fn(&mut RunState, &mut ExecCtx) -> Result<()>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    PhaseStarted {
        id: String,
    },
    PhaseLog {
        id: String,
        line: String,
    },
    PhaseFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    RunDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Writes events through `tracing` and prints a summary when the run ends.
#[derive(Default)]
pub struct TracingSink {
    state: Mutex<TracingSinkState>,
}

#[derive(Default)]
struct TracingSinkState {
    started_at: Option<Instant>,
    phases_ok: usize,
    phases_failed: usize,
    failed_phase: Option<String>,
}

impl ExecSink for TracingSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::PhaseStarted { id } => {
                if let Ok(mut s) = self.state.lock() {
                    s.started_at.get_or_insert_with(Instant::now);
                }
                info!(phase = %id, "phase started");
            }
            ExecEvent::PhaseLog { id, line } => {
                info!(phase = %id, "{line}");
            }
            ExecEvent::PhaseFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.phases_ok = s.phases_ok.saturating_add(1);
                    } else {
                        s.phases_failed = s.phases_failed.saturating_add(1);
                        s.failed_phase = Some(id.clone());
                    }
                }
                if ok {
                    info!(phase = %id, elapsed_ms = elapsed_ms as u64, "phase done");
                } else {
                    error!(
                        phase = %id,
                        elapsed_ms = elapsed_ms as u64,
                        error = %error.unwrap_or_default(),
                        "phase failed"
                    );
                }
            }
            ExecEvent::RunDone { ok, error } => {
                if let Ok(mut s) = self.state.lock() {
                    let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                    let status = if ok { "ok" } else { "failed" };
                    info!(
                        status,
                        phases_ok = s.phases_ok,
                        phases_failed = s.phases_failed,
                        failed_phase = s.failed_phase.as_deref().unwrap_or("-"),
                        elapsed = %format_elapsed_hms(wall.as_secs()),
                        "run summary"
                    );
                    *s = TracingSinkState::default();
                }
                if let Some(e) = error {
                    error!(error = %e, "run failed");
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<ExecEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<ExecEvent>) -> Self {
        Self { tx }
    }
}

impl ExecSink for ChannelSink {
    fn emit(&self, ev: ExecEvent) {
        let _ = self.tx.send(ev);
    }
}

#[derive(Clone)]
pub struct ExecCtx {
    pub dry_run: bool,
    pub sink: Arc<dyn ExecSink>,
    pub current_phase: Option<String>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>) -> Self {
        Self {
            dry_run,
            sink,
            current_phase: None,
        }
    }

    pub fn set_phase(&mut self, id: impl Into<String>) {
        self.current_phase = Some(id.into());
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_phase
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::PhaseLog {
            id,
            line: msg.to_string(),
        });
    }
}

#[derive(Default)]
pub struct PhaseRegistry {
    exec: BTreeMap<&'static str, PhaseFn>,
}

impl PhaseRegistry {
    pub fn add(&mut self, id: &'static str, f: PhaseFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::msg(format!("duplicate phase executor for '{id}'")));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<PhaseFn> {
        self.exec.get(id).copied()
    }
}

/// Run every phase of `plan` in order, stopping at the first failure.
pub fn execute_plan(
    plan: &Plan,
    reg: &PhaseRegistry,
    state: &mut RunState,
    ctx: &mut ExecCtx,
) -> Result<()> {
    let ordered = plan.ordered()?;
    // Refuse to start a run that would stop halfway for want of an executor.
    for phase in &ordered {
        if reg.get(phase.id).is_none() {
            return Err(Error::msg(format!(
                "no executor registered for phase '{}'",
                phase.id
            )));
        }
    }

    let mut outcome: Result<()> = Ok(());
    for phase in ordered {
        let Some(f) = reg.get(phase.id) else {
            continue;
        };
        ctx.set_phase(phase.id);
        ctx.sink.emit(ExecEvent::PhaseStarted {
            id: phase.id.to_string(),
        });
        let t0 = Instant::now();
        let res = f(state, ctx);
        let elapsed_ms = t0.elapsed().as_millis();
        ctx.sink.emit(ExecEvent::PhaseFinished {
            id: phase.id.to_string(),
            ok: res.is_ok(),
            error: res.as_ref().err().map(|e| e.to_string()),
            elapsed_ms,
        });
        if let Err(e) = res {
            outcome = Err(e.context(format!("phase {}", phase.id)));
            break;
        }
    }

    ctx.sink.emit(ExecEvent::RunDone {
        ok: outcome.is_ok(),
        error: outcome.as_ref().err().map(|e| e.to_string()),
    });
    outcome
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let h = total_secs / 3600;
    let m = (total_secs % 3600) / 60;
    let s = total_secs % 60;
    format!("{h:02}:{m:02}:{s:02}")
}
