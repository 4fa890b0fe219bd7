//! Phase-keyed lifecycle hooks and the logging hook variant.

use std::fmt;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::BoxFuture;

/// The phase of a fixture's lifecycle a hook is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPhase {
    PreCreate,
    PostCreate,
    PreStart,
    PostStart,
    PreTerminate,
    PostTerminate,
}

impl HookPhase {
    pub const ALL: [HookPhase; 6] = [
        HookPhase::PreCreate,
        HookPhase::PostCreate,
        HookPhase::PreStart,
        HookPhase::PostStart,
        HookPhase::PreTerminate,
        HookPhase::PostTerminate,
    ];
}

impl fmt::Display for HookPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPhase::PreCreate => write!(f, "pre-create"),
            HookPhase::PostCreate => write!(f, "post-create"),
            HookPhase::PreStart => write!(f, "pre-start"),
            HookPhase::PostStart => write!(f, "post-start"),
            HookPhase::PreTerminate => write!(f, "pre-terminate"),
            HookPhase::PostTerminate => write!(f, "post-terminate"),
        }
    }
}

/// Snapshot of the fixture handed to a hook when it runs.
///
/// `container_id` is `None` only in the pre-create phase, before the runtime
/// has allocated anything.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub phase: HookPhase,
    pub image: String,
    pub container_id: Option<String>,
}

/// Boxed future returned by a hook invocation.
pub type HookFuture = BoxFuture<'static, Result<()>>;

/// A caller-supplied action bound to exactly one lifecycle phase.
///
/// Hooks registered for the same phase run in registration order; the first
/// failure aborts the remainder of that phase.
pub struct LifecycleHook {
    phase: HookPhase,
    run: Box<dyn Fn(HookContext) -> HookFuture + Send + Sync>,
}

impl LifecycleHook {
    pub fn new<F>(phase: HookPhase, run: F) -> Self
    where
        F: Fn(HookContext) -> HookFuture + Send + Sync + 'static,
    {
        Self {
            phase,
            run: Box::new(run),
        }
    }

    pub fn phase(&self) -> HookPhase {
        self.phase
    }

    pub(crate) fn invoke(&self, cx: HookContext) -> HookFuture {
        (self.run)(cx)
    }
}

impl fmt::Debug for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHook")
            .field("phase", &self.phase)
            .finish_non_exhaustive()
    }
}

/// Capability accepted by the logging hooks: anything that can record one
/// formatted line.
pub trait LogSink: Send + Sync {
    fn write(&self, line: String);
}

/// Sink that buffers lines in memory, for inspection after a run.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl LogSink for MemorySink {
    fn write(&self, line: String) {
        self.lines.lock().unwrap().push(line);
    }
}

/// Sink that forwards lines to the `log` facade at debug level.
pub struct DebugLogSink;

impl LogSink for DebugLogSink {
    fn write(&self, line: String) {
        log::debug!("{}", line);
    }
}

/// Builds one diagnostic hook per lifecycle phase, each recording a formatted
/// line into the given sink.
pub fn logging_hooks(sink: Arc<dyn LogSink>) -> Vec<LifecycleHook> {
    HookPhase::ALL
        .iter()
        .map(|&phase| {
            let sink = sink.clone();
            LifecycleHook::new(phase, move |cx| {
                let sink = sink.clone();
                Box::pin(async move {
                    let id = cx.container_id.as_deref().unwrap_or("<pending>");
                    let line = match cx.phase {
                        HookPhase::PreCreate => {
                            format!("creating container for image {}", cx.image)
                        }
                        HookPhase::PostCreate => format!("container created: {}", id),
                        HookPhase::PreStart => format!("starting container: {}", id),
                        HookPhase::PostStart => format!("container started: {}", id),
                        HookPhase::PreTerminate => format!("terminating container: {}", id),
                        HookPhase::PostTerminate => format!("container terminated: {}", id),
                    };
                    sink.write(line);
                    Ok(())
                })
            })
        })
        .collect()
}
