//! Capture Interceptor: turns display calls inside the interpreter into
//! artifact files.
//!
//! Each producer is data: the library it needs and the hook source run in
//! the worker. A producer is activated only when a probe finds its library.
//! Hooks live in the session's own worker, so they never see another
//! session's calls.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::runtime::worker::{call_as, Interpreter, ProbeReply, WorkerFault, WorkerRequest};

/// A capability-gated artifact producer.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureProducer {
    pub name: &'static str,
    /// Import name probed before installing
    pub library: &'static str,
    /// Python source that installs the hook through `_sandbox_capture.hook`
    pub install: &'static str,
}

impl CaptureProducer {
    fn uninstall_source(&self) -> String {
        format!("_sandbox_capture.unhook({:?})\n", self.name)
    }
}

/// Saves every open figure, then calls the original `show` with warnings
/// silenced (Agg cannot display) and closes the figures.
const MATPLOTLIB_HOOK: &str = r#"
import warnings
import matplotlib
matplotlib.use("Agg")
import matplotlib.pyplot as plt

cap = _sandbox_capture

def show(*args, **kwargs):
    for num in plt.get_fignums():
        path = cap.artifact_path("images", "plot", ".png")
        plt.figure(num).savefig(path, dpi=150, bbox_inches="tight")
        cap.record(path, "matplotlib")
    with warnings.catch_warnings():
        warnings.simplefilter("ignore")
        result = original(*args, **kwargs)
    plt.close("all")
    return result

if not cap.is_hooked("matplotlib"):
    original = plt.show
    cap.hook("matplotlib", plt, "show", show)
"#;

/// Saves the image and stands in for the external viewer.
const PIL_HOOK: &str = r#"
from PIL import Image

cap = _sandbox_capture

def show(self, title=None, **kwargs):
    path = cap.artifact_path("images", "image", ".png")
    try:
        self.save(path)
    except (OSError, ValueError):
        self.convert("RGBA").save(path)
    cap.record(path, "pil")

if not cap.is_hooked("pil"):
    cap.hook("pil", Image.Image, "show", show)
"#;

pub fn builtin_producers() -> Vec<CaptureProducer> {
    vec![
        CaptureProducer {
            name: "matplotlib",
            library: "matplotlib",
            install: MATPLOTLIB_HOOK,
        },
        CaptureProducer {
            name: "pil",
            library: "PIL",
            install: PIL_HOOK,
        },
    ]
}

/// Install/uninstall lifecycle of the producers for one interpreter.
pub struct CaptureInterceptor {
    producers: Vec<CaptureProducer>,
    active: Vec<&'static str>,
    installed: bool,
    timeout: Duration,
}

impl CaptureInterceptor {
    pub fn new(producers: Vec<CaptureProducer>, timeout: Duration) -> Self {
        Self {
            producers,
            active: Vec::new(),
            installed: false,
            timeout,
        }
    }

    pub fn builtin(timeout: Duration) -> Self {
        Self::new(builtin_producers(), timeout)
    }

    /// Names of the producers currently hooked.
    pub fn active(&self) -> &[&'static str] {
        &self.active
    }

    /// Probes and hooks every producer whose library is present.
    /// Installing again is a no-op; a missing library is not an error.
    pub async fn install(&mut self, interpreter: &mut dyn Interpreter) -> Result<(), WorkerFault> {
        if self.installed {
            debug!("Capture already installed ({:?})", self.active);
            return Ok(());
        }
        for producer in &self.producers {
            let probe: ProbeReply = call_as(
                interpreter,
                &WorkerRequest::Probe {
                    library: producer.library.to_string(),
                },
                self.timeout,
            )
            .await?;
            if !probe.available {
                debug!("Capture producer {} skipped: {} not installed", producer.name, producer.library);
                continue;
            }
            let request = WorkerRequest::Hook {
                producer: producer.name.to_string(),
                code: producer.install.to_string(),
            };
            match interpreter.call(&request, self.timeout).await {
                Ok(_) => self.active.push(producer.name),
                // The library imports but the hook does not apply; keep going without it
                Err(WorkerFault::Failed(reason)) => {
                    warn!("Capture producer {} not installed: {reason}", producer.name)
                }
                Err(fault) => return Err(fault),
            }
        }
        self.installed = true;
        if !self.active.is_empty() {
            info!("Capture active: {}", self.active.join(", "));
        }
        Ok(())
    }

    /// Restores the original display functions.
    pub async fn uninstall(&mut self, interpreter: &mut dyn Interpreter) {
        if !self.installed {
            return;
        }
        if interpreter.is_running() {
            for name in self.active.iter().rev() {
                let Some(producer) = self.producers.iter().find(|p| p.name == *name) else {
                    continue;
                };
                let request = WorkerRequest::Hook {
                    producer: producer.name.to_string(),
                    code: producer.uninstall_source(),
                };
                if let Err(e) = interpreter.call(&request, self.timeout).await {
                    warn!("Failed to remove capture hook {name}: {e}");
                }
            }
        }
        self.reset();
    }

    /// Forgets installed hooks after the interpreter was replaced.
    pub fn reset(&mut self) {
        self.active.clear();
        self.installed = false;
    }
}
