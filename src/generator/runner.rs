//! One managed repetition: start, stop, and the typed outcome.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use super::process::{self, Control, Ending};
use super::{
    GeneratorError, GeneratorFailure, GeneratorHooks, GeneratorOutcome, GeneratorResult,
    GeneratorSettings,
};

/// Extra wait after a forced kill before `stop()` gives up on the worker.
const KILL_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct Inner {
    control: Option<mpsc::UnboundedSender<Control>>,
    outcome: Option<watch::Receiver<Option<GeneratorOutcome>>>,
}

/// Executes exactly one repetition of one workload. Create a fresh instance
/// per repetition.
pub struct Generator {
    hooks: Arc<dyn GeneratorHooks>,
    settings: GeneratorSettings,
    inner: Mutex<Inner>,
}

impl Generator {
    pub fn new(hooks: Arc<dyn GeneratorHooks>, settings: GeneratorSettings) -> Self {
        Self {
            hooks,
            settings,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn name(&self) -> &str {
        self.hooks.name()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate the environment and launch the repetition in the background.
    ///
    /// Returns an error without spawning anything when validation fails or
    /// when this generator was already started. A validation failure is also
    /// recorded as the outcome so `result()` still has something to report.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), GeneratorError> {
        let mut inner = self.lock();
        if inner.outcome.is_some() {
            return Err(GeneratorError::AlreadyStarted {
                name: self.name().to_string(),
            });
        }

        let (outcome_tx, outcome_rx) = watch::channel(None);
        inner.outcome = Some(outcome_rx);
        let started_at = Utc::now();

        if let Err(err) = self.hooks.validate_environment() {
            warn!(generator = %self.name(), error = %err, "environment validation failed, not starting");
            let partial = GeneratorResult::empty(self.name(), &self.settings, started_at);
            outcome_tx.send_replace(Some(Err(GeneratorFailure::new(err.clone(), partial))));
            return Err(err);
        }

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        inner.control = Some(control_tx);

        let worker = tokio::spawn(run_repetition(
            Arc::clone(&self.hooks),
            self.settings.clone(),
            control_rx,
            started_at,
        ));
        let name = self.name().to_string();
        tokio::spawn(async move {
            let outcome = match worker.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(generator = %name, error = %join_err, "generator worker crashed");
                    Err(GeneratorFailure::catastrophic(GeneratorError::unexpected(
                        "generator worker crashed",
                        join_err,
                    )))
                }
            };
            outcome_tx.send_replace(Some(outcome));
        });

        info!(generator = %self.name(), "generator started");
        Ok(())
    }

    /// True between a successful `start()` and the outcome being available.
    pub fn is_running(&self) -> bool {
        let inner = self.lock();
        inner.control.is_some()
            && inner
                .outcome
                .as_ref()
                .is_some_and(|rx| rx.borrow().is_none())
    }

    /// Ask the repetition to stop. Safe to call at any time and more than
    /// once; a no-op when nothing is running.
    pub async fn stop(&self) {
        let (control, outcome) = {
            let inner = self.lock();
            (inner.control.clone(), inner.outcome.clone())
        };
        let (Some(control), Some(outcome)) = (control, outcome) else {
            return;
        };
        if outcome.borrow().is_some() {
            return;
        }

        info!(generator = %self.name(), "stopping generator");
        let _ = control.send(Control::Terminate);
        if wait_finished(outcome.clone(), self.settings.stop_join_timeout).await {
            return;
        }

        warn!(
            generator = %self.name(),
            waited_sec = self.settings.stop_join_timeout.as_secs_f64(),
            "generator did not stop in time, forcing kill"
        );
        let _ = control.send(Control::Kill);
        if !wait_finished(outcome, KILL_JOIN_TIMEOUT).await {
            warn!(generator = %self.name(), "generator worker still running after forced kill");
        }
    }

    /// Wait for the outcome. A generator that was never started reports
    /// `Unexpected`.
    pub async fn wait(&self) -> GeneratorOutcome {
        let Some(mut rx) = self.lock().outcome.clone() else {
            return Err(GeneratorFailure::catastrophic(GeneratorError::unexpected(
                "wait",
                "generator was never started",
            )));
        };
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone().unwrap_or_else(|| {
                    Err(GeneratorFailure::catastrophic(GeneratorError::unexpected(
                        "wait",
                        "generator worker vanished without an outcome",
                    )))
                });
            }
        }
    }

    /// The outcome, once the repetition has finished.
    pub fn outcome(&self) -> Option<GeneratorOutcome> {
        self.lock()
            .outcome
            .as_ref()
            .and_then(|rx| rx.borrow().clone())
    }

    /// Best-effort result: present on success and on every failure except a
    /// crashed worker.
    pub fn result(&self) -> Option<GeneratorResult> {
        match self.outcome()? {
            Ok(result) => Some(result),
            Err(failure) => failure.partial,
        }
    }

    pub fn error(&self) -> Option<GeneratorError> {
        self.outcome()?.err().map(|failure| failure.error)
    }

    /// Run the plugin's one-time setup. Failures are logged, never returned.
    pub async fn prepare(&self) {
        if let Err(e) = self.hooks.prepare().await {
            warn!(generator = %self.name(), error = %e, "prepare hook failed");
        }
    }

    /// Run the plugin's teardown. Failures are logged, never returned.
    pub async fn cleanup(&self) {
        if let Err(e) = self.hooks.cleanup().await {
            warn!(generator = %self.name(), error = %e, "cleanup hook failed");
        }
    }
}

async fn wait_finished(mut rx: watch::Receiver<Option<GeneratorOutcome>>, limit: Duration) -> bool {
    let done = async {
        loop {
            if rx.borrow_and_update().is_some() {
                return true;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().is_some();
            }
        }
    };
    tokio::time::timeout(limit, done).await.unwrap_or(false)
}

/// Body of the background worker. Every failure becomes part of the outcome.
async fn run_repetition(
    hooks: Arc<dyn GeneratorHooks>,
    settings: GeneratorSettings,
    control: mpsc::UnboundedReceiver<Control>,
    started_at: DateTime<Utc>,
) -> GeneratorOutcome {
    let name = hooks.name().to_string();
    let fail = |error: GeneratorError| -> GeneratorOutcome {
        Err(GeneratorFailure::new(
            error,
            GeneratorResult::empty(&name, &settings, started_at),
        ))
    };

    let spec = match hooks.command_spec(settings.timeout_buffer) {
        Ok(spec) => spec,
        Err(e) => {
            warn!(generator = %name, error = %e, "could not build command");
            return fail(e);
        }
    };
    if spec.argv.is_empty() {
        return fail(GeneratorError::validation("command has no program"));
    }

    let run = match process::execute(&spec, control, settings.kill_grace).await {
        Ok(run) => run,
        Err(e) => {
            warn!(generator = %name, command = %spec.command_line(), error = %e, "failed to spawn workload");
            let mut partial = GeneratorResult::empty(&name, &settings, started_at);
            partial.command_line = spec.command_line();
            partial.argv = spec.argv.clone();
            return Err(GeneratorFailure::new(
                GeneratorError::unexpected(format!("failed to spawn '{}'", spec.argv[0]), e),
                partial,
            ));
        }
    };

    let mut result = GeneratorResult::from_raw(&name, &spec, &run.raw, &settings, started_at);
    match run.ending {
        Ending::Stopped => Err(GeneratorFailure::new(GeneratorError::Stopped, result)),
        Ending::Exited if run.raw.success() => match hooks.process_output(&run.raw) {
            Ok(metrics) => {
                result.metrics = metrics;
                info!(
                    generator = %name,
                    duration_sec = run.raw.elapsed.as_secs_f64(),
                    metrics = result.metrics.len(),
                    "repetition completed"
                );
                Ok(result)
            }
            Err(e) => {
                warn!(generator = %name, error = %e, "output post-processing failed");
                Err(GeneratorFailure::new(e, result))
            }
        },
        Ending::Exited | Ending::TimedOut => {
            let err = hooks.translate_failure(&run.raw);
            warn!(generator = %name, exit_code = run.raw.exit_code, error = %err, "repetition failed");
            Err(GeneratorFailure::new(err, result))
        }
    }
}
