//! Supervisor
//!
//! Owns module lifecycles. Startup builds the bus, then tools, outputs, the
//! engine, and inputs, in that order, so every consumer is subscribed before
//! the first producer runs. A module that fails to construct is recorded as
//! disabled and startup continues. A module task that panics or fails is
//! reported on the bus as a lifecycle error; the rest keep running.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::builtin::Registries;
use crate::bus::{Envelope, LifecycleKind, MessageBus, Subscription};
use crate::config::{Config, ModuleConfig, ModuleSection};
use crate::engine::Engine;
use crate::modules::{self, InputModule, ModuleContext, OutputModule};
use crate::reasoning::{self, EchoReasoner, Reasoner};
use crate::registry::ModuleKind;
use crate::tools::ToolRegistry;
use crate::Result;

/// Origin of envelopes produced by the supervisor
pub const SUPERVISOR_ORIGIN: &str = "supervisor";

/// How long shutdown waits for module tasks before aborting them
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A module instance that is running
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StartedModule {
    pub kind: ModuleKind,
    pub name: String,
    pub module_type: String,
}

/// A module instance that is not running, and why
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisabledModule {
    pub kind: ModuleKind,
    pub name: String,
    pub reason: String,
}

/// Outcome of startup, or of a configuration check
#[derive(Debug, Clone, Default, Serialize)]
pub struct StartupReport {
    pub started: Vec<StartedModule>,
    /// Enabled instances that failed to validate or construct
    pub disabled: Vec<DisabledModule>,
    /// Instances switched off in configuration
    pub skipped: Vec<DisabledModule>,
    /// Set when the configured reasoner could not be built
    pub reasoner_error: Option<String>,
}

impl StartupReport {
    fn record_started(&mut self, kind: ModuleKind, name: &str, module_type: &str) {
        self.started.push(StartedModule {
            kind,
            name: name.to_string(),
            module_type: module_type.to_string(),
        });
    }

    fn record_disabled(&mut self, kind: ModuleKind, name: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(%kind, module = name, reason = %reason, "module disabled");
        self.disabled.push(DisabledModule {
            kind,
            name: name.to_string(),
            reason,
        });
    }

    fn record_skipped(&mut self, kind: ModuleKind, name: &str, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(%kind, module = name, reason = %reason, "module skipped");
        self.skipped.push(DisabledModule {
            kind,
            name: name.to_string(),
            reason,
        });
    }

    /// Whether every enabled instance would start with the configured reasoner
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.disabled.is_empty() && self.reasoner_error.is_none()
    }

    /// Whether `name` of `kind` started
    #[must_use]
    pub fn is_started(&self, kind: ModuleKind, name: &str) -> bool {
        self.started.iter().any(|m| m.kind == kind && m.name == name)
    }

    /// Why `name` of `kind` is disabled, if it is
    #[must_use]
    pub fn disabled_reason(&self, kind: ModuleKind, name: &str) -> Option<&str> {
        self.disabled
            .iter()
            .find(|m| m.kind == kind && m.name == name)
            .map(|m| m.reason.as_str())
    }

    /// Why `name` of `kind` was switched off, if it was
    #[must_use]
    pub fn skipped_reason(&self, kind: ModuleKind, name: &str) -> Option<&str> {
        self.skipped
            .iter()
            .find(|m| m.kind == kind && m.name == name)
            .map(|m| m.reason.as_str())
    }
}

impl fmt::Display for StartupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for m in &self.started {
            writeln!(f, "  started   {:<6} {} ({})", m.kind, m.name, m.module_type)?;
        }
        for m in &self.disabled {
            writeln!(f, "  disabled  {:<6} {}: {}", m.kind, m.name, m.reason)?;
        }
        for m in &self.skipped {
            writeln!(f, "  skipped   {:<6} {}: {}", m.kind, m.name, m.reason)?;
        }
        if let Some(e) = &self.reasoner_error {
            writeln!(f, "  reasoner  falling back to echo: {e}")?;
        }
        Ok(())
    }
}

/// Instances of a section that should be considered, or why none are
fn enabled_instances<'a>(
    section: &'a ModuleSection,
    kind: ModuleKind,
    report: &mut StartupReport,
) -> Vec<(&'a str, &'a ModuleConfig)> {
    let mut enabled = Vec::new();
    for (name, config) in &section.instances {
        if !section.enabled {
            report.record_skipped(kind, name, format!("all {kind}s disabled"));
        } else if !config.enabled {
            report.record_skipped(kind, name, "disabled in configuration");
        } else {
            enabled.push((name.as_str(), config));
        }
    }
    enabled
}

/// Builds and starts the system from configuration
pub struct Supervisor {
    config: Config,
    registries: Registries,
    reasoner: Option<Arc<dyn Reasoner>>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("registries", &self.registries)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    #[must_use]
    pub const fn new(config: Config, registries: Registries) -> Self {
        Self {
            config,
            registries,
            reasoner: None,
        }
    }

    /// Use `reasoner` instead of the one named in `core.reasoner`
    #[must_use]
    pub fn with_reasoner(mut self, reasoner: Arc<dyn Reasoner>) -> Self {
        self.reasoner = Some(reasoner);
        self
    }

    /// Validate configuration without constructing anything
    ///
    /// Started entries are the instances that would start.
    #[must_use]
    pub fn check(&self) -> StartupReport {
        let mut report = StartupReport::default();

        for (name, config) in enabled_instances(&self.config.tools, ModuleKind::Tool, &mut report) {
            let module_type = config.type_name(name);
            let outcome = self.registries.tools.check(module_type, config);
            record(&mut report, ModuleKind::Tool, name, module_type, outcome);
        }
        for (name, config) in
            enabled_instances(&self.config.outputs, ModuleKind::Output, &mut report)
        {
            let module_type = config.type_name(name);
            let outcome = self.registries.outputs.check(module_type, config);
            record(&mut report, ModuleKind::Output, name, module_type, outcome);
        }
        for (name, config) in enabled_instances(&self.config.inputs, ModuleKind::Input, &mut report)
        {
            let module_type = config.type_name(name);
            let outcome = self.registries.inputs.check(module_type, config);
            record(&mut report, ModuleKind::Input, name, module_type, outcome);
        }

        if self.reasoner.is_none() {
            if let Err(e) = reasoning::from_config(&self.config.core) {
                report.reasoner_error = Some(e.to_string());
            }
        }
        report
    }

    /// Start every enabled module
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` if the bus cannot be built; every other
    /// failure only disables the module concerned
    pub async fn start(self) -> Result<RunningSystem> {
        let Self {
            config,
            registries,
            reasoner,
        } = self;

        let bus = MessageBus::new(config.bus.capacity)?;
        let shutdown = CancellationToken::new();
        let mut report = StartupReport::default();
        let mut tasks = Vec::new();

        let control = bus.subscribe(SUPERVISOR_ORIGIN, |e: &Envelope| {
            e.is_lifecycle(LifecycleKind::Stop)
        })?;
        tasks.push(spawn_observer_log(&bus, shutdown.clone()));

        // Tools
        let tools = Arc::new(registries.tools);
        for (name, cfg) in enabled_instances(&config.tools, ModuleKind::Tool, &mut report) {
            let module_type = cfg.type_name(name);
            match tools.create(module_type, name, cfg).await {
                Ok(_) => report.record_started(ModuleKind::Tool, name, module_type),
                Err(e) => report.record_disabled(ModuleKind::Tool, name, e.to_string()),
            }
        }

        // Outputs
        for (name, cfg) in enabled_instances(&config.outputs, ModuleKind::Output, &mut report) {
            let module_type = cfg.type_name(name);
            let created = registries.outputs.create(module_type, name, cfg);
            let output: Arc<dyn OutputModule> = match created {
                Ok(output) => output,
                Err(e) => {
                    report.record_disabled(ModuleKind::Output, name, e.to_string());
                    continue;
                }
            };
            match modules::subscribe_output(&bus, &output) {
                Ok(subscription) => {
                    let task = tokio::spawn(modules::run_output(
                        output,
                        subscription,
                        shutdown.clone(),
                    ));
                    tasks.push(watch(&bus, format!("output {name}"), task));
                    report.record_started(ModuleKind::Output, name, module_type);
                }
                Err(e) => report.record_disabled(ModuleKind::Output, name, e.to_string()),
            }
        }

        // Engine
        let reasoner = match reasoner {
            Some(reasoner) => reasoner,
            None => match reasoning::from_config(&config.core) {
                Ok(reasoner) => reasoner,
                Err(e) => {
                    tracing::error!(error = %e, "reasoner unavailable, falling back to echo");
                    report.reasoner_error = Some(e.to_string());
                    Arc::new(EchoReasoner)
                }
            },
        };
        let engine = Arc::new(Engine::new(
            bus.clone(),
            Arc::clone(&tools),
            reasoner,
            config.engine.clone(),
        ));
        let engine_task = engine.spawn(shutdown.clone())?;
        tasks.push(watch(&bus, "engine".to_string(), engine_task));

        // Inputs
        for (name, cfg) in enabled_instances(&config.inputs, ModuleKind::Input, &mut report) {
            let module_type = cfg.type_name(name);
            let created = registries.inputs.create(module_type, name, cfg);
            let input: Box<dyn InputModule> = match created {
                Ok(input) => input,
                Err(e) => {
                    report.record_disabled(ModuleKind::Input, name, e.to_string());
                    continue;
                }
            };
            let ctx = ModuleContext {
                bus: bus.clone(),
                shutdown: shutdown.clone(),
            };
            let task = tokio::spawn(input.run(ctx));
            tasks.push(watch(&bus, format!("input {name}"), task));
            report.record_started(ModuleKind::Input, name, module_type);
        }

        tracing::info!(
            started = report.started.len(),
            disabled = report.disabled.len(),
            "switchboard started"
        );
        bus.publish(Envelope::lifecycle(
            SUPERVISOR_ORIGIN,
            LifecycleKind::Start,
            None,
        ));

        Ok(RunningSystem {
            bus,
            tools,
            engine,
            report,
            shutdown,
            control,
            tasks,
        })
    }
}

fn record(
    report: &mut StartupReport,
    kind: ModuleKind,
    name: &str,
    module_type: &str,
    outcome: Result<()>,
) {
    match outcome {
        Ok(()) => report.record_started(kind, name, module_type),
        Err(e) => report.record_disabled(kind, name, e.to_string()),
    }
}

/// A supervised task
struct ModuleTask {
    name: String,
    watcher: JoinHandle<()>,
    abort: AbortHandle,
}

fn report_exit(bus: &MessageBus, label: &str, outcome: std::result::Result<Result<()>, JoinError>) {
    let detail = match outcome {
        Ok(Ok(())) => {
            tracing::debug!(module = label, "module stopped");
            return;
        }
        Ok(Err(e)) => format!("{label} failed: {e}"),
        Err(e) if e.is_panic() => format!("{label} panicked"),
        Err(_) => {
            tracing::debug!(module = label, "module cancelled");
            return;
        }
    };
    tracing::error!(module = label, detail = %detail, "module stopped unexpectedly");
    bus.publish(Envelope::lifecycle(
        SUPERVISOR_ORIGIN,
        LifecycleKind::Error,
        Some(detail),
    ));
}

/// Watch a module task and report how it ended
fn watch<T>(bus: &MessageBus, label: String, task: JoinHandle<T>) -> ModuleTask
where
    T: IntoModuleResult + Send + 'static,
{
    let abort = task.abort_handle();
    let bus = bus.clone();
    let watcher = {
        let label = label.clone();
        tokio::spawn(async move {
            let outcome = task.await.map(IntoModuleResult::into_module_result);
            report_exit(&bus, &label, outcome);
        })
    };
    ModuleTask {
        name: label,
        watcher,
        abort,
    }
}

/// Task outputs the supervisor knows how to judge
trait IntoModuleResult {
    fn into_module_result(self) -> Result<()>;
}

impl IntoModuleResult for () {
    fn into_module_result(self) -> Result<()> {
        Ok(())
    }
}

impl IntoModuleResult for Result<()> {
    fn into_module_result(self) -> Result<()> {
        self
    }
}

/// Log bus diagnostics (backpressure drops, degraded subscribers)
fn spawn_observer_log(bus: &MessageBus, shutdown: CancellationToken) -> ModuleTask {
    let mut notices = bus.observe();
    let task = tokio::spawn(async move {
        loop {
            let notice = tokio::select! {
                () = shutdown.cancelled() => break,
                notice = notices.recv() => notice,
            };
            match notice {
                Ok(envelope) => tracing::debug!(
                    kind = ?envelope.kind,
                    detail = envelope.payload.text().unwrap_or_default(),
                    "bus notice"
                ),
                Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "bus notices lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let abort = task.abort_handle();
    ModuleTask {
        name: "bus observer".to_string(),
        watcher: task,
        abort,
    }
}

/// Handle to a started system
pub struct RunningSystem {
    bus: MessageBus,
    tools: Arc<ToolRegistry>,
    engine: Arc<Engine>,
    report: StartupReport,
    shutdown: CancellationToken,
    control: Subscription,
    tasks: Vec<ModuleTask>,
}

impl fmt::Debug for RunningSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningSystem")
            .field("report", &self.report)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl RunningSystem {
    #[must_use]
    pub const fn bus(&self) -> &MessageBus {
        &self.bus
    }

    #[must_use]
    pub const fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    #[must_use]
    pub const fn report(&self) -> &StartupReport {
        &self.report
    }

    /// Token cancelled when shutdown begins
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait until some module publishes `Lifecycle(Stop)`
    ///
    /// Returns the origin that asked, or `None` if shutdown began another way.
    pub async fn wait_for_stop(&mut self) -> Option<String> {
        tokio::select! {
            () = self.shutdown.cancelled() => None,
            envelope = self.control.recv() => envelope.map(|e| e.origin.clone()),
        }
    }

    /// Stop everything and release tool resources
    ///
    /// Module tasks get [`SHUTDOWN_GRACE`] to finish before they are aborted.
    pub async fn shutdown(self) {
        tracing::info!("shutting down");
        self.shutdown.cancel();

        let names: Vec<String> = self.tasks.iter().map(|t| t.name.clone()).collect();
        let aborts: Vec<AbortHandle> = self.tasks.iter().map(|t| t.abort.clone()).collect();
        let watchers = futures::future::join_all(self.tasks.into_iter().map(|t| t.watcher));

        if tokio::time::timeout(SHUTDOWN_GRACE, watchers).await.is_err() {
            tracing::warn!(tasks = ?names, "modules did not stop in time, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        self.tools.teardown_all().await;
        drop(self.control);
        self.bus.close();
        tracing::info!("shutdown complete");
    }
}
