use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Instant;

use tracing::{debug, error, info};

use crate::config::ConfigDoc;
use crate::engine::ContainerEngine;
use crate::error::{Error, Result};
use crate::manifest::FetchRecord;
use crate::planner::Plan;
use crate::staging::StagingDir;
use crate::workspace::PackagePaths;

pub type TaskExecFn = fn(&ConfigDoc, &mut ExecCtx) -> Result<()>;

/// Staging parent when `--staging-root` is not given. Fixed rather than
/// `$TMPDIR` because container engines only bind-mount from some paths.
pub const DEFAULT_STAGING_ROOT: &str = "/tmp";

/// Operator-supplied knobs for one run. Host runs use the package, staging
/// and engine fields; the in-container driver uses the work/output/input dirs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub pkg: PackagePaths,
    pub engine_override: Option<String>,
    pub staging_root: PathBuf,
    pub keep_staging: bool,
    pub driver_binary: Option<PathBuf>,
    pub verify_against: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
    /// When set, build inputs are looked up by file name here instead of
    /// under the package directory.
    pub input_dir: Option<PathBuf>,
}

impl RunOptions {
    pub fn new(pkg: PackagePaths) -> Self {
        Self {
            pkg,
            engine_override: None,
            staging_root: PathBuf::from(DEFAULT_STAGING_ROOT),
            keep_staging: false,
            driver_binary: None,
            verify_against: None,
            work_dir: PathBuf::from("."),
            output_dir: None,
            input_dir: None,
        }
    }
}

#[derive(Default)]
struct SharedExecState {
    staging: Mutex<Option<Arc<StagingDir>>>,
    engine: Mutex<Option<ContainerEngine>>,
    fetched: Mutex<Vec<FetchRecord>>,
}

#[derive(Debug, Clone)]
pub enum ExecEvent {
    TaskSpawned {
        id: String,
    },
    TaskStarted {
        id: String,
    },
    TaskLog {
        id: String,
        line: String,
    },
    TaskFinished {
        id: String,
        ok: bool,
        error: Option<String>,
        elapsed_ms: u128,
    },
    ExecutorDone {
        ok: bool,
        error: Option<String>,
    },
}

pub trait ExecSink: Send + Sync {
    fn emit(&self, ev: ExecEvent);
}

/// Turns executor events into `tracing` events and logs a summary at the end.
#[derive(Default)]
pub struct LogSink {
    state: Mutex<LogSinkState>,
}

#[derive(Default)]
struct LogSinkState {
    started_at: Option<Instant>,
    tasks_ok: usize,
    tasks_failed: usize,
    total_task_ms: u128,
    failed_tasks: Vec<String>,
}

impl ExecSink for LogSink {
    fn emit(&self, ev: ExecEvent) {
        match ev {
            ExecEvent::TaskSpawned { id } => debug!(task = %id, "spawn"),
            ExecEvent::TaskStarted { id } => {
                if let Ok(mut s) = self.state.lock()
                    && s.started_at.is_none()
                {
                    s.started_at = Some(Instant::now());
                }
                info!(task = %id, "run");
            }
            ExecEvent::TaskLog { id, line } => info!(task = %id, "{line}"),
            ExecEvent::TaskFinished {
                id,
                ok,
                error,
                elapsed_ms,
            } => {
                if let Ok(mut s) = self.state.lock() {
                    if ok {
                        s.tasks_ok += 1;
                    } else {
                        s.tasks_failed += 1;
                        s.failed_tasks.push(id.clone());
                    }
                    s.total_task_ms = s.total_task_ms.saturating_add(elapsed_ms);
                }
                if ok {
                    info!(task = %id, elapsed_ms, "done");
                } else {
                    error!(task = %id, elapsed_ms, "failed: {}", error.unwrap_or_default());
                }
            }
            ExecEvent::ExecutorDone { ok, error } => {
                let Ok(mut s) = self.state.lock() else {
                    return;
                };
                let wall = s.started_at.map(|t| t.elapsed()).unwrap_or_default();
                let elapsed = format_elapsed_hms(wall.as_secs());
                if ok {
                    info!(tasks_ok = s.tasks_ok, %elapsed, "run finished");
                } else {
                    error!(
                        tasks_ok = s.tasks_ok,
                        tasks_failed = s.tasks_failed,
                        failed = %s.failed_tasks.join(", "),
                        %elapsed,
                        "run failed: {}",
                        error.unwrap_or_default()
                    );
                }
                *s = LogSinkState::default();
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
    pub current_task_id: Option<String>,
    pub opts: Arc<RunOptions>,
    shared: Arc<SharedExecState>,
}

impl ExecCtx {
    pub fn new(dry_run: bool, sink: Arc<dyn ExecSink>, opts: RunOptions) -> Self {
        Self {
            dry_run,
            sink,
            current_task_id: None,
            opts: Arc::new(opts),
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn set_task(&mut self, id: impl Into<String>) {
        self.current_task_id = Some(id.into());
    }

    pub fn log(&self, msg: &str) {
        let id = self
            .current_task_id
            .clone()
            .unwrap_or_else(|| "<none>".into());
        self.sink.emit(ExecEvent::TaskLog {
            id,
            line: msg.to_string(),
        });
    }

    /// The run's staging directory, created on first use.
    pub fn staging_or_init(&self, target: &str) -> Result<Arc<StagingDir>> {
        let mut g = self
            .shared
            .staging
            .lock()
            .map_err(|_| Error::fs("staging state lock poisoned"))?;
        if let Some(s) = g.as_ref() {
            return Ok(Arc::clone(s));
        }
        let staging = Arc::new(StagingDir::create(
            &self.opts.staging_root,
            target,
            self.opts.keep_staging,
        )?);
        self.log(&format!("staging dir {}", staging.path().display()));
        *g = Some(Arc::clone(&staging));
        Ok(staging)
    }

    pub fn container_engine(&self) -> Result<ContainerEngine> {
        let mut g = self
            .shared
            .engine
            .lock()
            .map_err(|_| Error::discovery("engine state lock poisoned"))?;
        if let Some(e) = g.as_ref() {
            return Ok(e.clone());
        }
        let engine = crate::engine::select_engine(self.opts.engine_override.as_deref())?;
        self.log(&format!(
            "container engine {} ({})",
            engine.requested,
            engine.path.display()
        ));
        *g = Some(engine.clone());
        Ok(engine)
    }

    pub fn record_fetch(&self, rec: FetchRecord) {
        if let Ok(mut g) = self.shared.fetched.lock() {
            g.push(rec);
        }
    }

    pub fn fetch_records(&self) -> Vec<FetchRecord> {
        self.shared
            .fetched
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    /// Location of a declared build input (config fragment, boot script, patch).
    pub fn input_path(&self, rel: &str) -> Result<PathBuf> {
        match self.opts.input_dir.as_deref() {
            Some(dir) => Ok(dir.join(crate::workspace::basename(rel)?)),
            None => self.opts.pkg.resolve(rel),
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.opts.work_dir
    }

    /// Run an external tool to completion. Its stdout/stderr are passed
    /// through untouched; a non-zero exit is a subprocess error.
    pub fn run_cmd(&self, mut cmd: Command) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {}", describe(&cmd)));
            return Ok(());
        }
        cmd.stdin(Stdio::null());
        self.spawn_and_wait(cmd)
    }

    /// Like `run_cmd`, with `input` connected to the tool's stdin.
    pub fn run_cmd_stdin(&self, mut cmd: Command, input: &Path) -> Result<()> {
        if self.dry_run {
            self.log(&format!("DRY-RUN: {} < {}", describe(&cmd), input.display()));
            return Ok(());
        }
        let f = fs::File::open(input)
            .map_err(|e| Error::fs(format!("failed to open {}: {e}", input.display())))?;
        cmd.stdin(Stdio::from(f));
        self.spawn_and_wait(cmd)
    }

    fn spawn_and_wait(&self, mut cmd: Command) -> Result<()> {
        let desc = describe(&cmd);
        debug!(cmd = %desc, "exec");
        let status = cmd
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .map_err(|e| Error::subprocess(format!("failed to spawn {desc}: {e}")))?;
        if !status.success() {
            return Err(Error::subprocess(format!("{desc}: {status}")));
        }
        Ok(())
    }
}

pub fn describe(cmd: &Command) -> String {
    let mut out = cmd.get_program().to_string_lossy().into_owned();
    for a in cmd.get_args() {
        out.push(' ');
        out.push_str(&a.to_string_lossy());
    }
    if let Some(dir) = cmd.get_current_dir() {
        out.push_str(&format!(" (in {})", dir.display()));
    }
    out
}

pub fn apply_command_env(cmd: &mut Command, envs: &BTreeMap<String, String>) {
    for (k, v) in envs {
        cmd.env(k, v);
    }
}

#[derive(Default)]
pub struct TaskRegistry {
    exec: BTreeMap<&'static str, TaskExecFn>,
}

impl TaskRegistry {
    pub fn add(&mut self, id: &'static str, f: TaskExecFn) -> Result<()> {
        if self.exec.contains_key(id) {
            return Err(Error::config(format!(
                "duplicate task executor for '{id}'"
            )));
        }
        self.exec.insert(id, f);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<TaskExecFn> {
        self.exec.get(id).copied()
    }
}

pub trait ModuleExec {
    fn register_tasks(reg: &mut TaskRegistry) -> Result<()>;
}

/// Run every task in plan order, one at a time, stopping at the first error.
pub fn execute_plan(
    doc: &ConfigDoc,
    plan: &Plan,
    reg: &TaskRegistry,
    ctx: &mut ExecCtx,
) -> Result<()> {
    for task in plan.ordered()? {
        let Some(exec) = reg.get(&task.id) else {
            return Err(Error::config(format!(
                "no executor registered for task '{}'",
                task.id
            )));
        };
        ctx.sink.emit(ExecEvent::TaskSpawned {
            id: task.id.clone(),
        });
        ctx.sink.emit(ExecEvent::TaskStarted {
            id: task.id.clone(),
        });
        ctx.set_task(task.id.clone());
        let start = Instant::now();
        let res = exec(doc, ctx);
        let elapsed_ms = start.elapsed().as_millis();
        match res {
            Ok(()) => ctx.sink.emit(ExecEvent::TaskFinished {
                id: task.id.clone(),
                ok: true,
                error: None,
                elapsed_ms,
            }),
            Err(e) => {
                ctx.sink.emit(ExecEvent::TaskFinished {
                    id: task.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                    elapsed_ms,
                });
                let e = e.context(format!("task '{}' failed", task.id));
                ctx.sink.emit(ExecEvent::ExecutorDone {
                    ok: false,
                    error: Some(e.to_string()),
                });
                return Err(e);
            }
        }
    }
    ctx.sink.emit(ExecEvent::ExecutorDone {
        ok: true,
        error: None,
    });
    Ok(())
}

pub fn host_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add("core.init", crate::modules::core::core_init)?;
    crate::modules::container::ContainerModule::register_tasks(&mut reg)?;
    Ok(reg)
}

pub fn driver_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.add("core.init", crate::modules::core::core_init)?;
    crate::modules::source::SourceModule::register_tasks(&mut reg)?;
    crate::modules::patches::PatchesModule::register_tasks(&mut reg)?;
    crate::modules::configure::ConfigureModule::register_tasks(&mut reg)?;
    crate::modules::build::BuildModule::register_tasks(&mut reg)?;
    crate::modules::tool::ToolModule::register_tasks(&mut reg)?;
    crate::modules::bootscript::BootscriptModule::register_tasks(&mut reg)?;
    crate::modules::collect::CollectModule::register_tasks(&mut reg)?;
    Ok(reg)
}

fn format_elapsed_hms(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
