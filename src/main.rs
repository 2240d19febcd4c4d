use anyhow::Context;
use env_logger::{Env, TimestampPrecision};
use nix::sched::CloneFlags;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use structopt::StructOpt;
use warden::config::{
    CovMethods, SessionConfig, COV_BRANCH_COUNT, COV_BTS_BLOCK, COV_BTS_EDGE, COV_INSTR_COUNT,
    COV_IPT_BLOCK, COV_SOFT,
};
use warden::counters::NullCounters;
use warden::sancov::NullSink;
use warden::session::session_init;
use warden::signal::SignalGate;
use warden::trace::NullTracer;
use warden::worker::WorkerState;
use warden::{run_iteration, IterationOutcome};

#[derive(Debug, StructOpt)]
#[structopt(name = "warden", about = "Target-process supervisor for coverage-guided fuzzing.")]
struct Settings {
    /// Parallel supervision jobs.
    #[structopt(long, short = "j", default_value = "1")]
    job: u64,
    /// Directory of inputs to feed to the target.
    #[structopt(long, short = "i", default_value = "./corpus")]
    input: PathBuf,
    /// Directory for crash artifacts and session output.
    #[structopt(long, short = "o", default_value = "./")]
    work_dir: PathBuf,
    /// Reuse one long-lived target process across rounds.
    #[structopt(long)]
    persistent: bool,
    /// Target reads inputs from stdin.
    #[structopt(long)]
    fuzz_stdin: bool,
    /// Target is built with sanitizers.
    #[structopt(long)]
    sanitizers: bool,
    /// Do not treat SIGABRT as a crash.
    #[structopt(long)]
    ignore_sigabrt: bool,
    /// Coverage methods: instr, branch, bts-block, bts-edge, ipt-block, soft.
    #[structopt(long, use_delimiter = true)]
    coverage: Vec<String>,
    /// Monitor an already-running process instead of the forked child.
    #[structopt(long)]
    monitor_pid: Option<i32>,
    /// File to re-read the monitored pid from when it goes away.
    #[structopt(long)]
    pid_file: Option<PathBuf>,
    /// Namespaces to unshare before forking: net, mount, ipc, uts, pid, user.
    #[structopt(long, use_delimiter = true)]
    isolate: Vec<String>,
    /// Disable ASLR in the target.
    #[structopt(long)]
    disable_aslr: bool,
    /// Per-iteration wall-clock limit in seconds.
    #[structopt(long, short = "t")]
    timeout: Option<u64>,
    /// Target command line; one argument may contain ___FILE___.
    #[structopt(required = true, last = true)]
    cmdline: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let settings = Settings::from_args();

    let log_env = Env::new()
        .filter_or("WARDEN_LOG", "info")
        .default_write_style_or("auto");
    env_logger::Builder::from_env(log_env)
        .format_timestamp(Some(TimestampPrecision::Seconds))
        .init();

    boot(settings)
}

fn boot(settings: Settings) -> anyhow::Result<()> {
    let jobs = settings.job.max(1);
    let input_dir = settings.input.clone();
    let mut config = build_config(settings)?;

    let inputs = collect_inputs(&input_dir)?;

    // Workers inherit the main thread's mask; the gated signals must be
    // blocked process-wide before any thread exists.
    let _gate = SignalGate::new().context("blocking gated signals on the main thread")?;
    setup_signal_handler(config.stop_flag());

    let mut tracer = NullTracer::default();
    let mut counters = NullCounters::default();
    session_init(&mut config, &mut tracer, &mut counters).context("session initialization")?;

    let config = Arc::new(config);
    let inputs = Arc::new(inputs);
    let mut handles = Vec::with_capacity(jobs as usize);
    for id in 0..jobs {
        let config = Arc::clone(&config);
        let inputs = Arc::clone(&inputs);
        handles.push(
            thread::Builder::new()
                .name(format!("warden-{}", id))
                .spawn(move || worker_loop(id, config, inputs))
                .context("spawning worker thread")?,
        );
    }

    let mut failures = Vec::new();
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => failures.push(e),
            Err(_) => failures.push(anyhow::anyhow!("worker thread panicked")),
        }
    }
    for e in &failures {
        log::error!("{:#}", e);
    }
    if failures.is_empty() {
        log::info!("all workers exited");
        Ok(())
    } else {
        Err(anyhow::anyhow!("{} worker(s) failed", failures.len()))
    }
}

fn worker_loop(
    id: u64,
    config: Arc<SessionConfig>,
    inputs: Arc<Vec<PathBuf>>,
) -> anyhow::Result<()> {
    let mut worker = WorkerState::new(id, inputs[0].clone());
    let gate = worker
        .thread_init()
        .with_context(|| format!("initializing worker {}", id))?;
    let mut tracer = NullTracer::default();
    let mut counters = NullCounters::default();
    let mut sancov = NullSink::default();

    let mut iter: usize = 0;
    while !config.stop_soon() {
        worker.input_path = inputs[iter % inputs.len()].clone();
        iter += 1;
        let outcome = run_iteration(
            &config,
            &mut worker,
            &gate,
            &mut tracer,
            &mut counters,
            &mut sancov,
        )
        .with_context(|| format!("worker {}, iteration {}", id, iter))?;
        if outcome == IterationOutcome::Retry {
            thread::sleep(Duration::from_millis(100));
        }
    }
    Ok(())
}

fn build_config(settings: Settings) -> anyhow::Result<SessionConfig> {
    let mut config = SessionConfig::default();
    config.cmdline = settings.cmdline;
    config.work_dir = settings.work_dir;
    config.persistent = settings.persistent;
    config.fuzz_stdin = settings.fuzz_stdin;
    config.sanitizers = settings.sanitizers;
    config.monitor_sigabrt = !settings.ignore_sigabrt;
    config.cov_methods = parse_coverage(&settings.coverage)?;
    config.pid_file = settings.pid_file;
    config.clone_flags = parse_isolation(&settings.isolate)?;
    config.disable_aslr = settings.disable_aslr;
    config.time_limit = settings.timeout.map(Duration::from_secs);
    if let Some(pid) = settings.monitor_pid {
        anyhow::ensure!(pid > 0, "--monitor-pid must be positive, got {}", pid);
        config.set_monitor_pid(nix::unistd::Pid::from_raw(pid));
    }
    Ok(config)
}

fn parse_coverage(methods: &[String]) -> anyhow::Result<CovMethods> {
    let mut flags = 0;
    for method in methods {
        flags |= match method.as_str() {
            "instr" => COV_INSTR_COUNT,
            "branch" => COV_BRANCH_COUNT,
            "bts-block" => COV_BTS_BLOCK,
            "bts-edge" => COV_BTS_EDGE,
            "ipt-block" => COV_IPT_BLOCK,
            "soft" => COV_SOFT,
            other => anyhow::bail!("unknown coverage method '{}'", other),
        };
    }
    Ok(flags)
}

fn parse_isolation(namespaces: &[String]) -> anyhow::Result<CloneFlags> {
    let mut flags = CloneFlags::empty();
    for ns in namespaces {
        flags |= match ns.as_str() {
            "net" => CloneFlags::CLONE_NEWNET,
            "mount" => CloneFlags::CLONE_NEWNS,
            "ipc" => CloneFlags::CLONE_NEWIPC,
            "uts" => CloneFlags::CLONE_NEWUTS,
            "pid" => CloneFlags::CLONE_NEWPID,
            "user" => CloneFlags::CLONE_NEWUSER,
            other => anyhow::bail!("unknown namespace '{}'", other),
        };
    }
    Ok(flags)
}

fn collect_inputs(dir: &PathBuf) -> anyhow::Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("reading input directory '{}'", dir.display()))?;
    let mut inputs = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() {
            inputs.push(path);
        }
    }
    anyhow::ensure!(
        !inputs.is_empty(),
        "input directory '{}' holds no files",
        dir.display()
    );
    inputs.sort();
    Ok(inputs)
}

fn setup_signal_handler(stop: Arc<AtomicBool>) {
    use signal_hook::consts::TERM_SIGNALS;
    use signal_hook::iterator::exfiltrator::WithOrigin;
    use signal_hook::iterator::SignalsInfo;
    use std::sync::atomic::Ordering;

    fn named_signal(sig: libc::c_int) -> String {
        signal_hook::low_level::signal_name(sig)
            .map(|n| format!("{}({})", n, sig))
            .unwrap_or_else(|| sig.to_string())
    }

    thread::spawn(move || {
        let mut signals = match SignalsInfo::<WithOrigin>::new(TERM_SIGNALS) {
            Ok(signals) => signals,
            Err(e) => {
                log::error!("cannot install termination handler: {}", e);
                return;
            }
        };
        if let Some(info) = signals.into_iter().next() {
            let from = if let Some(p) = info.process {
                format!("(pid: {}, uid: {})", p.pid, p.uid)
            } else {
                "unknown".to_string()
            };
            log::info!(
                "{} recved, from: {}, waiting for workers to finish...",
                named_signal(info.signal),
                from
            );
            stop.store(true, Ordering::Relaxed);
        }
    });
}
