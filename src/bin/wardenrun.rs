//! wardenrun - container lifecycle CLI.
//!
//! Maps the OCI command lifecycle onto the engine:
//!
//! ```sh
//! wardenrun create <container-id> --bundle=<path>
//! wardenrun start <container-id>
//! wardenrun kill <container-id> [signal] [--all]
//! wardenrun wait <container-id>
//! wardenrun delete <container-id> [--force]
//! ```
//!
//! Every failed verb writes one diagnostic line to stderr and exits
//! non-zero. `wait` mirrors signal deaths as `128 + signo` in its
//! reported exit status.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use wardenrun::cgroup::{CgroupDriver, HostCgroupDriver, NullCgroupDriver};
use wardenrun::container::wait_status_to_exit_code;
use wardenrun::process::HostReaper;
use wardenrun::sandbox::{CheckpointOpts, ExecArgs};
use wardenrun::spec;
use wardenrun::{
    CancelToken, Config, Container, CreateArgs, Engine, Error, Overlay2, Status, UnixDialer,
};

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Create {
        id: String,
        bundle: PathBuf,
        pid_file: Option<PathBuf>,
        console_socket: Option<PathBuf>,
        user_log: Option<PathBuf>,
    },
    Start {
        id: String,
    },
    Run {
        id: String,
        bundle: PathBuf,
        pid_file: Option<PathBuf>,
        console_socket: Option<PathBuf>,
        user_log: Option<PathBuf>,
        detach: bool,
    },
    Exec {
        id: String,
        process_file: Option<PathBuf>,
        argv: Vec<String>,
        detach: bool,
        pid_file: Option<PathBuf>,
        internal_pid_file: Option<PathBuf>,
    },
    Kill {
        id: String,
        signal: String,
        all: bool,
        pid: Option<i32>,
    },
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
    Checkpoint {
        id: String,
        image_path: PathBuf,
        leave_running: bool,
    },
    Restore {
        id: String,
        image_path: PathBuf,
        direct: bool,
        background: bool,
    },
    Wait {
        id: String,
        pid: Option<i32>,
        rootpid: Option<i32>,
        checkpoint: bool,
        restore: bool,
    },
    Delete {
        id: String,
        force: bool,
    },
    State {
        id: String,
    },
    Events {
        id: String,
        stats: bool,
        interval_secs: u64,
    },
    List {
        format: Format,
    },
    Ps {
        id: String,
        format: Format,
    },
    Version,
    Help,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Table,
    Json,
}

fn flag_value(arg: &str, name: &str) -> Option<String> {
    arg.strip_prefix(&format!("--{name}=")).map(str::to_string)
}

/// Splits leading `--flag[=value]` global options from the verb and
/// its arguments, building the runtime configuration.
fn parse_global(args: &[String]) -> Result<(Config, Vec<String>), String> {
    let mut config = Config::default();
    let mut rest = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.peek() {
        let arg = arg.as_str();
        if !arg.starts_with("--") {
            break;
        }
        if let Some(value) = flag_value(arg, "root") {
            config.root_dir = PathBuf::from(value);
        } else if let Some(value) = flag_value(arg, "log") {
            config.log = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(arg, "debug-log") {
            config.debug_log = Some(PathBuf::from(value));
        } else if let Some(value) = flag_value(arg, "platform") {
            config.platform = value;
        } else if let Some(value) = flag_value(arg, "overlay2") {
            config.overlay2 = Overlay2::parse(&value).map_err(|e| e.to_string())?;
        } else if let Some(value) = flag_value(arg, "sandbox-binary") {
            config.sandbox_binary = Some(PathBuf::from(value));
        } else if arg == "--directfs" {
            config.directfs = true;
        } else if arg == "--rootless" {
            config.rootless = true;
        } else if arg == "--ignore-cgroups" {
            config.ignore_cgroups = true;
        } else if arg == "--systemd-cgroup" {
            config.systemd_cgroup = true;
        } else if arg == "--allow-flag-override" {
            config.allow_flag_override = true;
        } else if arg == "--testonly-run-as-current-user" {
            config.test_only_run_as_user = true;
        } else {
            return Err(format!("unknown global flag: {arg}"));
        }
        iter.next();
    }
    rest.extend(iter.cloned());
    Ok((config, rest))
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let Some(verb) = args.first() else {
        return Ok(Command::Help);
    };
    let need_id = || -> Result<String, String> {
        args.get(1)
            .filter(|a| !a.starts_with("--"))
            .cloned()
            .ok_or_else(|| format!("{verb} requires <container-id>"))
    };
    let opts = |skip: usize| args.iter().skip(skip);

    match verb.as_str() {
        "create" | "run" => {
            let id = need_id()?;
            let mut bundle = PathBuf::from(".");
            let mut pid_file = None;
            let mut console_socket = None;
            let mut user_log = None;
            let mut detach = false;
            for arg in opts(2) {
                if let Some(v) = flag_value(arg, "bundle") {
                    bundle = PathBuf::from(v);
                } else if let Some(v) = flag_value(arg, "pid-file") {
                    pid_file = Some(PathBuf::from(v));
                } else if let Some(v) = flag_value(arg, "console-socket") {
                    console_socket = Some(PathBuf::from(v));
                } else if let Some(v) = flag_value(arg, "user-log") {
                    user_log = Some(PathBuf::from(v));
                } else if arg == "--detach" || arg == "-d" {
                    detach = true;
                } else {
                    return Err(format!("unknown {verb} flag: {arg}"));
                }
            }
            if verb == "create" {
                Ok(Command::Create {
                    id,
                    bundle,
                    pid_file,
                    console_socket,
                    user_log,
                })
            } else {
                Ok(Command::Run {
                    id,
                    bundle,
                    pid_file,
                    console_socket,
                    user_log,
                    detach,
                })
            }
        }
        "start" => Ok(Command::Start { id: need_id()? }),
        "exec" => {
            let id = need_id()?;
            let mut process_file = None;
            let mut detach = false;
            let mut pid_file = None;
            let mut internal_pid_file = None;
            let mut argv = Vec::new();
            let mut in_argv = false;
            for arg in opts(2) {
                if in_argv {
                    argv.push(arg.clone());
                } else if arg == "--" {
                    in_argv = true;
                } else if let Some(v) = flag_value(arg, "process") {
                    process_file = Some(PathBuf::from(v));
                } else if let Some(v) = flag_value(arg, "pid-file") {
                    pid_file = Some(PathBuf::from(v));
                } else if let Some(v) = flag_value(arg, "internal-pid-file") {
                    internal_pid_file = Some(PathBuf::from(v));
                } else if arg == "--detach" || arg == "-d" {
                    detach = true;
                } else if !arg.starts_with("--") {
                    argv.push(arg.clone());
                } else {
                    return Err(format!("unknown exec flag: {arg}"));
                }
            }
            Ok(Command::Exec {
                id,
                process_file,
                argv,
                detach,
                pid_file,
                internal_pid_file,
            })
        }
        "kill" => {
            let id = need_id()?;
            let mut signal = "SIGTERM".to_string();
            let mut all = false;
            let mut pid = None;
            for arg in opts(2) {
                if arg == "--all" || arg == "-a" {
                    all = true;
                } else if let Some(v) = flag_value(arg, "pid") {
                    pid = Some(v.parse().map_err(|_| format!("invalid pid: {v}"))?);
                } else if !arg.starts_with("--") {
                    signal = arg.clone();
                } else {
                    return Err(format!("unknown kill flag: {arg}"));
                }
            }
            Ok(Command::Kill {
                id,
                signal,
                all,
                pid,
            })
        }
        "pause" => Ok(Command::Pause { id: need_id()? }),
        "resume" => Ok(Command::Resume { id: need_id()? }),
        "checkpoint" => {
            let id = need_id()?;
            let mut image_path = None;
            let mut leave_running = false;
            for arg in opts(2) {
                if let Some(v) = flag_value(arg, "image-path") {
                    image_path = Some(PathBuf::from(v));
                } else if arg == "--leave-running" {
                    leave_running = true;
                } else {
                    return Err(format!("unknown checkpoint flag: {arg}"));
                }
            }
            Ok(Command::Checkpoint {
                id,
                image_path: image_path.ok_or("checkpoint requires --image-path")?,
                leave_running,
            })
        }
        "restore" => {
            let id = need_id()?;
            let mut image_path = None;
            let mut direct = false;
            let mut background = false;
            for arg in opts(2) {
                if let Some(v) = flag_value(arg, "image-path") {
                    image_path = Some(PathBuf::from(v));
                } else if arg == "--direct" {
                    direct = true;
                } else if arg == "--background" {
                    background = true;
                } else {
                    return Err(format!("unknown restore flag: {arg}"));
                }
            }
            Ok(Command::Restore {
                id,
                image_path: image_path.ok_or("restore requires --image-path")?,
                direct,
                background,
            })
        }
        "wait" => {
            let id = need_id()?;
            let mut pid = None;
            let mut rootpid = None;
            let mut checkpoint = false;
            let mut restore = false;
            for arg in opts(2) {
                if let Some(v) = flag_value(arg, "pid") {
                    pid = Some(v.parse().map_err(|_| format!("invalid pid: {v}"))?);
                } else if let Some(v) = flag_value(arg, "rootpid") {
                    rootpid = Some(v.parse().map_err(|_| format!("invalid rootpid: {v}"))?);
                } else if arg == "--checkpoint" {
                    checkpoint = true;
                } else if arg == "--restore" {
                    restore = true;
                } else {
                    return Err(format!("unknown wait flag: {arg}"));
                }
            }
            Ok(Command::Wait {
                id,
                pid,
                rootpid,
                checkpoint,
                restore,
            })
        }
        "delete" => {
            let id = need_id()?;
            let force = args.iter().any(|a| a == "--force" || a == "-f");
            Ok(Command::Delete { id, force })
        }
        "state" => Ok(Command::State { id: need_id()? }),
        "events" => {
            let id = need_id()?;
            let mut stats = false;
            let mut interval_secs = 5;
            for arg in opts(2) {
                if arg == "--stats" {
                    stats = true;
                } else if let Some(v) = flag_value(arg, "interval") {
                    interval_secs = v.parse().map_err(|_| format!("invalid interval: {v}"))?;
                } else {
                    return Err(format!("unknown events flag: {arg}"));
                }
            }
            Ok(Command::Events {
                id,
                stats,
                interval_secs,
            })
        }
        "list" => Ok(Command::List {
            format: parse_format(args)?,
        }),
        "ps" => Ok(Command::Ps {
            id: need_id()?,
            format: parse_format(args)?,
        }),
        "gofer" | "boot" => Err(format!(
            "the {verb} entry point is provided by the full runtime distribution; \
             point --sandbox-binary at it"
        )),
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {unknown}")),
    }
}

fn parse_format(args: &[String]) -> Result<Format, String> {
    for arg in args {
        if let Some(v) = flag_value(arg, "format") {
            return match v.as_str() {
                "table" => Ok(Format::Table),
                "json" => Ok(Format::Json),
                other => Err(format!("unknown format: {other}")),
            };
        }
    }
    Ok(Format::Table)
}

fn parse_signal(signal: &str) -> Result<i32, String> {
    if let Ok(n) = signal.parse::<i32>() {
        return Ok(n);
    }
    let name = signal.to_uppercase();
    let name = name.strip_prefix("SIG").unwrap_or(&name);
    match name {
        "HUP" => Ok(libc::SIGHUP),
        "INT" => Ok(libc::SIGINT),
        "QUIT" => Ok(libc::SIGQUIT),
        "KILL" => Ok(libc::SIGKILL),
        "USR1" => Ok(libc::SIGUSR1),
        "USR2" => Ok(libc::SIGUSR2),
        "TERM" => Ok(libc::SIGTERM),
        "STOP" => Ok(libc::SIGSTOP),
        "CONT" => Ok(libc::SIGCONT),
        "WINCH" => Ok(libc::SIGWINCH),
        _ => Err(format!("unknown signal: {signal}")),
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

fn build_engine(config: Config) -> Engine {
    let cgroups: Arc<dyn CgroupDriver> = if config.ignore_cgroups || config.test_only_run_as_user {
        Arc::new(NullCgroupDriver)
    } else {
        Arc::new(HostCgroupDriver::new())
    };
    Engine::new(config, cgroups, Arc::new(UnixDialer), Arc::new(HostReaper))
}

fn create_args(
    id: String,
    bundle: PathBuf,
    pid_file: Option<PathBuf>,
    console_socket: Option<PathBuf>,
    user_log: Option<PathBuf>,
    attached: bool,
) -> Result<CreateArgs, Error> {
    let bundle = bundle.canonicalize().unwrap_or(bundle);
    let spec = spec::load_from_bundle(&bundle)?;
    Ok(CreateArgs {
        id,
        spec,
        bundle_dir: bundle,
        console_socket,
        pid_file,
        user_log,
        attached,
    })
}

fn cmd_create(
    engine: &Engine,
    id: String,
    bundle: PathBuf,
    pid_file: Option<PathBuf>,
    console_socket: Option<PathBuf>,
    user_log: Option<PathBuf>,
) -> Result<i32, Error> {
    let args = create_args(id, bundle, pid_file, console_socket, user_log, false)?;
    engine.create(args, &CancelToken::new())?;
    Ok(0)
}

fn cmd_start(engine: &Engine, id: &str) -> Result<i32, Error> {
    let mut container = engine.load(id)?;
    container.start(engine, &CancelToken::new())?;
    Ok(0)
}

#[allow(clippy::too_many_arguments)]
fn cmd_run(
    engine: &Engine,
    id: String,
    bundle: PathBuf,
    pid_file: Option<PathBuf>,
    console_socket: Option<PathBuf>,
    user_log: Option<PathBuf>,
    detach: bool,
) -> Result<i32, Error> {
    let args = create_args(id, bundle, pid_file, console_socket, user_log, !detach)?;
    let status = engine.run(args, &CancelToken::new())?;
    Ok(wait_status_to_exit_code(status))
}

fn cmd_exec(
    engine: &Engine,
    id: &str,
    process_file: Option<PathBuf>,
    argv: Vec<String>,
    detach: bool,
    pid_file: Option<PathBuf>,
    internal_pid_file: Option<PathBuf>,
) -> Result<i32, Error> {
    let mut container = engine.load(id)?;
    let exec_args = match process_file {
        Some(path) => {
            let data = std::fs::read(&path)?;
            parse_process_doc(&data)?
        }
        None => {
            if argv.is_empty() {
                return Err(Error::InvalidSpec(
                    "exec requires --process or an argument list".into(),
                ));
            }
            ExecArgs {
                argv,
                cwd: "/".to_string(),
                ..Default::default()
            }
        }
    };

    let cancel = CancelToken::new();
    let pid = container.execute(engine, &cancel, exec_args)?;
    if let Some(path) = &internal_pid_file {
        std::fs::write(path, pid.to_string())?;
    }
    if let Some(path) = &pid_file {
        std::fs::write(path, container.sandbox_pid().to_string())?;
    }
    if detach {
        return Ok(0);
    }
    let status = container.wait_pid(engine, &cancel, pid)?;
    Ok(wait_status_to_exit_code(status))
}

/// Parses an OCI process document (`exec --process=<json>`).
fn parse_process_doc(data: &[u8]) -> Result<ExecArgs, Error> {
    let process: spec::Process = serde_json::from_slice(data)
        .map_err(|e| Error::InvalidSpec(format!("parsing process document: {e}")))?;
    Ok(ExecArgs {
        argv: process.args,
        env: process.env,
        cwd: process.cwd,
        user: Some(process.user),
        tty: process.terminal,
    })
}

fn cmd_kill(
    engine: &Engine,
    id: &str,
    signal: &str,
    all: bool,
    pid: Option<i32>,
) -> Result<i32, Error> {
    let signo = parse_signal(signal).map_err(Error::InvalidSpec)?;
    let container = engine.load(id)?;
    let cancel = CancelToken::new();
    match pid {
        Some(pid) => container.signal_process(engine, &cancel, pid, signo)?,
        None => container.signal(engine, &cancel, signo, all)?,
    }
    Ok(0)
}

fn cmd_wait(
    engine: &Engine,
    id: &str,
    pid: Option<i32>,
    rootpid: Option<i32>,
    checkpoint: bool,
    restore: bool,
) -> Result<i32, Error> {
    let mut container = engine.load(id)?;
    let cancel = CancelToken::new();
    let status = if checkpoint {
        container.wait_checkpoint(engine, &cancel)?;
        0
    } else if restore {
        container.wait_restore(engine, &cancel)?;
        0
    } else if let Some(pid) = rootpid {
        container.wait_root_pid(engine, &cancel, pid)?
    } else if let Some(pid) = pid {
        container.wait_pid(engine, &cancel, pid)?
    } else {
        container.wait(engine, &cancel)?
    };
    println!(
        "{}",
        serde_json::json!({
            "id": id,
            "exitStatus": wait_status_to_exit_code(status),
        })
    );
    Ok(0)
}

fn cmd_delete(engine: &Engine, id: &str, force: bool) -> Result<i32, Error> {
    let mut container = match engine.load(id) {
        Ok(container) => container,
        Err(Error::NotFound(_)) | Err(Error::Corrupt(_)) if force => {
            // An interrupted create can leave a directory without a
            // loadable record; force removes it.
            wardenrun::statefile::remove_orphans(engine.config().root_dir.as_path(), id)?;
            return Ok(0);
        }
        Err(e) => return Err(e),
    };
    if !force && container.status == Status::Running && container.is_sandbox_running() {
        return Err(Error::InvalidState(format!(
            "cannot delete running container {id:?}; use --force"
        )));
    }
    container.destroy(engine)?;
    Ok(0)
}

fn cmd_state(engine: &Engine, id: &str) -> Result<i32, Error> {
    let mut container = engine.load(id)?;
    container.check_stopped(engine, &CancelToken::new());
    let state = container.state();
    println!("{}", serde_json::to_string_pretty(&state).map_err(Error::from)?);
    Ok(0)
}

fn cmd_events(engine: &Engine, id: &str, stats: bool, interval_secs: u64) -> Result<i32, Error> {
    let mut container = engine.load(id)?;
    let cancel = CancelToken::new();
    loop {
        let event = container.event(engine, &cancel)?;
        println!("{}", serde_json::to_string(&event.event).map_err(Error::from)?);
        if stats {
            return Ok(0);
        }
        std::thread::sleep(std::time::Duration::from_secs(interval_secs.max(1)));
    }
}

fn cmd_list(engine: &Engine, format: Format) -> Result<i32, Error> {
    let ids = engine.list()?;
    let mut containers: Vec<Container> = Vec::new();
    for full_id in &ids {
        match engine.load_exact(full_id) {
            Ok(container) => containers.push(container),
            Err(e) => tracing::warn!(id = %full_id, error = %e, "skipping unloadable container"),
        }
    }
    match format {
        Format::Json => {
            let states: Vec<_> = containers.iter().map(Container::state).collect();
            println!("{}", serde_json::to_string_pretty(&states).map_err(Error::from)?);
        }
        Format::Table => {
            println!("ID\tPID\tSTATUS\tBUNDLE\tCREATED\tOWNER");
            for c in &containers {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    c.id,
                    c.sandbox_pid(),
                    c.status,
                    c.bundle_dir.display(),
                    c.created_at.to_rfc3339(),
                    c.owner,
                );
            }
        }
    }
    Ok(0)
}

fn cmd_ps(engine: &Engine, id: &str, format: Format) -> Result<i32, Error> {
    let container = engine.load(id)?;
    let processes = container.processes(engine, &CancelToken::new())?;
    match format {
        Format::Json => {
            println!("{}", serde_json::to_string_pretty(&processes).map_err(Error::from)?);
        }
        Format::Table => {
            println!("PID\tUID\tCMD");
            for p in &processes {
                println!("{}\t{}\t{}", p.pid, p.uid, p.cmd);
            }
        }
    }
    Ok(0)
}

fn cmd_version() -> i32 {
    println!("wardenrun version {}", env!("CARGO_PKG_VERSION"));
    println!("spec: {}", wardenrun::constants::OCI_VERSION);
    0
}

fn cmd_help() -> i32 {
    println!(
        r#"wardenrun - sandboxed OCI container runtime

USAGE:
    wardenrun [global flags] <command> [options]

COMMANDS:
    create <id> --bundle=<dir>      Create a container
    start <id>                      Start a created container
    run <id> --bundle=<dir>         Create + start (+ wait unless --detach)
    exec <id> [--process=<json>|<argv…>]  Run a command in a container
    kill <id> [signal] [--all]      Send a signal to a container
    pause <id> / resume <id>        Suspend / resume a container
    checkpoint <id> --image-path=<dir>   Write a checkpoint image
    restore <id> --image-path=<dir>      Restore from a checkpoint image
    wait <id> [--pid=<n>] [--rootpid=<n>]  Wait and report the exit status
    delete <id> [--force]           Destroy a container
    state <id>                      Emit the OCI state document
    events <id> [--stats] [--interval=<sec>]  Emit usage events
    list [--format=json|table]      List containers
    ps <id> [--format=json|table]   List container processes

GLOBAL FLAGS:
    --root=<dir>           State root (default: $XDG_RUNTIME_DIR/wardenrun)
    --log=<file>           Sandbox log destination
    --debug-log=<file>     Extra debug log destination
    --platform=<name>      Guest execution platform
    --overlay2=<conf>      Overlay tuning, e.g. root:self, all:memory
    --sandbox-binary=<bin> Binary providing the gofer/boot entry points
    --directfs             Direct host FD file access from the sandbox
    --rootless             Run without root privileges
    --ignore-cgroups       Skip cgroup configuration
    --systemd-cgroup       Interpret cgroup paths as systemd slices
    --allow-flag-override  Honor bundle flag-override annotations
"#
    );
    0
}

// =============================================================================
// Main
// =============================================================================

fn init_logging(config: &Config) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if let Some(debug_log) = &config.debug_log {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(debug_log)
        {
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
                )
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
            return;
        }
    }
    builder.init();
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config, rest) = match parse_global(&args) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config);

    let command = match parse_command(&rest) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let engine = build_engine(config);
    let result = match command {
        Command::Create {
            id,
            bundle,
            pid_file,
            console_socket,
            user_log,
        } => cmd_create(&engine, id, bundle, pid_file, console_socket, user_log),
        Command::Start { id } => cmd_start(&engine, &id),
        Command::Run {
            id,
            bundle,
            pid_file,
            console_socket,
            user_log,
            detach,
        } => cmd_run(
            &engine,
            id,
            bundle,
            pid_file,
            console_socket,
            user_log,
            detach,
        ),
        Command::Exec {
            id,
            process_file,
            argv,
            detach,
            pid_file,
            internal_pid_file,
        } => cmd_exec(
            &engine,
            &id,
            process_file,
            argv,
            detach,
            pid_file,
            internal_pid_file,
        ),
        Command::Kill {
            id,
            signal,
            all,
            pid,
        } => cmd_kill(&engine, &id, &signal, all, pid),
        Command::Pause { id } => engine
            .load(&id)
            .and_then(|mut c| c.pause(&engine, &CancelToken::new()))
            .map(|_| 0),
        Command::Resume { id } => engine
            .load(&id)
            .and_then(|mut c| c.resume(&engine, &CancelToken::new()))
            .map(|_| 0),
        Command::Checkpoint {
            id,
            image_path,
            leave_running,
        } => engine.load(&id).and_then(|c| {
            c.checkpoint(
                &engine,
                &CancelToken::new(),
                &image_path,
                CheckpointOpts {
                    direct: false,
                    leave_running,
                },
            )
            .map(|_| 0)
        }),
        Command::Restore {
            id,
            image_path,
            direct,
            background,
        } => engine.load(&id).and_then(|mut c| {
            c.restore(&engine, &CancelToken::new(), &image_path, direct, background)
                .map(|_| 0)
        }),
        Command::Wait {
            id,
            pid,
            rootpid,
            checkpoint,
            restore,
        } => cmd_wait(&engine, &id, pid, rootpid, checkpoint, restore),
        Command::Delete { id, force } => cmd_delete(&engine, &id, force),
        Command::State { id } => cmd_state(&engine, &id),
        Command::Events {
            id,
            stats,
            interval_secs,
        } => cmd_events(&engine, &id, stats, interval_secs),
        Command::List { format } => cmd_list(&engine, format),
        Command::Ps { id, format } => cmd_ps(&engine, &id, format),
        Command::Version => Ok(cmd_version()),
        Command::Help => Ok(cmd_help()),
    };

    match result {
        Ok(0) => ExitCode::SUCCESS,
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
