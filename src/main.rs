// SPDX-License-Identifier: MIT OR Apache-2.0
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use pspawn_core::{
    CancelToken, ExitStatus, LaunchMode, LaunchRequest, SessionControl, SpawnExecutor, StdioSpec,
    run_phase_two,
};
use pspawn_pty::PtyPair;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pspawn", version, about = "posix_spawn-based process launcher")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch a program and mirror its exit status.
    Run {
        /// Working directory for the child.
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Environment overrides as KEY=VALUE, applied on top of the
        /// inherited environment. Can be repeated; later entries win.
        #[arg(long = "env")]
        env_vars: Vec<String>,

        /// Place the child in this process group.
        #[arg(long)]
        pgid: Option<i32>,

        /// Start the child in a new session.
        #[arg(long)]
        new_session: bool,

        /// Run the child on a fresh pseudo-terminal bridged to this
        /// process's stdin/stdout.
        #[arg(long)]
        pty: bool,

        /// Print the outcome as JSON instead of mirroring streams' plain text.
        #[arg(long)]
        json: bool,

        /// Program to run, followed by its arguments.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        argv: Vec<String>,
    },
}

fn main() -> Result<()> {
    let raw_args: Vec<String> = std::env::args().collect();

    // The hidden helper entry point bypasses the CLI entirely: phase one
    // spawned this executable with a synthesized argv and expects phase two
    // to run before anything else happens in this process.
    match LaunchMode::detect(&raw_args) {
        Ok(LaunchMode::HelperPhase2(invocation)) => {
            init_tracing(false);
            // On success the process image has been replaced and this line
            // is never reached.
            let err = run_phase_two(&invocation);
            error!(target: "pspawn.helper", %err, "helper phase failed");
            std::process::exit(70);
        }
        Ok(LaunchMode::Direct) => {}
        Err(err) => {
            init_tracing(false);
            error!(target: "pspawn.helper", %err, "malformed helper invocation");
            std::process::exit(70);
        }
    }

    let cli = Cli::parse_from(raw_args);
    init_tracing(cli.debug);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting async runtime")?;

    match cli.command {
        Commands::Run {
            cwd,
            env_vars,
            pgid,
            new_session,
            pty,
            json,
            argv,
        } => {
            let status = runtime.block_on(cmd_run(
                cwd,
                env_vars,
                pgid,
                new_session,
                pty,
                json,
                argv,
            ))?;
            // The runtime may still host pump tasks blocked on terminal
            // reads; don't wait for them.
            runtime.shutdown_background();
            std::process::exit(exit_code(status));
        }
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("pspawn=debug,pspawn.spawn=debug,pspawn.helper=debug,pspawn.pty=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pspawn=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn cmd_run(
    cwd: Option<PathBuf>,
    env_vars: Vec<String>,
    pgid: Option<i32>,
    new_session: bool,
    pty: bool,
    json: bool,
    argv: Vec<String>,
) -> Result<ExitStatus> {
    let Some((program, args)) = argv.split_first() else {
        bail!("no program given");
    };

    let mut request = LaunchRequest::new(program.clone());
    request.args = if args.is_empty() {
        vec![program.clone()]
    } else {
        let mut full = Vec::with_capacity(1 + args.len());
        full.push(program.clone());
        full.extend(args.iter().cloned());
        full
    };
    request.working_directory = cwd;
    request.process_group = pgid;
    let cancel = CancelToken::new();
    request.cancel = Some(cancel.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });
    if !env_vars.is_empty() {
        let mut merged: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
        merged.extend(env_vars);
        request.env = Some(merged);
    }
    if new_session {
        request.session = SessionControl::NewSession;
    }

    let executor = SpawnExecutor::new();

    let (status, pid) = if pty {
        let mut pty_pair = PtyPair::open().context("allocating pseudo-terminal")?;
        pty_pair
            .attach(&mut request)
            .context("wiring pseudo-terminal")?;
        let mut handle = executor.spawn(&request).await.context("spawning")?;
        // The child holds its own slave copies now; keeping ours open would
        // stop master reads from ever reporting end of stream.
        pty_pair.close_slave();
        pty_pair
            .attach_io(tokio::io::stdin(), tokio::io::stdout())
            .context("bridging terminal i/o")?;
        let status = handle.wait().await.context("waiting")?;
        pty_pair.close();
        (status, handle.pid())
    } else {
        request.stdin = StdioSpec::Inherit(0);
        request.stdout = StdioSpec::Inherit(1);
        request.stderr = StdioSpec::Inherit(2);
        let mut handle = executor.spawn(&request).await.context("spawning")?;
        let status = handle.wait().await.context("waiting")?;
        (status, handle.pid())
    };

    if json {
        let report = serde_json::json!({
            "pid": pid,
            "code": status.code,
            "signal": status.signal,
        });
        println!("{report}");
    }

    Ok(status)
}

/// Shell convention: the exit code for a signal death is 128 plus the
/// signal number.
fn exit_code(status: ExitStatus) -> i32 {
    match (status.code, status.signal) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 0,
    }
}
