//! fwbridge - Firmware Analysis Environment CLI
//!
//! Provisions an isolated Linux analysis environment on a Windows host and
//! bridges commands and files into the binwalk container inside it.
//!
//! ## Usage
//!
//! ```sh
//! fwbridge probe [--json]
//! fwbridge provision [--backend <wsl2|wsl1|docker-desktop|qemu>]
//! fwbridge status [--json]
//! fwbridge container <ensure|start|stop|restart|remove|status|logs>
//! fwbridge run [--workdir <dir>] [--timeout <secs>] -- <argv...>
//! fwbridge upload <local> <remote> [--overwrite]
//! fwbridge download <remote> <local> [--overwrite]
//! fwbridge destroy
//! ```

use fwbridge::{
    driver_for, rank, BackendKind, ContainerManager, HostCapability, OutputChunk, Provisioner,
    RemoteCommand, SessionState, TransferRequest,
};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Probe {
        json: bool,
    },
    Provision {
        backend: Option<String>,
    },
    Status {
        json: bool,
    },
    Container {
        action: String,
        tail: usize,
    },
    Run {
        argv: Vec<String>,
        workdir: Option<String>,
        timeout: Option<u64>,
    },
    Upload {
        local: PathBuf,
        remote: String,
        overwrite: bool,
    },
    Download {
        remote: String,
        local: PathBuf,
        overwrite: bool,
    },
    Destroy,
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "probe" => Ok(Command::Probe {
            json: args.iter().any(|a| a == "--json"),
        }),
        "provision" => {
            let mut backend = None;
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--backend" | "-b" => {
                        if i + 1 < args.len() {
                            backend = Some(args[i + 1].clone());
                            i += 2;
                        } else {
                            return Err("--backend requires a value".to_string());
                        }
                    }
                    _ => i += 1,
                }
            }
            Ok(Command::Provision { backend })
        }
        "status" => Ok(Command::Status {
            json: args.iter().any(|a| a == "--json"),
        }),
        "container" => {
            if args.len() < 3 {
                return Err("container requires an action".to_string());
            }
            let action = args[2].clone();
            let mut tail = 200;
            let mut i = 3;
            while i < args.len() {
                match args[i].as_str() {
                    "--tail" => {
                        if i + 1 < args.len() {
                            tail = args[i + 1]
                                .parse()
                                .map_err(|_| "--tail requires a number".to_string())?;
                            i += 2;
                        } else {
                            return Err("--tail requires a number".to_string());
                        }
                    }
                    _ => i += 1,
                }
            }
            Ok(Command::Container { action, tail })
        }
        "run" => {
            let mut workdir = None;
            let mut timeout = None;
            let mut argv = Vec::new();
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--workdir" | "-w" => {
                        if i + 1 < args.len() {
                            workdir = Some(args[i + 1].clone());
                            i += 2;
                        } else {
                            return Err("--workdir requires a path".to_string());
                        }
                    }
                    "--timeout" | "-t" => {
                        if i + 1 < args.len() {
                            timeout = Some(
                                args[i + 1]
                                    .parse()
                                    .map_err(|_| "--timeout requires seconds".to_string())?,
                            );
                            i += 2;
                        } else {
                            return Err("--timeout requires seconds".to_string());
                        }
                    }
                    "--" => {
                        argv = args[i + 1..].to_vec();
                        break;
                    }
                    _ => {
                        argv = args[i..].to_vec();
                        break;
                    }
                }
            }
            if argv.is_empty() {
                return Err("run requires a command".to_string());
            }
            Ok(Command::Run {
                argv,
                workdir,
                timeout,
            })
        }
        "upload" => {
            if args.len() < 4 {
                return Err("upload requires <local> <remote>".to_string());
            }
            Ok(Command::Upload {
                local: PathBuf::from(&args[2]),
                remote: args[3].clone(),
                overwrite: args.iter().any(|a| a == "--overwrite"),
            })
        }
        "download" => {
            if args.len() < 4 {
                return Err("download requires <remote> <local>".to_string());
            }
            Ok(Command::Download {
                remote: args[2].clone(),
                local: PathBuf::from(&args[3]),
                overwrite: args.iter().any(|a| a == "--overwrite"),
            })
        }
        "destroy" => Ok(Command::Destroy),
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {}", unknown)),
    }
}

// =============================================================================
// Command Implementations
// =============================================================================

fn load_session() -> Result<Arc<SessionState>, String> {
    SessionState::load().map(Arc::new).map_err(|e| e.to_string())
}

fn load_manager(session: &Arc<SessionState>) -> Result<ContainerManager, String> {
    let env = session
        .snapshot()
        .ok_or_else(|| "no provisioned environment; run `fwbridge provision` first".to_string())?;
    ContainerManager::from_environment(session.clone(), &env).map_err(|e| e.to_string())
}

async fn cmd_probe(json: bool) -> Result<(), String> {
    let caps = HostCapability::probe().await;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&caps).map_err(|e| e.to_string())?
        );
        return Ok(());
    }

    println!("virtualization:   {}", caps.virtualization_supported);
    println!("wsl2:             {}", caps.wsl2_available);
    println!("wsl1:             {}", caps.wsl1_available);
    println!("docker desktop:   {}", caps.docker_desktop_installed);
    match caps.bios_virtualization_enabled {
        Some(enabled) => println!("firmware toggle:  {}", enabled),
        None => println!("firmware toggle:  unknown"),
    }

    let ranked: Vec<String> = rank(&caps).iter().map(|d| d.kind.to_string()).collect();
    if ranked.is_empty() {
        println!("usable backends:  none");
    } else {
        println!("usable backends:  {}", ranked.join(" > "));
    }
    Ok(())
}

async fn cmd_provision(backend: Option<String>) -> Result<(), String> {
    let session = load_session()?;
    let caps = HostCapability::probe().await;
    let provisioner = Provisioner::new(session);

    let env = match backend {
        Some(name) => {
            let kind = BackendKind::from_str(&name)
                .ok_or_else(|| format!("unknown backend: {}", name))?;
            let driver = driver_for(kind);
            provisioner
                .provision(driver.as_ref(), &caps)
                .await
                .map_err(|e| e.to_string())?
        }
        None => provisioner
            .provision_auto(&caps)
            .await
            .map_err(|e| e.to_string())?,
    };

    eprintln!("Environment ready on backend {}", env.backend);
    Ok(())
}

fn cmd_status(json: bool) -> Result<(), String> {
    let session = load_session()?;
    match session.snapshot() {
        None => {
            println!("state: absent");
            Ok(())
        }
        Some(env) => {
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&env).map_err(|e| e.to_string())?
                );
                return Ok(());
            }
            println!("state:      {}", env.state);
            println!("backend:    {}", env.backend);
            if let Some(volume) = &env.volume_id {
                println!("volume:     {}", volume);
            }
            if let Some(container) = &env.container_id {
                println!("container:  {}", container);
            }
            if let Some(step) = env.failed_step {
                println!("failed at:  {}", step);
            }
            println!("updated:    {}", env.updated_at);
            Ok(())
        }
    }
}

async fn cmd_container(action: String, tail: usize) -> Result<(), String> {
    let session = load_session()?;
    let manager = load_manager(&session)?;

    match action.as_str() {
        "ensure" => {
            let id = manager.ensure_container().await.map_err(|e| e.to_string())?;
            eprintln!("Container {} ready", id);
        }
        "start" => manager.start().await.map_err(|e| e.to_string())?,
        "stop" => manager.stop().await.map_err(|e| e.to_string())?,
        "restart" => manager.restart().await.map_err(|e| e.to_string())?,
        "remove" => manager.remove().await.map_err(|e| e.to_string())?,
        "status" => {
            let status = manager.status().await.map_err(|e| e.to_string())?;
            println!("{}", status);
        }
        "logs" => {
            let logs = manager.logs(tail).await.map_err(|e| e.to_string())?;
            print!("{}", logs);
        }
        other => return Err(format!("unknown container action: {}", other)),
    }
    Ok(())
}

async fn cmd_run(
    argv: Vec<String>,
    workdir: Option<String>,
    timeout: Option<u64>,
) -> Result<(), String> {
    let session = load_session()?;
    let manager = load_manager(&session)?;

    let mut cmd = RemoteCommand::new(argv);
    if let Some(dir) = workdir {
        cmd = cmd.working_dir(dir);
    }
    if let Some(secs) = timeout {
        cmd = cmd.timeout(Duration::from_secs(secs));
    }

    let (tx, mut rx) = tokio::sync::mpsc::channel(fwbridge::OUTPUT_CHANNEL_CAPACITY);
    let printer = tokio::spawn(async move {
        let mut stdout = std::io::stdout();
        let mut stderr = std::io::stderr();
        while let Some(chunk) = rx.recv().await {
            let _ = match chunk {
                OutputChunk::Stdout(bytes) => stdout.write_all(&bytes).and_then(|_| stdout.flush()),
                OutputChunk::Stderr(bytes) => stderr.write_all(&bytes).and_then(|_| stderr.flush()),
            };
        }
    });

    // Ctrl-C cancels the in-flight command, not the environment.
    let cancel = ctrl_c_token();

    let result = manager.execute(&cmd, tx, &cancel).await;
    let _ = printer.await;
    let result = result.map_err(|e| e.to_string())?;

    if !result.is_success() {
        return Err(format!("command exited with {}", result.exit_code));
    }
    Ok(())
}

/// A token cancelled by Ctrl-C; aborts the in-flight operation only.
fn ctrl_c_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });
    cancel
}

async fn cmd_upload(local: PathBuf, remote: String, overwrite: bool) -> Result<(), String> {
    let session = load_session()?;
    let manager = load_manager(&session)?;
    let req = TransferRequest::upload(local, remote).overwrite(overwrite);
    let cancel = ctrl_c_token();
    manager
        .transfer(&req, &cancel)
        .await
        .map_err(|e| e.to_string())?;
    eprintln!("Upload complete");
    Ok(())
}

async fn cmd_download(remote: String, local: PathBuf, overwrite: bool) -> Result<(), String> {
    let session = load_session()?;
    let manager = load_manager(&session)?;
    let req = TransferRequest::download(remote, local).overwrite(overwrite);
    let cancel = ctrl_c_token();
    manager
        .transfer(&req, &cancel)
        .await
        .map_err(|e| e.to_string())?;
    eprintln!("Download complete");
    Ok(())
}

fn cmd_destroy() -> Result<(), String> {
    let session = load_session()?;
    session.destroy().map_err(|e| e.to_string())?;
    eprintln!("Environment destroyed");
    Ok(())
}

fn cmd_version() {
    println!("fwbridge version {}", env!("CARGO_PKG_VERSION"));
}

fn cmd_help() {
    println!(
        r#"fwbridge - firmware analysis environment provisioner and bridge

USAGE:
    fwbridge <command> [options]

COMMANDS:
    probe [--json]                    Probe host capabilities and rank backends
    provision [--backend <name>]      Provision (or resume) the environment
    status [--json]                   Show the environment record
    container <action> [--tail <n>]   ensure|start|stop|restart|remove|status|logs
    run [opts] -- <argv...>           Run a command in the analysis container
    upload <local> <remote>           Copy a host file into the analysis volume
    download <remote> <local>         Copy a file out of the analysis volume
    destroy                           Tear down the session record
    version                           Show version info
    help                              Show this help

OPTIONS:
    --backend, -b <name>   Force a backend: wsl2, wsl1, docker-desktop, qemu
    --workdir, -w <dir>    Working directory for `run` (default /analysis)
    --timeout, -t <secs>   Wall-clock bound for `run`
    --overwrite            Replace an existing transfer destination
    --json                 Machine-readable output

EXAMPLES:
    fwbridge provision
    fwbridge upload firmware.bin /analysis/firmware.bin
    fwbridge run -w /analysis -- binwalk -e firmware.bin
    fwbridge download /analysis/_firmware.bin.extracted/output.txt out.txt
"#
    );
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match parse_args() {
        Ok(cmd) => {
            let result = match cmd {
                Command::Probe { json } => cmd_probe(json).await,
                Command::Provision { backend } => cmd_provision(backend).await,
                Command::Status { json } => cmd_status(json),
                Command::Container { action, tail } => cmd_container(action, tail).await,
                Command::Run {
                    argv,
                    workdir,
                    timeout,
                } => cmd_run(argv, workdir, timeout).await,
                Command::Upload {
                    local,
                    remote,
                    overwrite,
                } => cmd_upload(local, remote, overwrite).await,
                Command::Download {
                    remote,
                    local,
                    overwrite,
                } => cmd_download(remote, local, overwrite).await,
                Command::Destroy => cmd_destroy(),
                Command::Version => {
                    cmd_version();
                    Ok(())
                }
                Command::Help => {
                    cmd_help();
                    Ok(())
                }
            };

            match result {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {}", e);
                    ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {}", e);
            cmd_help();
            ExitCode::FAILURE
        }
    }
}
