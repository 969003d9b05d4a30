mod cli;
mod log;
mod shutdown;

use std::process::ExitCode;

use clap::Parser;
use dopeman_supervisor::{
    ExitState, LifecycleController, PortAllocator, SupervisorConfig, TaskOutcome, TaskRunner,
    check_environment, port_owner,
};
use miette::{IntoDiagnostic, Result};
use tracing::info;

use crate::cli::{Cli, Command};
use crate::shutdown::Shutdown;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    log::init_tracing(cli.level(), cli.log_format);

    let config = cli.load_config()?;

    match cli.command {
        Command::Up { skip_preflight } => up(config, skip_preflight).await,
        Command::Scan => {
            let outcome = TaskRunner::from_config(&config).run(&config.scan).await?;
            Ok(ExitCode::from(task_exit_status(&outcome)))
        }
        Command::HealthCheck => {
            let outcome = TaskRunner::from_config(&config)
                .run(&config.health_check)
                .await?;
            Ok(ExitCode::from(task_exit_status(&outcome)))
        }
        Command::Ports { check, json } => ports(&config, &check, json),
        Command::Check { json } => check(&config, json).await,
    }
}

async fn up(mut config: SupervisorConfig, skip_preflight: bool) -> Result<ExitCode> {
    let shutdown = Shutdown::new();
    shutdown.install_signals().into_diagnostic()?;

    if skip_preflight {
        config.preflight.enable = false;
    }
    let controller = LifecycleController::new(config);

    let ports = tokio::select! {
        ports = controller.start() => ports?,
        _ = shutdown.wait_for_shutdown() => {
            info!("Interrupted during startup");
            return Ok(ExitCode::from(shutdown.exit_code()));
        }
    };

    println!(
        "Dashboard: http://127.0.0.1:{}/{}",
        ports.http_port,
        controller.config().dashboard
    );
    println!("HTTP port: {}", ports.http_port);
    println!("WebSocket port: {}", ports.web_socket_port);

    shutdown.wait_for_shutdown().await;
    controller.stop().await;
    info!("All services stopped");
    Ok(ExitCode::SUCCESS)
}

/// Mirror a task's exit: its own code, or `128 + signal` when killed.
fn task_exit_status(outcome: &TaskOutcome) -> u8 {
    match outcome.exit {
        ExitState::Exited(code) => u8::try_from(code).unwrap_or(1),
        ExitState::Signaled(signal) => u8::try_from(128 + signal).unwrap_or(1),
    }
}

fn ports(config: &SupervisorConfig, check: &[u16], json: bool) -> Result<ExitCode> {
    let allocator = PortAllocator::new();

    if check.is_empty() {
        let port = allocator.find_available_port(config.ports)?;
        if json {
            println!("{}", serde_json::json!({ "port": port }));
        } else {
            println!("{port}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let availability = allocator.check_ports(check);
    if json {
        let report: Vec<_> = availability
            .iter()
            .map(|(&port, &available)| {
                serde_json::json!({
                    "port": port,
                    "available": available,
                    "owner": if available { None } else { port_owner(port) },
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
    } else {
        for (&port, &available) in &availability {
            if available {
                println!("{port}: free");
            } else {
                match port_owner(port) {
                    Some(owner) => println!("{port}: in use by {owner}"),
                    None => println!("{port}: in use"),
                }
            }
        }
    }

    let all_free = availability.values().all(|&available| available);
    Ok(if all_free {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn check(config: &SupervisorConfig, json: bool) -> Result<ExitCode> {
    let requirements = config
        .preflight
        .requirements
        .as_ref()
        .map(|path| config.commands_dir.join(path));
    let report = check_environment(&config.interpreter, requirements.as_deref()).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report).into_diagnostic()?);
    } else {
        println!("{} ({})", report.version, report.interpreter.display());
        for package in &report.packages {
            let mark = if package.installed { "ok" } else { "missing" };
            println!("  {}: {}", package.name, mark);
        }
    }

    report.ensure_complete(requirements.as_deref())?;
    Ok(ExitCode::SUCCESS)
}
