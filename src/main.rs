mod cli;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use crossbeam_channel::bounded;
use log::error;
use serde::Serialize;

use daemonctl::config::{ControllerConfig, resolve_config_path};
use daemonctl::monitor::StatusMonitor;
use daemonctl::observer::{ChannelObserver, LogObserver, StatusEvent};
use daemonctl::{AutoStartFlag, ControlError, LifecycleController, ServiceState};

fn main() {
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .init();

    match real_main() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

fn real_main() -> Result<i32> {
    let args = cli::Args::parse();
    let cfg_path = resolve_config_path(args.config, args.system)?;
    let cfg = ControllerConfig::load_or_create(&cfg_path)?;
    let ctl = cfg.controller()?;
    ctl.subscribe(Arc::new(LogObserver::new(ctl.descriptor().name())));

    match args.sub.unwrap_or(cli::Cmd::Status { json: false }) {
        cli::Cmd::Status { json } => handle_status(&ctl, json),
        cli::Cmd::Start => handle_request(&ctl, "started", ctl.request_start()),
        cli::Cmd::Stop => handle_request(&ctl, "stopped", ctl.request_stop()),
        cli::Cmd::Restart => handle_request(&ctl, "restarted", ctl.request_restart()),
        cli::Cmd::Enable => handle_auto_start(&ctl, true),
        cli::Cmd::Disable => handle_auto_start(&ctl, false),
        cli::Cmd::Watch { json, interval } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| cfg.poll_interval());
            handle_watch(ctl, interval, json)
        }
        cli::Cmd::Admin => handle_admin(&ctl),
    }
}

#[derive(Serialize)]
struct StatusReport<'a> {
    service: &'a str,
    status: ServiceState,
    auto_start: AutoStartFlag,
}

/// Exit 0 = running, 1 = anything else
fn handle_status(ctl: &LifecycleController, json: bool) -> Result<i32> {
    let state = ctl.poll_status();
    let auto_start = ctl.auto_start();
    let name = ctl.descriptor().name();
    if json {
        let report = StatusReport {
            service: name,
            status: state.clone(),
            auto_start,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{name} is {state}");
        println!("auto-start: {auto_start}");
    }
    Ok(if state.is_running() { 0 } else { 1 })
}

fn handle_request(
    ctl: &LifecycleController,
    verb: &str,
    outcome: Result<(), ControlError>,
) -> Result<i32> {
    let name = ctl.descriptor().name();
    match outcome {
        Ok(()) => {
            println!("{name} {verb} successfully ({})", ctl.state());
            Ok(0)
        }
        Err(e) => {
            eprintln!("{name} was not {verb}: {e}");
            Ok(1)
        }
    }
}

fn handle_auto_start(ctl: &LifecycleController, enabled: bool) -> Result<i32> {
    let name = ctl.descriptor().name();
    let word = if enabled { "enabled" } else { "disabled" };
    match ctl.set_auto_start(enabled) {
        Ok(()) => {
            println!("{name} auto-start {word}");
            Ok(0)
        }
        Err(e) => {
            eprintln!("Failed to change auto-start for {name}: {e}");
            Ok(1)
        }
    }
}

fn handle_watch(ctl: LifecycleController, interval: Duration, json: bool) -> Result<i32> {
    let (tx, rx) = bounded::<StatusEvent>(64);
    ctl.subscribe(Arc::new(ChannelObserver::new(tx)));

    let printer = thread::Builder::new()
        .name("status-printer".into())
        .spawn(move || {
            for event in rx {
                if json {
                    match serde_json::to_string(&event) {
                        Ok(line) => println!("{line}"),
                        Err(e) => error!("could not encode event: {e}"),
                    }
                } else {
                    print_event(&event);
                }
            }
        })
        .context("Failed to spawn printer thread")?;

    let mut monitor = StatusMonitor::new(Arc::new(ctl));
    monitor.run_until_signal(interval)?;
    // dropping the monitor drops the controller and with it the sender
    drop(monitor);
    printer
        .join()
        .map_err(|_| anyhow!("status printer panicked"))?;
    Ok(0)
}

fn print_event(event: &StatusEvent) {
    match event {
        StatusEvent::StateChanged { old, new, ts } => {
            println!("{} {old} -> {new}", ts.format("%Y-%m-%d %H:%M:%S"));
        }
        StatusEvent::AutoStartChanged { enabled, ts } => {
            let word = if *enabled { "enabled" } else { "disabled" };
            println!("{} auto-start {word}", ts.format("%Y-%m-%d %H:%M:%S"));
        }
    }
}

fn handle_admin(ctl: &LifecycleController) -> Result<i32> {
    let d = ctl.descriptor();
    let url = d
        .admin_console()
        .ok_or_else(|| anyhow!("no admin_url configured for {}", d.name()))?;
    opener::open(url).with_context(|| format!("Failed to open {url}"))?;
    println!("opened {url}");
    Ok(0)
}
