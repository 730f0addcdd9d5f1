use anyhow::{bail, Context, Result};
use serverdock::config::Config;
use serverdock::db::{Database, InstanceStore, SettingsStore};
use serverdock::docker::{ContainerRuntime, DockerManager};
use serverdock::instance::{InstanceRecord, Settings};
use serverdock::lease::LeaseDir;
use serverdock::network::NetworkExposureManager;
use serverdock::orchestrator::{NewInstance, OperationOutcome, Orchestrator};
use serverdock::ports::{PortAllocator, SystemProbe};
use serverdock::proxy::ProxyCoordinator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "serverdock.toml";

/// CLI command structure
#[derive(Debug)]
enum Command {
    Create(CreateOptions),
    List,
    Start { id: String },
    Stop { id: String },
    Restart { id: String },
    Delete { id: String },
    Status { id: String },
    Stats { id: String },
    Logs { id: String, tail: usize },
    Exec { id: String, command: String },
    Set { id: String, settings: Vec<(String, String)> },
    Hostname { id: String, hostname: Option<String> },
    Router(RouterCommand),
    Ports,
    ProxySync,
    Restore,
    Help,
    Version,
}

#[derive(Debug)]
struct CreateOptions {
    id: String,
    family: String,
    memory_mb: u64,
    cpu_cores: f64,
    port: Option<u16>,
    hostname: Option<String>,
    settings: Vec<(String, String)>,
}

#[derive(Debug)]
enum RouterCommand {
    On,
    Off,
    Status { id: Option<String> },
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("serverdock=debug".parse().expect("valid log directive")),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, rest) = split_config_flag(&args)?;

    let command = parse_command(&rest)?;
    match command {
        Command::Help => {
            print_help();
            return Ok(());
        }
        Command::Version => {
            println!("serverdock {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    let config = load_config(config_path.as_deref())?;
    let orchestrator = build_orchestrator(&config).await?;

    match command {
        Command::Create(opts) => {
            let record = orchestrator
                .create(NewInstance {
                    id: opts.id,
                    family: opts.family,
                    settings: opts.settings.into_iter().collect(),
                    memory_mb: opts.memory_mb,
                    cpu_cores: opts.cpu_cores,
                    port: opts.port,
                    hostname: opts.hostname,
                })
                .await?;
            println!("Created {} on port {}/{}", record.id, record.port, record.protocol);
        }
        Command::List => print_instances(&orchestrator.list()?),
        Command::Start { id } => {
            let handle = orchestrator.spawn_start(&id);
            println!("Starting {}...", id);
            print_outcome(&handle.await.context("start task panicked")??);
        }
        Command::Stop { id } => print_outcome(&orchestrator.stop(&id).await?),
        Command::Restart { id } => print_outcome(&orchestrator.restart(&id).await?),
        Command::Delete { id } => print_outcome(&orchestrator.delete(&id).await?),
        Command::Status { id } => {
            let record = orchestrator.status(&id).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Stats { id } => match orchestrator.stats(&id).await? {
            Some(stats) => println!(
                "CPU {:.1}%  MEM {:.0}/{:.0} MB ({:.1}%)",
                stats.cpu_percent, stats.mem_used_mb, stats.mem_limit_mb, stats.mem_percent
            ),
            None => println!("{}: container is gone, instance marked stopped", id),
        },
        Command::Logs { id, tail } => match orchestrator.logs(&id, tail).await? {
            Some(text) => print!("{}", text),
            None => println!("{}: container is gone, instance marked stopped", id),
        },
        Command::Exec { id, command } => print!("{}", orchestrator.send_command(&id, &command).await?),
        Command::Set { id, settings } => {
            let current = orchestrator.status(&id).await?;
            let mut merged: Settings = current.settings;
            for (key, value) in settings {
                if value.is_empty() {
                    merged.remove(&key);
                } else {
                    merged.insert(key, value);
                }
            }
            print_outcome(&orchestrator.update_settings(&id, merged).await?);
        }
        Command::Hostname { id, hostname } => print_outcome(&orchestrator.set_hostname(&id, hostname).await?),
        Command::Router(RouterCommand::On) => {
            orchestrator.set_router_automation(true)?;
            println!("Router automation enabled");
        }
        Command::Router(RouterCommand::Off) => {
            orchestrator.set_router_automation(false)?;
            println!("Router automation disabled");
        }
        Command::Router(RouterCommand::Status { id }) => {
            let network = orchestrator.network();
            println!(
                "Router automation: {}",
                if network.router_automation_enabled() { "on" } else { "off" }
            );
            match id {
                Some(id) => {
                    let status = orchestrator.exposure_status(&id).await?;
                    let mapped = match status.router_mapped {
                        Some(true) => "forwarded",
                        Some(false) => "not forwarded",
                        None => "unknown (router unreachable)",
                    };
                    println!("{}: port {} {}", id, status.port, mapped);
                }
                None => {
                    for mapping in network.list_router_mappings().await? {
                        println!(
                            "{:>5}/{}  -> {}:{}  {}",
                            mapping.external_port,
                            mapping.transport,
                            mapping.internal_client,
                            mapping.internal_port,
                            mapping.description
                        );
                    }
                }
            }
        }
        Command::Ports => {
            for allocation in orchestrator.ports().allocations() {
                println!("{:>5}/{:<4}  {}", allocation.port, allocation.protocol.as_str(), allocation.owner);
            }
            for listener in orchestrator.ports().listeners() {
                println!(
                    "{:>5}/{:<4}  proxy listener for {}",
                    listener.port,
                    listener.protocol.as_str(),
                    listener.owner
                );
            }
        }
        Command::ProxySync => {
            let report = orchestrator.proxy_sync().await?;
            println!(
                "Proxy {} with {} route(s)",
                if report.proxy_running { "running" } else { "removed" },
                report.routes.len()
            );
            for id in report.shadowed {
                println!("  shadowed: {}", id);
            }
        }
        Command::Restore => {
            for outcome in orchestrator.restore().await? {
                print_outcome(&outcome);
            }
        }
        Command::Help | Command::Version => {}
    }

    Ok(())
}

/// Wire every component from configuration
async fn build_orchestrator(config: &Config) -> Result<Arc<Orchestrator>> {
    let db = Arc::new(Database::open(&config.database.path).context("Failed to open database")?);
    db.init_router_automation(config.network.router_automation)?;
    let store: Arc<dyn InstanceStore> = db.clone();
    let settings: Arc<dyn SettingsStore> = db;
    let leases = LeaseDir::open(&config.database.lock_dir)
        .with_context(|| format!("Failed to open lock directory {}", config.database.lock_dir))?;

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        DockerManager::new(config.runtime.clone())
            .await
            .context("Failed to connect to Docker")?,
    );

    let ports = Arc::new(PortAllocator::new(&config.ports, Arc::new(SystemProbe)));
    let network = Arc::new(NetworkExposureManager::from_config(&config.network, settings));
    let proxy = ProxyCoordinator::new(
        runtime.clone(),
        store.clone(),
        config.proxy.clone(),
        config.runtime.network.clone(),
    )
    .with_leases(leases.clone())
    .spawn();

    let orchestrator = Arc::new(Orchestrator::new(runtime, store, ports, network, proxy, config).with_leases(leases));
    let records = orchestrator.seed_ports()?;
    info!(instances = records.len(), "Port allocations loaded");
    Ok(orchestrator)
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path).map_err(|e| {
            error!(path = %path.display(), error = %e, "Failed to load configuration");
            e
        }),
        None if Path::new(DEFAULT_CONFIG).exists() => Config::load(DEFAULT_CONFIG),
        None => {
            info!("No {} found, using defaults", DEFAULT_CONFIG);
            Ok(Config::default())
        }
    }
}

/// Pull `--config PATH` out of the argument list
fn split_config_flag(args: &[String]) -> Result<(Option<PathBuf>, Vec<String>)> {
    let mut config = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            let Some(path) = iter.next() else {
                bail!("--config requires a path");
            };
            config = Some(PathBuf::from(path));
        } else if let Some(path) = arg.strip_prefix("--config=") {
            config = Some(PathBuf::from(path));
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((config, rest))
}

fn parse_command(args: &[String]) -> Result<Command> {
    let Some(name) = args.first() else {
        return Ok(Command::Help);
    };
    let rest = &args[1..];

    let id = || -> Result<String> {
        rest.first()
            .cloned()
            .with_context(|| format!("usage: serverdock {} <id>", name))
    };

    let command = match name.as_str() {
        "help" | "--help" | "-h" => Command::Help,
        "version" | "--version" | "-V" => Command::Version,
        "create" => parse_create_command(rest)?,
        "list" | "ls" => Command::List,
        "start" => Command::Start { id: id()? },
        "stop" => Command::Stop { id: id()? },
        "restart" => Command::Restart { id: id()? },
        "delete" | "rm" => Command::Delete { id: id()? },
        "status" => Command::Status { id: id()? },
        "stats" => Command::Stats { id: id()? },
        "logs" => {
            let mut tail = 100;
            if let Some(pos) = rest.iter().position(|a| a == "--tail" || a == "-n") {
                tail = rest
                    .get(pos + 1)
                    .context("--tail requires a number")?
                    .parse()
                    .context("--tail must be a number")?;
            }
            Command::Logs { id: id()?, tail }
        }
        "exec" => {
            let id = id()?;
            if rest.len() < 2 {
                bail!("usage: serverdock exec <id> <command...>");
            }
            Command::Exec {
                id,
                command: shell_words::join(&rest[1..]),
            }
        }
        "set" => Command::Set {
            id: id()?,
            settings: parse_settings(&rest[1..])?,
        },
        "hostname" => Command::Hostname {
            id: id()?,
            hostname: rest.get(1).cloned(),
        },
        "router" => match rest.first().map(String::as_str) {
            Some("on") => Command::Router(RouterCommand::On),
            Some("off") => Command::Router(RouterCommand::Off),
            Some("status") | None => Command::Router(RouterCommand::Status { id: rest.get(1).cloned() }),
            Some(other) => bail!("unknown router command '{}'; expected on, off or status", other),
        },
        "ports" => Command::Ports,
        "proxy-sync" => Command::ProxySync,
        "restore" => Command::Restore,
        other => bail!("unknown command '{}'; run 'serverdock help'", other),
    };
    Ok(command)
}

fn parse_create_command(args: &[String]) -> Result<Command> {
    let (Some(id), Some(family)) = (args.first(), args.get(1)) else {
        bail!("usage: serverdock create <id> <family> [--memory MB] [--cpus N] [--port P] [--hostname H] [key=value...]");
    };

    let mut opts = CreateOptions {
        id: id.clone(),
        family: family.clone(),
        memory_mb: 2048,
        cpu_cores: 1.0,
        port: None,
        hostname: None,
        settings: Vec::new(),
    };

    let mut iter = args[2..].iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--memory" | "-m" => {
                opts.memory_mb = iter
                    .next()
                    .context("--memory requires a value")?
                    .parse()
                    .context("--memory must be megabytes")?;
            }
            "--cpus" => {
                opts.cpu_cores = iter
                    .next()
                    .context("--cpus requires a value")?
                    .parse()
                    .context("--cpus must be a number")?;
            }
            "--port" | "-p" => {
                opts.port = Some(
                    iter.next()
                        .context("--port requires a value")?
                        .parse()
                        .context("--port must be a port number")?,
                );
            }
            "--hostname" => {
                opts.hostname = Some(iter.next().context("--hostname requires a value")?.clone());
            }
            _ => opts.settings.extend(parse_settings(std::slice::from_ref(arg))?),
        }
    }

    Ok(Command::Create(opts))
}

/// Parse `key=value` arguments
fn parse_settings(args: &[String]) -> Result<Vec<(String, String)>> {
    args.iter()
        .map(|arg| {
            arg.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .with_context(|| format!("expected key=value, got '{}'", arg))
        })
        .collect()
}

fn print_instances(records: &[InstanceRecord]) {
    if records.is_empty() {
        println!("No instances");
        return;
    }
    println!("{:<20} {:<10} {:<9} {:>11} {}", "ID", "FAMILY", "STATUS", "PORT", "HOSTNAME");
    for record in records {
        println!(
            "{:<20} {:<10} {:<9} {:>11} {}",
            record.id,
            record.family.adapter().kind(),
            record.status.as_str(),
            format!("{}/{}", record.port, record.protocol),
            record.hostname.as_deref().unwrap_or("-")
        );
    }
}

fn print_outcome(outcome: &OperationOutcome) {
    println!("{}: {} ({}, port {})", outcome.id, outcome.message, outcome.status, outcome.port);
    if let Some(warning) = &outcome.warning {
        println!("  warning: {}", warning);
    }
}

fn print_help() {
    println!(
        r#"serverdock - containerized server control plane

USAGE:
    serverdock [--config PATH] <COMMAND>

COMMANDS:
    create <id> <family> [options] [key=value...]
                              Declare an instance (family: minecraft, factorio, custom)
        --memory MB           Memory limit (default: 2048)
        --cpus N              CPU limit in cores (default: 1.0)
        --port P              Preferred host port
        --hostname H          Route through the shared proxy
    list                      List instances
    start <id>                Start or re-apply an instance
    stop <id>                 Stop an instance
    restart <id>              Stop, settle, start
    delete <id>               Remove container, volume and record
    status <id>               Show the reconciled record
    stats <id>                Show CPU and memory usage
    logs <id> [--tail N]      Show recent output
    exec <id> <command...>    Send an admin command
    set <id> key=value...     Update settings (empty value removes a key)
    hostname <id> [name]      Set or clear the routed hostname
    router on|off             Toggle router port forwarding
    router status [id]        Show router mappings
    ports                     Show port assignments
    proxy-sync                Regenerate the shared proxy
    restore                   Reconcile all instances with the engine
    help                      Show this help
    version                   Show version"#
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_split_config_flag() {
        let (config, rest) = split_config_flag(&args(&["--config", "/etc/sd.toml", "list"])).unwrap();
        assert_eq!(config, Some(PathBuf::from("/etc/sd.toml")));
        assert_eq!(rest, args(&["list"]));

        let (config, _) = split_config_flag(&args(&["--config=x.toml", "list"])).unwrap();
        assert_eq!(config, Some(PathBuf::from("x.toml")));

        assert!(split_config_flag(&args(&["--config"])).is_err());
    }

    #[test]
    fn test_parse_create_command() {
        let cmd = parse_command(&args(&[
            "create", "alpha", "minecraft", "--memory", "4096", "--hostname", "mc.example.com", "motd=hi",
        ]))
        .unwrap();
        match cmd {
            Command::Create(opts) => {
                assert_eq!(opts.id, "alpha");
                assert_eq!(opts.family, "minecraft");
                assert_eq!(opts.memory_mb, 4096);
                assert_eq!(opts.cpu_cores, 1.0);
                assert_eq!(opts.hostname.as_deref(), Some("mc.example.com"));
                assert_eq!(opts.settings, vec![("motd".to_string(), "hi".to_string())]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_exec_joins_words() {
        match parse_command(&args(&["exec", "alpha", "say", "hello world"])).unwrap() {
            Command::Exec { id, command } => {
                assert_eq!(id, "alpha");
                assert_eq!(shell_words::split(&command).unwrap(), args(&["say", "hello world"]));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_logs_tail() {
        match parse_command(&args(&["logs", "alpha", "--tail", "20"])).unwrap() {
            Command::Logs { id, tail } => {
                assert_eq!(id, "alpha");
                assert_eq!(tail, 20);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_command(&args(&["start"])).is_err());
        assert!(parse_command(&args(&["router", "maybe"])).is_err());
        assert!(parse_command(&args(&["frobnicate"])).is_err());
        assert!(matches!(parse_command(&[]).unwrap(), Command::Help));
    }

    #[test]
    fn test_parse_settings() {
        assert_eq!(
            parse_settings(&args(&["a=1", "b="])).unwrap(),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), String::new())]
        );
        assert!(parse_settings(&args(&["novalue"])).is_err());
    }
}
