//! Application definition.

extern crate simplelog;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Error, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use simfabric_net::{
    Codec, Encoding, EndpointInfo, Engine, FabricConfig, Master, SimServer, TlsConfig, TlsFiles,
    TransportKind, DEFAULT_DISCOVERY_PORT,
};

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");
pub const AUTHORS: &'static str = env!("CARGO_PKG_AUTHORS");

pub fn app<'a, 'b>() -> App<'a, 'b> {
    let app = App::new("simfabric")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(VERSION)
        .author(AUTHORS)
        .about("Run simulation workers, discover them and submit tasks from the command line.")
        .arg(Arg::with_name("verbosity")
            .long("verbosity")
            .short("v")
            .takes_value(true)
            .default_value("info")
            .value_name("verb")
            .global(true)
            .help("Set the verbosity of the log output"))
        .arg(Arg::with_name("config")
            .long("config")
            .takes_value(true)
            .value_name("path")
            .global(true)
            .help("Path to a toml config file, command line options take precedence"))
        .arg(Arg::with_name("encoding")
            .long("encoding")
            .short("e")
            .takes_value(true)
            .value_name("encoding")
            .possible_values(&["bincode", "msgpack", "json"])
            .global(true)
            .help("Encoding used for discovery and typed messages"))

        // worker subcommand
        .subcommand(SubCommand::with_name("worker")
            .display_order(10)
            .about("Start a worker accepting tasks from masters")
            .long_about("Start a worker accepting tasks from masters.\n\n\
            The worker runs a built-in echo engine, sending every task back \n\
            unchanged. Setting a discovery port makes the worker answer \n\
            announces from masters on the local network.")
            .arg(Arg::with_name("ip")
                .long("ip")
                .takes_value(true)
                .value_name("address")
                .help("Set the address for the worker, together with port (e.g. 0.0.0.0:7000)"))
            .arg(Arg::with_name("name")
                .long("name")
                .takes_value(true)
                .value_name("string")
                .help("Name for the worker"))
            .arg(Arg::with_name("transport")
                .long("transport")
                .short("t")
                .takes_value(true)
                .value_name("kind")
                .possible_values(&["plain", "secure"])
                .help("Transport kind of accepted connections"))
            .arg(Arg::with_name("discovery-port")
                .long("discovery-port")
                .short("d")
                .takes_value(true)
                .value_name("port")
                .help("Make the worker discoverable on the given datagram port"))
            .arg(Arg::with_name("advertise")
                .long("advertise")
                .takes_value(true)
                .value_name("ip")
                .help("Address announced to masters instead of the bound one"))
            .arg(Arg::with_name("timeout")
                .long("timeout")
                .takes_value(true)
                .value_name("millis")
                .help("Close connections idle for longer than this, 0 keeps them forever"))
            .arg(Arg::with_name("cert")
                .long("cert")
                .takes_value(true)
                .value_name("path")
                .requires("key")
                .help("PEM certificate chain presented to secure clients"))
            .arg(Arg::with_name("key")
                .long("key")
                .takes_value(true)
                .value_name("path")
                .requires("cert")
                .help("PEM private key matching the certificate"))
        )

        // discover subcommand
        .subcommand(SubCommand::with_name("discover")
            .display_order(20)
            .about("Announce to workers and list the ones that answer")
            .arg(Arg::with_name("targets")
                .long("targets")
                .takes_value(true)
                .value_name("addresses")
                .help("Comma-separated list of discovery addresses, defaults to broadcast"))
            .arg(Arg::with_name("wait")
                .long("wait")
                .short("w")
                .takes_value(true)
                .value_name("millis")
                .help("How long to wait for answers"))
        )

        // submit subcommand
        .subcommand(SubCommand::with_name("submit")
            .display_order(30)
            .about("Submit a single task to a worker and print the result")
            .arg(Arg::with_name("worker")
                .required(true)
                .long("worker")
                .short("w")
                .takes_value(true)
                .value_name("endpoint")
                .help("Worker endpoint, with transport kind (e.g. secure://10.0.0.4:7000)"))
            .arg(Arg::with_name("payload")
                .required(true)
                .long("payload")
                .short("p")
                .takes_value(true)
                .value_name("string")
                .help("Task payload, sent as utf-8 bytes"))
            .arg(Arg::with_name("timeout")
                .long("timeout")
                .takes_value(true)
                .value_name("millis")
                .help("How long to wait for the result, 0 waits forever"))
            .arg(Arg::with_name("ca")
                .long("ca")
                .takes_value(true)
                .value_name("path")
                .help("PEM file with certificates trusted for secure workers"))
            .arg(Arg::with_name("insecure")
                .long("insecure")
                .help("Skip verifying the certificate of secure workers"))
        );

    app
}

pub fn app_matches() -> ArgMatches<'static> {
    app().get_matches()
}

/// Runs based on specified subcommand.
pub fn start(matches: ArgMatches) -> Result<()> {
    match matches.subcommand() {
        ("worker", Some(m)) => start_worker(m),
        ("discover", Some(m)) => start_discover(m),
        ("submit", Some(m)) => start_submit(m),
        _ => Ok(()),
    }
}

/// Starts a new worker based on the passed arguments.
fn start_worker(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let fabric = load_config(matches)?;
    let mut config = fabric.worker.clone();

    if let Some(addr) = matches.value_of("ip") {
        let addr: SocketAddr = addr
            .parse()
            .with_context(|| format!("invalid worker address: {}", addr))?;
        config.address = addr.ip();
        config.port = addr.port();
    }
    if let Some(name) = matches.value_of("name") {
        config.name = name.to_string();
    }
    if let Some(transport) = matches.value_of("transport") {
        config.transport = transport.parse()?;
    }
    if let Some(port) = matches.value_of("discovery-port") {
        config.discovery_port = Some(
            port.parse()
                .with_context(|| format!("invalid discovery port: {}", port))?,
        );
    }
    if let Some(ip) = matches.value_of("advertise") {
        config.advertise_address = Some(
            ip.parse()
                .with_context(|| format!("invalid advertise address: {}", ip))?,
        );
    }
    if let Some(millis) = matches.value_of("timeout") {
        config.read_timeout_ms = Some(
            millis
                .parse()
                .with_context(|| format!("failed parsing timeout (millis) value: {}", millis))?,
        );
    }
    if let Some(encoding) = matches.value_of("encoding") {
        config.encoding = encoding.parse()?;
    }

    let tls = match (matches.value_of("cert"), matches.value_of("key")) {
        (Some(cert), Some(key)) => Some(
            TlsFiles {
                cert: Some(PathBuf::from(cert)),
                key: Some(PathBuf::from(key)),
                ..fabric.tls.clone().unwrap_or_default()
            }
            .to_tls_config()?,
        ),
        _ => fabric.tls_config()?,
    };
    if config.transport == TransportKind::Secure && tls.is_none() {
        return Err(Error::msg(
            "secure worker requires a certificate and key (--cert and --key)",
        ));
    }

    let codec = Arc::new(Codec::new(config.encoding)?);
    let engine: Arc<dyn Engine> = Arc::new(|task: &[u8]| -> simfabric_net::Result<Vec<u8>> {
        debug!("echoing task of {} bytes", task.len());
        Ok(task.to_vec())
    });

    let mut server = SimServer::start(config, engine, tls.map(Arc::new), codec)?;
    println!(
        "worker listening on: {} (advertised as {})",
        server.local_addr(),
        server.local_info()
    );
    if let Some(discovery) = server.discovery() {
        println!("answering discovery on: {}", discovery.local_addr());
    }

    // run a loop allowing graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("failed setting ctrl-c handler")?;

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }
    println!("Initiating graceful shutdown...");
    let masters = server.known_masters();
    server.stop();
    info!("masters known at shutdown: {}", masters.len());

    Ok(())
}

fn start_discover(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let fabric = load_config(matches)?;
    let mut config = fabric.master.clone();

    if let Some(targets) = matches.value_of("targets") {
        config.targets = parse_targets(targets)?;
    }
    if let Some(millis) = matches.value_of("wait") {
        config.discovery_wait_ms = millis
            .parse()
            .with_context(|| format!("failed parsing wait (millis) value: {}", millis))?;
    }
    if let Some(encoding) = matches.value_of("encoding") {
        config.encoding = encoding.parse()?;
    }

    let master = Master::new(config, None)?;
    let workers = master.discover_configured()?;
    if workers.is_empty() {
        println!("no workers answered");
    }
    for worker in &workers {
        println!("{}", worker);
    }
    Ok(())
}

fn start_submit(matches: &ArgMatches) -> Result<()> {
    setup_log_verbosity(matches);
    let fabric = load_config(matches)?;
    let mut config = fabric.master.clone();

    let worker: EndpointInfo = matches
        .value_of("worker")
        .ok_or(Error::msg("worker endpoint must be provided"))?
        .parse()?;
    let payload = matches
        .value_of("payload")
        .ok_or(Error::msg("payload must be provided"))?;
    if let Some(millis) = matches.value_of("timeout") {
        config.read_timeout_ms = Some(
            millis
                .parse()
                .with_context(|| format!("failed parsing timeout (millis) value: {}", millis))?,
        );
    }
    if let Some(encoding) = matches.value_of("encoding") {
        config.encoding = encoding.parse::<Encoding>()?;
    }

    let tls = match worker.kind() {
        TransportKind::Plain => None,
        TransportKind::Secure => Some(client_tls(matches, &fabric)?),
    };

    let master = Master::new(config, tls.map(Arc::new))?;
    let result = master
        .submit(&worker, payload.as_bytes())
        .with_context(|| format!("task submission to {} failed", worker))?;
    println!("{}", String::from_utf8_lossy(&result));
    Ok(())
}

/// Tls settings for reaching a secure worker, command line first.
fn client_tls(matches: &ArgMatches, fabric: &FabricConfig) -> Result<TlsConfig> {
    if matches.is_present("insecure") {
        warn!("not verifying the worker's certificate");
        return Ok(TlsConfig::builder()
            .dangerous_disable_verification()
            .build()?);
    }
    if let Some(ca) = matches.value_of("ca") {
        return Ok(TlsConfig::builder().with_roots_file(ca)?.build()?);
    }
    fabric
        .tls_config()?
        .ok_or(Error::msg(
            "secure worker requires trusted certificates (--ca, --insecure or a [tls] config section)",
        ))
}

fn load_config(matches: &ArgMatches) -> Result<FabricConfig> {
    match matches.value_of("config") {
        Some(path) => Ok(FabricConfig::load(path)?),
        None => Ok(FabricConfig::default()),
    }
}

fn parse_targets(s: &str) -> Result<Vec<SocketAddr>> {
    s.split(',')
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .map(|t| {
            if t.contains(':') {
                t.parse::<SocketAddr>()
                    .with_context(|| format!("invalid target address: {}", t))
            } else {
                // bare ip, use the default discovery port
                Ok(SocketAddr::new(
                    t.parse()
                        .with_context(|| format!("invalid target address: {}", t))?,
                    DEFAULT_DISCOVERY_PORT,
                ))
            }
        })
        .collect()
}

fn setup_log_verbosity(matches: &ArgMatches) {
    use self::simplelog::{LevelFilter, TermLogger};
    let level_filter = match matches.value_of("verbosity") {
        Some(s) => match s {
            "0" | "none" => LevelFilter::Off,
            "1" | "err" | "error" | "min" => LevelFilter::Error,
            "2" | "warn" | "warning" | "default" => LevelFilter::Warn,
            "3" | "info" => LevelFilter::Info,
            "4" | "debug" => LevelFilter::Debug,
            "5" | "trace" | "max" | "all" => LevelFilter::Trace,
            _ => LevelFilter::Warn,
        },
        _ => LevelFilter::Warn,
    };
    let mut config_builder = simplelog::ConfigBuilder::new();
    let logger_conf = config_builder
        .set_time_level(LevelFilter::Error)
        .set_target_level(LevelFilter::Debug)
        .set_location_level(LevelFilter::Trace)
        .set_time_format_str("%H:%M:%S%.6f")
        .build();
    let _ = TermLogger::init(level_filter, logger_conf, simplelog::TerminalMode::Mixed);
}

#[test]
fn targets_accept_bare_ips() {
    let targets = parse_targets("192.168.1.255, 10.0.0.3:6000,").unwrap();
    assert_eq!(targets.len(), 2);
    assert_eq!(targets[0].port(), DEFAULT_DISCOVERY_PORT);
    assert_eq!(targets[1].port(), 6000);
    assert!(parse_targets("not-an-ip").is_err());
}

#[test]
fn submit_requires_worker_and_payload() {
    assert!(app()
        .get_matches_from_safe(vec!["simfabric", "submit", "--payload", "x"])
        .is_err());
    let matches = app()
        .get_matches_from_safe(vec![
            "simfabric",
            "submit",
            "--worker",
            "plain://127.0.0.1:7000",
            "--payload",
            "x",
        ])
        .unwrap();
    assert!(matches.subcommand_matches("submit").is_some());
}

#[test]
fn worker_cert_requires_key() {
    assert!(app()
        .get_matches_from_safe(vec!["simfabric", "worker", "--cert", "a.pem"])
        .is_err());
}
