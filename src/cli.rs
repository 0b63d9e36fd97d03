use anyhow::{anyhow, Result};
use clap::{Arg, ArgMatches, Command};
use parking_lot::Mutex;
use std::sync::{atomic::AtomicBool, Arc};

use crate::{
    config::ServerConfig,
    port::{Instance, InstanceBuilder, ListenSocketPool, Parity, SerialPortDevice, TransportMode},
    server::{ModbusServer, SharedStorage},
};

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .short('c')
        .help("Configuration file (.toml or .json)")
        .value_name("FILE")
}

fn build_command() -> Command {
    Command::new("mbport")
        .about("Modbus server on top of the mbport porting layer")
        .subcommand_required(true)
        .subcommand(
            Command::new("serve")
                .about("Serve Modbus requests until Ctrl+C")
                .arg(config_arg())
                .arg(
                    Arg::new("mode")
                        .long("mode")
                        .short('m')
                        .help("Transport: tcp, rtu or ascii")
                        .value_name("MODE")
                        .value_parser(["tcp", "rtu", "ascii"]),
                )
                .arg(
                    Arg::new("unit-id")
                        .long("unit-id")
                        .help("Modbus unit identifier to answer")
                        .value_name("ID")
                        .value_parser(clap::value_parser!(u8)),
                )
                .arg(
                    Arg::new("tcp-port")
                        .long("tcp-port")
                        .short('p')
                        .help("TCP port shared by all instances (0 selects 502)")
                        .value_name("PORT")
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("instances")
                        .long("instances")
                        .short('n')
                        .help("Number of TCP instances, i.e. concurrent clients")
                        .value_name("COUNT")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    Arg::new("keepalive-ms")
                        .long("keepalive-ms")
                        .help("Drop idle TCP clients after this many milliseconds (0 = never)")
                        .value_name("MS")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("device")
                        .long("device")
                        .short('d')
                        .help("Serial device for rtu/ascii mode")
                        .value_name("PATH"),
                )
                .arg(
                    Arg::new("baud")
                        .long("baud")
                        .short('b')
                        .help("Serial baud rate")
                        .value_name("BAUD")
                        .value_parser(clap::value_parser!(u32)),
                )
                .arg(
                    Arg::new("parity")
                        .long("parity")
                        .help("Serial parity: none, odd or even")
                        .value_name("PARITY")
                        .value_parser(["none", "odd", "even"]),
                ),
        )
        .subcommand(
            Command::new("print-config")
                .about("Print the effective configuration as TOML")
                .arg(config_arg()),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    build_command().get_matches()
}

/// Loads the configuration file named by `--config`, if any, and applies the
/// command line overrides on top.
pub fn resolve_config(matches: &ArgMatches) -> Result<ServerConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };

    let has = |id: &str| matches!(matches.try_contains_id(id), Ok(true));

    if has("mode") {
        if let Some(mode) = matches.get_one::<String>("mode") {
            config.mode = mode
                .parse::<TransportMode>()
                .map_err(|_| anyhow!("unknown mode {mode}"))?;
        }
    }
    if has("unit-id") {
        if let Some(&unit_id) = matches.get_one::<u8>("unit-id") {
            config.unit_id = unit_id;
        }
    }
    if has("tcp-port") {
        if let Some(&port) = matches.get_one::<u16>("tcp-port") {
            config.tcp.port = port;
        }
    }
    if has("instances") {
        if let Some(&instances) = matches.get_one::<usize>("instances") {
            config.instances = instances;
        }
    }
    if has("keepalive-ms") {
        if let Some(&keepalive_ms) = matches.get_one::<u64>("keepalive-ms") {
            config.tcp.keepalive_ms = keepalive_ms;
        }
    }
    if has("device") {
        if let Some(device) = matches.get_one::<String>("device") {
            config.serial.device = device.clone();
        }
    }
    if has("baud") {
        if let Some(&baud) = matches.get_one::<u32>("baud") {
            config.serial.baud_rate = baud;
        }
    }
    if has("parity") {
        if let Some(parity) = matches.get_one::<String>("parity") {
            config.serial.parity = match parity.as_str() {
                "odd" => Parity::Odd,
                "even" => Parity::Even,
                _ => Parity::None,
            };
        }
    }

    config.validate()?;
    Ok(config)
}

/// Builds and binds every instance the configuration asks for. Instances
/// already bound are released again if a later one fails.
fn open_endpoints(config: &ServerConfig) -> Result<Vec<Instance>> {
    match config.mode {
        TransportMode::Tcp => {
            let pool = Arc::new(ListenSocketPool::with_backlog(
                config.tcp.pool_slots,
                config.tcp.backlog,
            ));
            let mut endpoints: Vec<Instance> = Vec::with_capacity(config.instances);
            for index in 0..config.instances {
                let mut port = InstanceBuilder::new(TransportMode::Tcp)
                    .with_name(format!("tcp-{index}"))
                    .with_pool(pool.clone())
                    .with_frame_capacity(config.frame_capacity)
                    .with_keepalive(config.tcp.keepalive())
                    .build();
                if !port.tcp_init(config.tcp.port) {
                    for bound in &mut endpoints {
                        bound.tcp_close();
                    }
                    return Err(anyhow!(
                        "{}: cannot listen on port {}",
                        port.name(),
                        config.tcp.port
                    ));
                }
                endpoints.push(port);
            }
            Ok(endpoints)
        }
        mode @ (TransportMode::Rtu | TransportMode::Ascii) => {
            let serial = &config.serial;
            let mut port = InstanceBuilder::new(mode)
                .with_name(serial.device.clone())
                .with_frame_capacity(config.frame_capacity)
                .with_serial(Box::new(SerialPortDevice::new(serial.device.clone())))
                .build();
            if !port.serial_init(serial.baud_rate, serial.data_bits, serial.parity) {
                return Err(anyhow!("cannot open serial device {}", serial.device));
            }
            Ok(vec![port])
        }
    }
}

/// Runs one server instance per configured endpoint, each on its own thread,
/// until `stop` is raised. Returns the first instance failure.
pub fn serve(config: &ServerConfig, stop: Arc<AtomicBool>) -> Result<()> {
    let storage: SharedStorage = Arc::new(Mutex::new(Default::default()));
    let endpoints = open_endpoints(config)?;

    let (done_tx, done_rx) = flume::unbounded::<(String, Result<()>)>();
    let mut handles = Vec::new();
    for mut port in endpoints {
        let mut server = ModbusServer::new(config.unit_id, storage.clone())
            .with_baud_rate(config.serial.baud_rate);
        let name = port.name().to_string();
        let stop = stop.clone();
        let done_tx = done_tx.clone();
        handles.push(std::thread::spawn(move || {
            let result = server.run(&mut port, &stop);
            let _ = done_tx.send((name, result));
        }));
    }
    drop(done_tx);

    log::info!(
        "Serving {} {} instance(s). Press Ctrl+C to stop.",
        handles.len(),
        config.mode
    );

    // The first failing instance stops the others.
    let mut first_error = None;
    for (name, result) in done_rx.iter() {
        match result {
            Ok(()) => log::info!("{name}: finished"),
            Err(err) => {
                log::error!("{name}: {err}");
                stop.store(true, std::sync::atomic::Ordering::SeqCst);
                first_error.get_or_insert(err);
            }
        }
    }
    for handle in handles {
        if handle.join().is_err() {
            first_error.get_or_insert(anyhow!("instance thread panicked"));
        }
    }

    first_error.map_or(Ok(()), Err)
}
