use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use satcore::board::Board;
use satcore::channel::{Channel, ChannelDriver, ChannelParams};
use satcore::config::BoardConfig;
use satcore::drivers::{PortmapClient, RemoteDriver};
use satcore::frame::Frame;
use satcore::platform::{Platform, SubsystemReport};
use satcore::subsystems::SubsystemStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "9000";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() -> CliResult {
    tracing_subscriber::fmt::init();

    let peripheral_arg = || {
        Arg::with_name("name")
            .help("Peripheral name registered with the portmapper")
            .required(true)
    };
    let len_arg = || {
        Arg::with_name("len")
            .long("len")
            .value_name("BYTES")
            .help("Bytes to receive")
            .takes_value(true)
            .default_value("64")
    };

    let matches = App::new("satcore")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🛰️  satcore flight-software core tools")
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Simulator host address")
                .takes_value(true)
                .default_value(DEFAULT_HOST)
                .global(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Portmapper port")
                .takes_value(true)
                .default_value(DEFAULT_PORT)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("🏓 Check that the portmapper answers"))
        .subcommand(
            SubCommand::with_name("status")
                .about("📊 Port and state of one simulated peripheral")
                .arg(peripheral_arg()),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("📤 Send hex bytes to a peripheral")
                .arg(peripheral_arg())
                .arg(Arg::with_name("data").help("Hex payload").required(true)),
        )
        .subcommand(
            SubCommand::with_name("recv")
                .about("📥 Receive bytes from a peripheral")
                .arg(peripheral_arg())
                .arg(len_arg()),
        )
        .subcommand(
            SubCommand::with_name("transact")
                .about("🔁 Send, wait, then receive")
                .arg(peripheral_arg())
                .arg(Arg::with_name("data").help("Hex payload").required(true))
                .arg(len_arg())
                .arg(
                    Arg::with_name("delay")
                        .long("delay")
                        .value_name("MS")
                        .help("Delay between send and receive")
                        .takes_value(true)
                        .default_value("0"),
                ),
        )
        .subcommand(SubCommand::with_name("commands").about("📜 Command tables of every subsystem as JSON"))
        .subcommand(
            SubCommand::with_name("run")
                .about("🚀 Boot a board and report subsystem status")
                .arg(
                    Arg::with_name("config")
                        .long("config")
                        .value_name("FILE")
                        .help("Board configuration (JSON); built-in host board if absent")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("seconds")
                        .long("seconds")
                        .value_name("SECONDS")
                        .help("How long to run")
                        .takes_value(true)
                        .default_value("10"),
                ),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST).to_string();
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let json = matches.value_of("format") == Some("json");

    match matches.subcommand() {
        ("ping", Some(_)) => cmd_ping(&host, port),
        ("status", Some(sub)) => cmd_status(&host, port, sub, json),
        ("send", Some(sub)) => cmd_send(&host, port, sub),
        ("recv", Some(sub)) => cmd_recv(&host, port, sub, json),
        ("transact", Some(sub)) => cmd_transact(&host, port, sub, json),
        ("commands", Some(_)) => cmd_commands(),
        ("run", Some(sub)) => cmd_run(sub, json),
        _ => {
            println!("{}", matches.usage());
            Ok(())
        }
    }
}

fn cmd_ping(host: &str, port: u16) -> CliResult {
    let started = Instant::now();
    PortmapClient::connect(host, port, CONNECT_TIMEOUT)?.ping()?;
    println!(
        "{} PONG1 from {}:{} in {} ms",
        "✅".green(),
        host,
        port,
        started.elapsed().as_millis()
    );
    Ok(())
}

fn cmd_status(host: &str, port: u16, sub: &ArgMatches, json: bool) -> CliResult {
    let name = sub.value_of("name").unwrap_or_default();
    let status = PortmapClient::connect(host, port, CONNECT_TIMEOUT)?.get_status(name)?;
    if json {
        println!("{}", serde_json::json!({ "name": name, "port": status.port, "running": status.running }));
    } else if status.port == 0 {
        println!("{} {} is not registered", "❌".red(), name.bold());
    } else {
        let state = if status.running { "running".green() } else { "stopped".yellow() };
        println!("{:<12} port {:<6} {}", name.bold(), status.port, state);
    }
    Ok(())
}

/// Opens a portmapped remote channel to `name`.
fn open_remote(host: &str, port: u16, name: &str) -> Result<Channel, satcore::Error> {
    let driver = Arc::new(ChannelDriver::new(RemoteDriver::portmapped()));
    driver.initialize()?;
    let channel = Channel::builder(name, driver)
        .params(ChannelParams::Portmapped {
            host: host.to_string(),
            portmapper_port: port,
            name: name.to_string(),
            config: String::new(),
        })
        .transaction_timeout(Duration::from_secs(1))
        .build()?;
    channel.open()?;
    Ok(channel)
}

fn parse_len(sub: &ArgMatches) -> Result<usize, Box<dyn std::error::Error>> {
    Ok(sub.value_of("len").unwrap_or("64").parse()?)
}

fn print_bytes(bytes: &[u8], json: bool) {
    if json {
        println!("{}", serde_json::json!({ "count": bytes.len(), "data": hex::encode(bytes) }));
    } else {
        println!("{} {} bytes: {}", "📥".cyan(), bytes.len(), hex::encode(bytes).bold());
    }
}

fn cmd_send(host: &str, port: u16, sub: &ArgMatches) -> CliResult {
    let name = sub.value_of("name").unwrap_or_default();
    let payload = hex::decode(sub.value_of("data").unwrap_or_default())?;
    let channel = open_remote(host, port, name)?;
    let mut frame = Frame::from_slice(&payload);
    channel.send(&mut frame, None)?;
    println!("{} sent {} bytes to {}", "📤".green(), payload.len(), name.bold());
    channel.close()?;
    Ok(())
}

fn cmd_recv(host: &str, port: u16, sub: &ArgMatches, json: bool) -> CliResult {
    let name = sub.value_of("name").unwrap_or_default();
    let channel = open_remote(host, port, name)?;
    let mut frame = Frame::with_capacity(parse_len(sub)?);
    channel.recv(&mut frame, None)?;
    print_bytes(frame.written(), json);
    channel.close()?;
    Ok(())
}

fn cmd_transact(host: &str, port: u16, sub: &ArgMatches, json: bool) -> CliResult {
    let name = sub.value_of("name").unwrap_or_default();
    let payload = hex::decode(sub.value_of("data").unwrap_or_default())?;
    let delay = Duration::from_millis(sub.value_of("delay").unwrap_or("0").parse()?);
    let channel = open_remote(host, port, name)?;

    let mut request = Frame::from_slice(&payload);
    let mut response = Frame::with_capacity(parse_len(sub)?);
    channel.transact(Some(&mut request), delay, Some(&mut response), None)?;
    print_bytes(response.written(), json);
    channel.close()?;
    Ok(())
}

fn cmd_commands() -> CliResult {
    let board = Board::new(BoardConfig::default())?;
    let platform = board.assemble()?;
    let mut tables = serde_json::Map::new();
    for (id, commands) in platform.describe_commands() {
        tables.insert(id.name().to_string(), serde_json::to_value(commands)?);
    }
    println!("{}", serde_json::to_string_pretty(&tables)?);
    board.power_down()?;
    Ok(())
}

fn cmd_run(sub: &ArgMatches, json: bool) -> CliResult {
    let config = match sub.value_of("config") {
        Some(path) => BoardConfig::from_file(path)?,
        None => BoardConfig::default(),
    };
    let seconds: u64 = sub.value_of("seconds").unwrap_or("10").parse()?;

    let board = Board::new(config)?;
    let platform = board.boot()?;
    println!("{} booted into {:?}", "🛰️".green(), platform.current_mode());

    let deadline = Instant::now() + Duration::from_secs(seconds);
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_secs(1));
        report(&platform, json)?;
    }

    platform.shutdown()?;
    board.power_down()?;
    println!("{} stopped", "🚀".green());
    Ok(())
}

fn report(platform: &Platform, json: bool) -> CliResult {
    let statuses = platform.statuses();
    if json {
        println!(
            "{}",
            serde_json::json!({
                "mode": platform.current_mode(),
                "subsystems": statuses,
                "faults": platform.faults(),
            })
        );
        return Ok(());
    }

    println!("{} {:?}", "Mode:".bold(), platform.current_mode());
    for SubsystemReport { name, state, .. } in &statuses {
        let status = match state.status {
            SubsystemStatus::Ready => "READY".green(),
            SubsystemStatus::ModeChangePending => "PENDING".yellow(),
            SubsystemStatus::Booting => "BOOTING".yellow(),
            SubsystemStatus::FatalError => "FATAL".red(),
        };
        println!("  {:<10} {:<8} {:?} arg={}", name, status, state.mode, state.argument);
    }
    let active = platform.faults().iter().filter(|f| !f.resolved).count();
    if active > 0 {
        println!("  {} {} active faults", "⚠️".yellow(), active);
    }
    Ok(())
}
