use clap::{App, Arg};
use satcore::sim::server::{self, PeripheralSpec};
use satcore::sim::{MODEL_EPS, MODEL_LOOPBACK, MODEL_THERMAL};
use tracing::info;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "9000";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let matches = App::new("satcore-sim")
        .version(env!("CARGO_PKG_VERSION"))
        .about("🛰️  Simulated peripherals served over the remote channel protocol")
        .arg(
            Arg::with_name("host")
                .long("host")
                .value_name("HOST")
                .help("Address to bind")
                .takes_value(true)
                .default_value(DEFAULT_HOST),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Portmapper port; peripherals bind the ports after it")
                .takes_value(true)
                .default_value(DEFAULT_PORT),
        )
        .arg(
            Arg::with_name("peripherals")
                .long("peripherals")
                .value_name("FILE")
                .help("JSON list of {name, model, config} to serve instead of the defaults")
                .takes_value(true),
        )
        .get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let specs: Vec<PeripheralSpec> = match matches.value_of("peripherals") {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => vec![
            PeripheralSpec::new("eps", MODEL_EPS),
            PeripheralSpec::new("thermal", MODEL_THERMAL),
            PeripheralSpec::new("loopback", MODEL_LOOPBACK),
        ],
    };

    println!("🛰️  satcore peripheral simulator");
    println!("================================");

    let handle = server::start(host, port, &specs).await?;
    println!("portmapper  {}", handle.portmapper);
    for (name, addr) in &handle.peripherals {
        println!("{:<11} {}", name, addr);
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    handle.shutdown();
    println!("🚀 simulator stopped");
    Ok(())
}
