pub mod config;
pub mod output;

use anyhow::{anyhow, Context, Result};
use clap::{builder::BoolishValueParser, Arg, ArgMatches, Command};

use config::{BridgeConfig, BusConfig, DiscoveryConfig, LogLevel, MqttConfig, TransportFailurePolicy};

/// Command definition, separate from parsing so it can be inspected in tests.
pub fn command() -> Command {
    Command::new("seplos_mqtt")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Poll Seplos BMS packs over RS-485 and publish their state to MQTT")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("JSON configuration file; replaces the bus, broker and discovery options")
                .value_name("FILE"),
        )
        .arg(
            Arg::new("serial-interface")
                .long("serial-interface")
                .env("SERIAL_INTERFACE")
                .help("Serial device path or tcp://host:port")
                .value_name("PORT")
                .default_value("/tmp/vcom0"),
        )
        .arg(
            Arg::new("baud-rate")
                .long("baud-rate")
                .help("Serial baud rate (default: 9600 with several packs, 19200 with one)")
                .value_name("BAUD")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("first-address")
                .long("first-address")
                .help("Address of the first pack")
                .value_name("ADDR")
                .default_value("0")
                .value_parser(clap::value_parser!(u8)),
        )
        .arg(
            Arg::new("number-of-packs")
                .long("number-of-packs")
                .env("NUMBER_OF_PACKS")
                .help("Packs chained on the bus")
                .value_name("COUNT")
                .default_value("1")
                .value_parser(clap::value_parser!(u8)),
        )
        .arg(
            Arg::new("min-cell-voltage")
                .long("min-cell-voltage")
                .env("MIN_CELL_VOLTAGE")
                .help("Reported minimum cell voltage in volts")
                .value_name("VOLTS")
                .default_value("2.5")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("max-cell-voltage")
                .long("max-cell-voltage")
                .env("MAX_CELL_VOLTAGE")
                .help("Reported maximum cell voltage in volts")
                .value_name("VOLTS")
                .default_value("3.65")
                .value_parser(clap::value_parser!(f64)),
        )
        .arg(
            Arg::new("mqtt-host")
                .long("mqtt-host")
                .env("MQTT_HOST")
                .help("Broker host; required unless --output is given")
                .value_name("HOST"),
        )
        .arg(
            Arg::new("mqtt-port")
                .long("mqtt-port")
                .env("MQTT_PORT")
                .value_name("PORT")
                .default_value("1883")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("mqtt-username")
                .long("mqtt-username")
                .env("MQTT_USERNAME")
                .value_name("USER"),
        )
        .arg(
            Arg::new("mqtt-password")
                .long("mqtt-password")
                .env("MQTT_PASSWORD")
                .hide_env_values(true)
                .value_name("PASSWORD"),
        )
        .arg(
            Arg::new("mqtt-topic")
                .long("mqtt-topic")
                .env("MQTT_TOPIC")
                .help("Root topic for state and availability")
                .value_name("TOPIC")
                .default_value("seplos"),
        )
        .arg(
            Arg::new("update-interval")
                .long("update-interval")
                .env("MQTT_UPDATE_INTERVAL")
                .help("Seconds to wait between polling cycles")
                .value_name("SECS")
                .default_value("0")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("ha-discovery")
                .long("ha-discovery")
                .env("ENABLE_HA_DISCOVERY_CONFIG")
                .help("Publish Home Assistant discovery configs")
                .value_name("BOOL")
                .default_value("true")
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new("ha-discovery-prefix")
                .long("ha-discovery-prefix")
                .env("HA_DISCOVERY_PREFIX")
                .value_name("PREFIX")
                .default_value("homeassistant"),
        )
        .arg(
            Arg::new("invert-charge")
                .long("invert-charge")
                .env("INVERT_HA_DIS_CHARGE_MEASUREMENTS")
                .help("Show charging current and power as negative values")
                .value_name("BOOL")
                .default_value("true")
                .value_parser(BoolishValueParser::new()),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .env("LOGGING_LEVEL")
                .help("debug, info, warn or error")
                .value_name("LEVEL")
                .default_value("info"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .help("Publish locally instead of MQTT: log, stdout or file:<path> (JSON lines)")
                .value_name("OUTPUT"),
        )
        .arg(
            Arg::new("cycles")
                .long("cycles")
                .help("Stop after this many polling cycles")
                .value_name("N")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("transport-failure")
                .long("transport-failure")
                .help("On a failed bus: exit or stop_bus")
                .value_name("POLICY")
                .default_value("exit"),
        )
        .arg(
            Arg::new("response-timeout-ms")
                .long("response-timeout-ms")
                .value_name("MS")
                .default_value("500")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("max-attempts")
                .long("max-attempts")
                .help("Attempts per request before a pack is skipped this cycle")
                .value_name("N")
                .default_value("5")
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("settle-delay-ms")
                .long("settle-delay-ms")
                .help("Quiet time on the bus before each request")
                .value_name("MS")
                .default_value("1000")
                .value_parser(clap::value_parser!(u64)),
        )
}

/// Parse command line arguments and return ArgMatches.
pub fn parse_args() -> ArgMatches {
    command().get_matches()
}

fn required<T: Clone + Send + Sync + 'static>(matches: &ArgMatches, id: &str) -> Result<T> {
    matches
        .get_one::<T>(id)
        .cloned()
        .ok_or_else(|| anyhow!("missing value for --{id}"))
}

/// Build the runtime configuration. A `--config` file wins over the
/// individual options except `--output` and `--cycles`, which always apply.
pub fn config_from_matches(matches: &ArgMatches) -> Result<BridgeConfig> {
    let mut config = match matches.get_one::<String>("config") {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {path}"))?,
        None => config_from_options(matches)?,
    };

    if let Some(output) = matches.get_one::<String>("output") {
        config.output = Some(output.clone());
    }
    if let Some(cycles) = matches.get_one::<u64>("cycles") {
        config.max_cycles = Some(*cycles);
    }
    Ok(config)
}

fn config_from_options(matches: &ArgMatches) -> Result<BridgeConfig> {
    let bus = BusConfig {
        transport: required(matches, "serial-interface")?,
        baud_rate: matches.get_one::<u32>("baud-rate").copied(),
        first_address: required(matches, "first-address")?,
        pack_count: required(matches, "number-of-packs")?,
    };

    let mqtt = match matches.get_one::<String>("mqtt-host") {
        Some(host) => Some(MqttConfig {
            host: host.clone(),
            port: required(matches, "mqtt-port")?,
            username: matches
                .get_one::<String>("mqtt-username")
                .filter(|user| !user.is_empty())
                .cloned(),
            password: matches.get_one::<String>("mqtt-password").cloned(),
            topic: required(matches, "mqtt-topic")?,
            keep_alive_secs: 60,
        }),
        None => None,
    };

    let log_level: String = required(matches, "log-level")?;
    let transport_failure: String = required(matches, "transport-failure")?;

    Ok(BridgeConfig {
        buses: vec![bus],
        min_cell_voltage: required(matches, "min-cell-voltage")?,
        max_cell_voltage: required(matches, "max-cell-voltage")?,
        update_interval_secs: required(matches, "update-interval")?,
        response_timeout_ms: required(matches, "response-timeout-ms")?,
        max_attempts: required(matches, "max-attempts")?,
        settle_delay_ms: required(matches, "settle-delay-ms")?,
        publish_queue_capacity: 64,
        transport_failure: transport_failure
            .parse::<TransportFailurePolicy>()
            .map_err(|_| anyhow!("Invalid transport failure policy: {transport_failure}"))?,
        log_level: log_level
            .parse::<LogLevel>()
            .map_err(|_| anyhow!("Invalid log level: {log_level}"))?,
        max_cycles: None,
        mqtt,
        discovery: DiscoveryConfig {
            enabled: required(matches, "ha-discovery")?,
            prefix: required(matches, "ha-discovery-prefix")?,
            invert_charge_measurements: required(matches, "invert-charge")?,
        },
        output: None,
    })
}
