use agribus::actuators::{FertilizationMode, IrrigationMode, Npk, Product};
use agribus::bus::SensorKind;
use agribus::protocol::{Command, CommandResponse, CommandType, ProtocolHandler, ResponseStatus};
use agribus::FieldSnapshot;
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use std::error::Error;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: &str = "8080";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

type CliResult<T = ()> = Result<T, Box<dyn Error>>;

#[tokio::main]
async fn main() -> CliResult {
    let matches = build_cli().get_matches();

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let port: u16 = matches.value_of("port").unwrap_or(DEFAULT_PORT).parse()?;
    let format = matches.value_of("format").unwrap_or("table");
    let verbose = matches.is_present("verbose");

    if verbose {
        println!("{}", "🌱 AgriBus - Field Node Client".bright_green().bold());
        println!("{} {}:{}", "Connecting to".dimmed(), host, port);
    }

    let client = Client { host, port, format };

    match matches.subcommand() {
        ("ping", _) => client.ping().await?,
        ("status", _) => client.status().await?,
        ("events", Some(sub)) => {
            let limit = sub.value_of("limit").unwrap_or("20").parse()?;
            client.run("events", CommandType::RecentEvents { limit }).await?;
        }
        ("bus", Some(sub)) => client.run_parsed(bus_command(sub)?).await?,
        ("irrigation", Some(sub)) => client.run_parsed(irrigation_command(sub)?).await?,
        ("fertilizer", Some(sub)) => client.run_parsed(fertilizer_command(sub)?).await?,
        ("monitor", _) => client.monitor().await?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Start the simulator", "agribus-simulator".bright_cyan());
            println!("  {} Test connection", "agribus ping".bright_cyan());
            println!("  {} Watch field snapshots", "agribus monitor".bright_cyan());
        }
    }

    Ok(())
}

fn build_cli() -> App<'static, 'static> {
    let required_arg = |name: &'static str, help: &'static str| Arg::with_name(name).help(help).required(true);

    App::new("agribus")
        .version("0.1.0")
        .about("🌱 AgriBus field node client")
        .arg(
            Arg::with_name("host")
                .short("H")
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
                .help("Simulator port")
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
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable verbose output")
                .global(true),
        )
        .subcommand(SubCommand::with_name("ping").about("🏓 Test connection to the field node"))
        .subcommand(SubCommand::with_name("status").about("📊 Bus, irrigation and fertilization status"))
        .subcommand(
            SubCommand::with_name("events")
                .about("📜 Recent field events")
                .arg(Arg::with_name("limit").long("limit").takes_value(true).default_value("20")),
        )
        .subcommand(
            SubCommand::with_name("bus")
                .about("🔌 Bus segment control")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(SubCommand::with_name("status").about("Bus status and counters"))
                .subcommand(SubCommand::with_name("activate").about("Bring the bus up"))
                .subcommand(SubCommand::with_name("deactivate").about("Take the bus down"))
                .subcommand(
                    SubCommand::with_name("filter")
                        .about("Accept an identifier at receive time")
                        .arg(required_arg("identifier", "Identifier, decimal or 0x-prefixed hex")),
                )
                .subcommand(SubCommand::with_name("clear-filters").about("Accept every identifier"))
                .subcommand(
                    SubCommand::with_name("publish")
                        .about("Publish a sensor reading")
                        .arg(
                            required_arg("sensor", "Sensor kind").possible_values(&[
                                "temperature",
                                "humidity",
                                "pressure",
                                "soil_moisture",
                                "npk",
                            ]),
                        )
                        .arg(required_arg("value", "Reading value")),
                ),
        )
        .subcommand(
            SubCommand::with_name("irrigation")
                .about("💧 Irrigation controller")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(SubCommand::with_name("status").about("Irrigation status"))
                .subcommand(
                    SubCommand::with_name("start")
                        .about("Activate in a mode")
                        .arg(required_arg("mode", "Operating mode").possible_values(&["manual", "automatic", "scheduled"])),
                )
                .subcommand(SubCommand::with_name("stop").about("Deactivate and close all zones"))
                .subcommand(SubCommand::with_name("open").about("Open a zone").arg(required_arg("zone", "Zone number")))
                .subcommand(SubCommand::with_name("close").about("Close a zone").arg(required_arg("zone", "Zone number")))
                .subcommand(SubCommand::with_name("flow").about("Override flow rate").arg(required_arg("rate", "L/min")))
                .subcommand(
                    SubCommand::with_name("run")
                        .about("Water one zone for a duration")
                        .arg(required_arg("zone", "Zone number"))
                        .arg(required_arg("minutes", "Duration in minutes")),
                )
                .subcommand(
                    SubCommand::with_name("target")
                        .about("Set target soil moisture")
                        .arg(required_arg("percent", "Target moisture %")),
                )
                .subcommand(
                    SubCommand::with_name("schedule")
                        .about("Replace daily triggers")
                        .arg(required_arg("times", "HH:MM times").multiple(true)),
                ),
        )
        .subcommand(
            SubCommand::with_name("fertilizer")
                .about("🌾 Fertilization controller")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(SubCommand::with_name("status").about("Fertilization status"))
                .subcommand(
                    SubCommand::with_name("start")
                        .about("Activate in a mode")
                        .arg(required_arg("mode", "Operating mode").possible_values(&["manual", "automatic", "variable_rate"])),
                )
                .subcommand(SubCommand::with_name("stop").about("Deactivate"))
                .subcommand(
                    SubCommand::with_name("load")
                        .about("Load the tank (system must be stopped)")
                        .arg(required_arg("product", "npk_20_10_10, npk_10_20_20, npk_15_15_15, npk_04_14_08 or urea"))
                        .arg(required_arg("kg", "Amount in kg")),
                )
                .subcommand(SubCommand::with_name("rate").about("Set application rate").arg(required_arg("rate", "kg/ha")))
                .subcommand(SubCommand::with_name("apply").about("Apply over an area").arg(required_arg("area", "Hectares")))
                .subcommand(
                    SubCommand::with_name("target")
                        .about("Set target soil nutrient levels")
                        .arg(required_arg("n", "N mg/kg"))
                        .arg(required_arg("p", "P mg/kg"))
                        .arg(required_arg("k", "K mg/kg")),
                )
                .subcommand(
                    SubCommand::with_name("recommend")
                        .about("Recommend a product for measured soil levels")
                        .arg(required_arg("n", "N mg/kg"))
                        .arg(required_arg("p", "P mg/kg"))
                        .arg(required_arg("k", "K mg/kg")),
                ),
        )
        .subcommand(SubCommand::with_name("monitor").about("📡 Stream field snapshots (Ctrl+C to stop)"))
}

/// `Status` renders the whole field snapshot instead of a command result.
enum Parsed {
    Status,
    Command(&'static str, CommandType),
}

fn bus_command(matches: &ArgMatches<'_>) -> CliResult<Parsed> {
    let command = match matches.subcommand() {
        ("activate", _) => CommandType::BusActivate,
        ("deactivate", _) => CommandType::BusDeactivate,
        ("filter", Some(sub)) => CommandType::AddFilter {
            identifier: parse_identifier(required(sub, "identifier")?)?,
        },
        ("clear-filters", _) => CommandType::ClearFilters,
        ("publish", Some(sub)) => CommandType::PublishSensor {
            sensor: parse_sensor(required(sub, "sensor")?)?,
            value: required(sub, "value")?.parse()?,
        },
        _ => CommandType::BusStatus,
    };
    Ok(Parsed::Command("bus", command))
}

fn irrigation_command(matches: &ArgMatches<'_>) -> CliResult<Parsed> {
    let command = match matches.subcommand() {
        ("start", Some(sub)) => CommandType::StartIrrigation {
            mode: match required(sub, "mode")? {
                "automatic" => IrrigationMode::Automatic,
                "scheduled" => IrrigationMode::Scheduled,
                _ => IrrigationMode::Manual,
            },
        },
        ("stop", _) => CommandType::StopIrrigation,
        ("open", Some(sub)) => CommandType::OpenZone {
            zone: required(sub, "zone")?.parse()?,
        },
        ("close", Some(sub)) => CommandType::CloseZone {
            zone: required(sub, "zone")?.parse()?,
        },
        ("flow", Some(sub)) => CommandType::SetFlowRate {
            flow_rate: required(sub, "rate")?.parse()?,
        },
        ("run", Some(sub)) => CommandType::IrrigateZone {
            zone: required(sub, "zone")?.parse()?,
            duration_minutes: required(sub, "minutes")?.parse()?,
        },
        ("target", Some(sub)) => CommandType::SetTargetMoisture {
            percent: required(sub, "percent")?.parse()?,
        },
        ("schedule", Some(sub)) => CommandType::SetSchedule {
            times: sub.values_of("times").into_iter().flatten().map(str::to_string).collect(),
        },
        _ => return Ok(Parsed::Status),
    };
    Ok(Parsed::Command("irrigation", command))
}

fn fertilizer_command(matches: &ArgMatches<'_>) -> CliResult<Parsed> {
    let command = match matches.subcommand() {
        ("start", Some(sub)) => CommandType::StartFertilization {
            mode: match required(sub, "mode")? {
                "automatic" => FertilizationMode::Automatic,
                "variable_rate" => FertilizationMode::VariableRate,
                _ => FertilizationMode::Manual,
            },
        },
        ("stop", _) => CommandType::StopFertilization,
        ("load", Some(sub)) => CommandType::LoadProduct {
            product: required(sub, "product")?.parse::<Product>()?,
            amount_kg: required(sub, "kg")?.parse()?,
        },
        ("rate", Some(sub)) => CommandType::SetApplicationRate {
            rate_kg_ha: required(sub, "rate")?.parse()?,
        },
        ("apply", Some(sub)) => CommandType::Apply {
            area_ha: required(sub, "area")?.parse()?,
        },
        ("target", Some(sub)) => CommandType::SetTargetNpk { npk: parse_npk(sub)? },
        ("recommend", Some(sub)) => CommandType::Recommend { npk: parse_npk(sub)? },
        _ => return Ok(Parsed::Status),
    };
    Ok(Parsed::Command("fertilizer", command))
}

fn required<'a>(matches: &'a ArgMatches<'_>, name: &str) -> CliResult<&'a str> {
    matches
        .value_of(name)
        .ok_or_else(|| format!("missing argument <{}>", name).into())
}

fn parse_npk(matches: &ArgMatches<'_>) -> CliResult<Npk> {
    Ok(Npk::new(
        required(matches, "n")?.parse()?,
        required(matches, "p")?.parse()?,
        required(matches, "k")?.parse()?,
    ))
}

fn parse_identifier(value: &str) -> CliResult<u32> {
    let identifier = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16)?,
        None => value.parse()?,
    };
    Ok(identifier)
}

fn parse_sensor(value: &str) -> CliResult<SensorKind> {
    Ok(serde_json::from_value(serde_json::Value::String(value.to_string()))?)
}

struct Client<'a> {
    host: &'a str,
    port: u16,
    format: &'a str,
}

impl Client<'_> {
    async fn ping(&self) -> CliResult {
        let (raw, response) = self.send(CommandType::Ping).await?;
        match self.format {
            "json" => println!("{}", raw),
            "compact" => println!("{}", "PONG".bright_green()),
            _ if response.status == ResponseStatus::Success => {
                println!("{} {}", "✅".green(), "Field node is responsive".bright_green());
            }
            _ => println!("{} {}", "❌".red(), "Ping failed".bright_red()),
        }
        Ok(())
    }

    async fn status(&self) -> CliResult {
        let (raw, response) = self.send(CommandType::SystemStatus).await?;
        if self.format == "json" {
            println!("{}", raw);
            return Ok(());
        }

        let snapshot: FieldSnapshot = match response.data {
            Some(data) => serde_json::from_value(data)?,
            None => return Err("status response carried no snapshot".into()),
        };
        if self.format == "compact" {
            println!("{}", compact_line(&snapshot));
        } else {
            print_snapshot(&snapshot);
        }
        Ok(())
    }

    async fn run_parsed(&self, parsed: Parsed) -> CliResult {
        match parsed {
            Parsed::Status => self.status().await,
            Parsed::Command(area, command) => self.run(area, command).await,
        }
    }

    async fn run(&self, area: &str, command: CommandType) -> CliResult {
        let (raw, response) = self.send(command).await?;
        match self.format {
            "json" => println!("{}", raw),
            "compact" => println!("{:?}", response.status),
            _ => print_response(area, &response),
        }
        Ok(())
    }

    /// Send one command and wait for its response, skipping snapshot lines
    /// the server streams on the same connection.
    async fn send(&self, command_type: CommandType) -> CliResult<(String, CommandResponse)> {
        let addr = format!("{}:{}", self.host, self.port);
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("{} Failed to connect to field node at {}", "❌".red(), addr.bright_white());
                if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    eprintln!("{} Simulator is not running. Start it with:", "💡".yellow());
                    eprintln!("   {}", "agribus-simulator".bright_cyan());
                }
                return Err(e.into());
            }
        };

        // One command per connection, so ids only need to be unique per handler.
        let mut protocol = ProtocolHandler::new();
        let command = Command {
            id: protocol.next_command_id(),
            command_type,
        };
        let request = protocol.serialize_command(&command)?.to_string();

        let exchange = async {
            let (reader, mut writer) = stream.into_split();
            writer.write_all(request.as_bytes()).await?;
            writer.write_all(b"\n").await?;

            let mut lines = BufReader::new(reader).lines();
            while let Some(line) = lines.next_line().await? {
                if let Ok(response) = serde_json::from_str::<CommandResponse>(&line) {
                    if response.id == command.id || response.id == 0 {
                        return Ok((line, response));
                    }
                }
            }
            Err::<_, Box<dyn Error>>("server closed connection".into())
        };

        match tokio::time::timeout(COMMAND_TIMEOUT, exchange).await {
            Ok(result) => result,
            Err(_) => {
                eprintln!("{} Command timed out after {:?}", "⏰".yellow(), COMMAND_TIMEOUT);
                Err("command timeout".into())
            }
        }
    }

    async fn monitor(&self) -> CliResult {
        println!("{}", "📡 Monitoring field node (Press Ctrl+C to stop)...".bright_blue().bold());
        let stream = TcpStream::connect((self.host, self.port)).await?;
        let mut lines = BufReader::new(stream).lines();

        if self.format == "table" {
            println!(
                "{}",
                "│ Seq    │ Bus    │ Util % │ Irrigation │ Flow L/min │ Fertilizer │ Tank % │".bright_white()
            );
        }

        while let Some(line) = lines.next_line().await? {
            let snapshot: FieldSnapshot = match serde_json::from_str(&line) {
                Ok(snapshot) => snapshot,
                Err(_) => continue,
            };

            match self.format {
                "json" => println!("{}", line),
                "compact" => println!("{}", compact_line(&snapshot)),
                _ => {
                    let bus = if snapshot.bus.active { "    UP".bright_green() } else { "  DOWN".bright_red() };
                    let tank = snapshot.fertilization.tank_level_percent;
                    let tank_str = if tank < 10.0 {
                        format!("{:>6.1}", tank).red()
                    } else {
                        format!("{:>6.1}", tank).green()
                    };
                    println!(
                        "│ {:>6} │ {} │ {:>6.2} │ {:>10} │ {:>10.1} │ {:>10} │ {} │",
                        snapshot.sequence,
                        bus,
                        snapshot.bus.utilization_percent,
                        snapshot.irrigation.mode.to_string(),
                        snapshot.irrigation.flow_rate,
                        snapshot.fertilization.mode.to_string(),
                        tank_str
                    );
                }
            }
        }
        Ok(())
    }
}

fn print_response(area: &str, response: &CommandResponse) {
    let message = response.message.as_deref().unwrap_or("");
    match response.status {
        ResponseStatus::Success => println!("{} {} {}", "✅".green(), area.bright_white(), message.bright_green()),
        ResponseStatus::Error => println!("{} {} {}", "❌".red(), area.bright_white(), message.bright_red()),
        ResponseStatus::InvalidCommand => println!("{} {} {}", "⚠️".yellow(), area.bright_white(), message.yellow()),
    }
    if let Some(data) = &response.data {
        if let Ok(pretty) = serde_json::to_string_pretty(data) {
            println!("{}", pretty.dimmed());
        }
    }
}

fn compact_line(snapshot: &FieldSnapshot) -> String {
    format!(
        "bus={} util={:.2}% irrigation={} flow={:.1} fertilizer={} tank={:.1}%",
        if snapshot.bus.active { "up" } else { "down" },
        snapshot.bus.utilization_percent,
        snapshot.irrigation.mode,
        snapshot.irrigation.flow_rate,
        snapshot.fertilization.mode,
        snapshot.fertilization.tank_level_percent
    )
}

fn print_snapshot(snapshot: &FieldSnapshot) {
    let bus = &snapshot.bus;
    println!("{} {}", "🔌".bright_blue(), "Bus".bright_blue().bold());
    println!(
        "   {} {}  {} {} bit/s  {} {:.2}%",
        "id:".bright_white(),
        bus.bus_id,
        "baud:".bright_white(),
        bus.baud_rate,
        "utilization:".bright_white(),
        bus.utilization_percent
    );
    println!(
        "   sent {}  received {}  errors {}  queued tx {} rx {}",
        bus.sent_count, bus.received_count, bus.error_count, bus.transmit_queue_len, bus.receive_queue_len
    );

    let irrigation = &snapshot.irrigation;
    println!("{} {}", "💧".bright_blue(), "Irrigation".bright_blue().bold());
    println!(
        "   {} ({})  flow {:.1}/{:.1} L/min  pressure {:.2} bar  zones open {:?}",
        irrigation.system_id,
        irrigation.mode,
        irrigation.flow_rate,
        irrigation.max_flow_rate,
        irrigation.pressure,
        irrigation.active_zones
    );
    println!(
        "   total {:.1} L over {:.1} min  target moisture {:.0}%",
        irrigation.total_volume_liters, irrigation.total_operating_minutes, irrigation.target_moisture_percent
    );
    if let Some(next) = irrigation.next_scheduled_run {
        println!("   next scheduled run {}", next);
    }

    let fertilization = &snapshot.fertilization;
    println!("{} {}", "🌾".bright_blue(), "Fertilization".bright_blue().bold());
    println!(
        "   {} ({})  product {}  tank {:.1}/{:.1} kg ({:.1}%)",
        fertilization.system_id,
        fertilization.mode,
        fertilization.product.map_or_else(|| "none".to_string(), |p| p.to_string()),
        fertilization.tank_level_kg,
        fertilization.tank_capacity_kg,
        fertilization.tank_level_percent
    );
    println!(
        "   applied {:.1} kg over {:.2} ha in {} applications",
        fertilization.total_applied_kg, fertilization.area_covered_ha, fertilization.application_count
    );
}
