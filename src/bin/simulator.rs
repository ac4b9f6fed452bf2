use agribus::actuators::Npk;
use agribus::bus::vocabulary::encode_sensor_payload;
use agribus::bus::{AddressingMode, SensorKind};
use agribus::{FieldAgent, FieldConfig, SensorFeed};
use clap::{App, Arg};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const SNAPSHOT_BROADCAST_BUFFER_SIZE: usize = 64;
/// Moisture lost per tick to evaporation, in percentage points.
const EVAPORATION_PER_TICK: f64 = 0.4;
/// Moisture gained per litre applied across the field.
const MOISTURE_PER_LITRE: f64 = 0.002;

/// Synthetic field conditions fed to the agent each tick.
#[derive(Debug)]
struct FieldModel {
    soil_moisture: f64,
    npk: Npk,
    last_volume: f64,
    ticks: u64,
}

impl FieldModel {
    fn new() -> Self {
        Self {
            soil_moisture: 55.0,
            npk: Npk::new(18.0, 9.0, 30.0),
            last_volume: 0.0,
            ticks: 0,
        }
    }

    /// Advance one tick given the irrigation total so far.
    fn step(&mut self, total_volume_liters: f64) -> SensorFeed {
        self.ticks += 1;
        let applied = (total_volume_liters - self.last_volume).max(0.0);
        self.last_volume = total_volume_liters;

        self.soil_moisture = (self.soil_moisture - EVAPORATION_PER_TICK + applied * MOISTURE_PER_LITRE).clamp(0.0, 100.0);

        SensorFeed {
            soil_moisture_percent: Some(self.soil_moisture),
            npk: Some(self.npk),
        }
    }

    fn temperature(&self) -> f64 {
        22.0 + 6.0 * (self.ticks as f64 / 60.0).sin()
    }

    fn humidity(&self) -> f64 {
        60.0 - 10.0 * (self.ticks as f64 / 90.0).sin()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("agribus-simulator")
        .version("0.1.0")
        .about("Field node simulator serving the AgriBus JSON protocol")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON node configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .value_name("PORT")
                .help("Overrides simulator.port from the configuration")
                .takes_value(true),
        )
        .get_matches();

    let mut config = match matches.value_of("config") {
        Some(path) => FieldConfig::load(path)?,
        None => FieldConfig::default(),
    };
    if let Some(port) = matches.value_of("port") {
        config.simulator.port = port.parse()?;
    }

    println!("🌱 AgriBus Field Node Simulator");
    println!("===============================");

    let mut agent = FieldAgent::from_config(&config)?;
    agent.start();
    let agent = Arc::new(Mutex::new(agent));

    let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_BROADCAST_BUFFER_SIZE);

    let tcp_agent = Arc::clone(&agent);
    let tcp_snapshot_tx = snapshot_tx.clone();
    let port = config.simulator.port;
    let tcp_server = tokio::spawn(async move {
        if let Err(e) = start_tcp_server(port, tcp_agent, tcp_snapshot_tx).await {
            error!("TCP server error: {}", e);
        }
    });

    let mut model = FieldModel::new();
    let mut interval = time::interval(Duration::from_millis(config.simulator.tick_ms));

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }

        let snapshot = {
            let mut agent = agent.lock().await;
            let feed = model.step(agent.irrigation().total_volume_liters());

            for (kind, value) in [
                (SensorKind::Temperature, model.temperature()),
                (SensorKind::Humidity, model.humidity()),
            ] {
                let payload = encode_sensor_payload(value);
                if let Err(e) = agent
                    .bus()
                    .with(|bus| bus.inject_raw(kind.identifier(), AddressingMode::Standard, &payload))
                {
                    debug!("sensor frame not injected: {}", e);
                }
            }

            let report = agent.tick(feed);
            if report.auto_irrigation.triggered() || report.scheduled_run.is_some() {
                info!(tick = report.tick, "irrigation ran: {:?}", report.auto_irrigation);
            }
            agent.snapshot_json()
        };

        match snapshot {
            Ok(json) => {
                // No subscribers is not an error.
                let _ = snapshot_tx.send(json);
            }
            Err(e) => warn!("snapshot not broadcast: {}", e),
        }
    }

    agent.lock().await.shutdown();
    tcp_server.abort();
    println!("🌾 Field node simulator stopped");

    Ok(())
}

async fn start_tcp_server(
    port: u16,
    agent: Arc<Mutex<FieldAgent>>,
    snapshot_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    info!("TCP server listening on port {}", port);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("client connected: {}", addr);
                let client_agent = Arc::clone(&agent);
                let client_snapshot_rx = snapshot_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, client_agent, client_snapshot_rx).await {
                        warn!("client {} error: {}", addr, e);
                    }
                    info!("client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    agent: Arc<Mutex<FieldAgent>>,
    mut snapshot_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let snapshot_writer = Arc::clone(&writer);
    let snapshot_task = tokio::spawn(async move {
        loop {
            let snapshot = match snapshot_rx.recv().await {
                Ok(snapshot) => snapshot,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "slow client skipped snapshots");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let mut writer = snapshot_writer.lock().await;
            if let Err(e) = write_line(&mut *writer, &snapshot).await {
                warn!("failed to send snapshot: {}", e);
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }

                let response_json = agent.lock().await.respond_json(trimmed)?;
                {
                    let mut writer = writer.lock().await;
                    write_line(&mut *writer, &response_json).await?;
                }
                debug!("sent response: {}", response_json);
            }
            Err(e) => {
                error!("error reading from client: {}", e);
                break;
            }
        }
    }

    snapshot_task.abort();
    Ok(())
}

async fn write_line<W: AsyncWriteExt + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}
