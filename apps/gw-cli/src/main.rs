use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use ble_transport::{to_hex_string, AdvertisementFrame, BleAddress, DataSection, MockGattLink, Timestamp};
use gatt_poller::{spawn_poller, Acquisition, AcquisitionConfig};
use sensor_registry as reg;
use sensor_registry::{
    BroadcastIngest, ChangeEvent, CommandHandler, ConverterKind, DeviceKind, FrameOutcome,
    InlineDispatcher, JsonLinesUplink, MetricsHub, PolledChannel, Registry, TelemetryEmitter,
    TracingSink, UiDispatcher, UiQueue,
};

#[derive(Parser, Debug)]
#[command(
    name = "bgw",
    version,
    about = "BLE sensor gateway CLI",
    disable_help_subcommand = true
)]
struct Cli {
    /// Print registry change events as they happen
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    watch: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum FrameFamily {
    EddystoneTlm,
    VendorEnvironmental,
}

impl FrameFamily {
    fn device_kind(self) -> DeviceKind {
        match self {
            FrameFamily::EddystoneTlm => DeviceKind::EddystoneTlm,
            FrameFamily::VendorEnvironmental => DeviceKind::VendorEnvironmental,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a gateway config file
    DeviceValidate {
        #[arg(long, default_value = "configs/gateway.yaml")]
        file: String,
        /// Print the parsed config as JSON
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
    /// List configured devices and their sensors
    DeviceList {
        #[arg(long, default_value = "configs/gateway.yaml")]
        file: String,
    },
    /// Decode one advertisement data section
    FrameDecode {
        #[arg(long, value_enum)]
        family: FrameFamily,
        /// AD type tag (e.g. 0x16 or 0xFF)
        #[arg(long = "type", default_value = "0x16")]
        data_type: String,
        /// Payload bytes as hex (space separated)
        #[arg(long, value_delimiter = ' ', num_args = 1..)]
        data: Vec<String>,
    },
    /// Decode a textual Bluetooth address the way remote commands do
    AddressDecode { address: String },
    /// Run one remote method against a freshly loaded registry
    Command {
        #[arg(long, default_value = "configs/gateway.yaml")]
        file: String,
        /// config | sensor | deviceupdate
        #[arg(long)]
        method: String,
        /// JSON payload
        #[arg(long)]
        payload: String,
    },
    /// Replay a recorded frame log through the broadcast pipeline
    Replay {
        #[arg(long, default_value = "configs/gateway.yaml")]
        file: String,
        /// Frame log (bgwlog JSON lines)
        #[arg(long)]
        frames: String,
        /// Print prometheus metrics after the replay
        #[arg(long, action = ArgAction::SetTrue)]
        metrics: bool,
    },
    /// Poll every generic_polled device against a scripted mock link
    PollMock {
        #[arg(long, default_value = "configs/gateway.yaml")]
        file: String,
        /// Number of cycles per device
        #[arg(long, default_value_t = 2u32)]
        cycles: u32,
        /// Delay between manual triggers in milliseconds
        #[arg(long, default_value_t = 500u64)]
        gap_ms: u64,
    },
}

fn main() -> Result<()> {
    setup_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::DeviceValidate { file, json } => device_validate(&file, json),
        Commands::DeviceList { file } => device_list(&file),
        Commands::FrameDecode {
            family,
            data_type,
            data,
        } => frame_decode(family, &data_type, &data),
        Commands::AddressDecode { address } => address_decode(&address),
        Commands::Command {
            file,
            method,
            payload,
        } => remote_command(&file, &method, &payload, cli.watch),
        Commands::Replay {
            file,
            frames,
            metrics,
        } => replay(&file, &frames, metrics, cli.watch),
        Commands::PollMock {
            file,
            cycles,
            gap_ms,
        } => poll_mock(&file, cycles, Duration::from_millis(gap_ms), cli.watch),
    }
}

fn setup_tracing() {
    // Best-effort; avoid panics if already set
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}

fn parse_u8(s: &str) -> Result<u8> {
    let t = s.trim();
    let no_prefix = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);
    u8::from_str_radix(no_prefix, 16).map_err(|e| anyhow::anyhow!("invalid hex byte '{t}': {e}"))
}

fn parse_hex_bytes(items: &[String]) -> Result<Vec<u8>> {
    items
        .iter()
        .filter(|s| !s.trim().is_empty())
        .map(|s| parse_u8(s))
        .collect()
}

fn parse_hex_compact(s: &str) -> Result<Vec<u8>> {
    let t: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    if t.len() % 2 != 0 {
        return Err(anyhow::anyhow!("odd hex length"));
    }
    let mut out = Vec::with_capacity(t.len() / 2);
    for i in (0..t.len()).step_by(2) {
        let pair = t
            .get(i..i + 2)
            .ok_or_else(|| anyhow::anyhow!("invalid hex: non-ascii input"))?;
        let b = u8::from_str_radix(pair, 16).map_err(|e| anyhow::anyhow!("invalid hex: {e}"))?;
        out.push(b);
    }
    Ok(out)
}

fn fmt_value(v: Option<f64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

fn load_registry(file: &str, watch: bool) -> Result<(reg::GatewayConfig, Arc<Registry>)> {
    load_registry_with(file, watch, Arc::new(InlineDispatcher))
}

fn load_registry_with(
    file: &str,
    watch: bool,
    ui: Arc<dyn UiDispatcher>,
) -> Result<(reg::GatewayConfig, Arc<Registry>)> {
    let cfg = reg::load_gateway_file(file)?;
    let registry = Arc::new(reg::build_registry(&cfg, ui)?);
    if watch {
        registry.set_change_hook(Some(Arc::new(print_change)));
    }
    Ok((cfg, registry))
}

fn print_change(event: &ChangeEvent) {
    match event {
        ChangeEvent::SensorValue {
            address,
            kind,
            value,
        } => println!("change: {address} {} = {}", kind.name(), fmt_value(*value)),
        ChangeEvent::SensorEnabled {
            address,
            kind,
            enabled,
        } => println!("change: {address} {} enabled={enabled}", kind.name()),
        ChangeEvent::DeviceEnabled { address, enabled } => {
            println!("change: {address} enabled={enabled}")
        }
        other => println!("change: {other:?}"),
    }
}

/// Telemetry and cloud messages go to stdout as JSON lines; notices go to tracing.
fn stdout_emitter(cfg: &reg::GatewayConfig, hub: &MetricsHub) -> TelemetryEmitter {
    TelemetryEmitter::new(
        Arc::new(JsonLinesUplink::new(std::io::stdout())),
        Arc::new(TracingSink),
        cfg.device_id.clone(),
    )
    .with_key_prefix(cfg.key_prefix.clone())
    .with_metrics(hub.gw.clone())
}

fn metrics_hub() -> Result<MetricsHub> {
    MetricsHub::new().map_err(|e| anyhow::anyhow!(e))
}

fn device_validate(file: &str, json: bool) -> Result<()> {
    let cfg = reg::load_gateway_file(file)?;
    let polled: usize = cfg.devices.iter().map(|d| d.polled.len()).sum();
    println!(
        "ok: {} devices, {polled} polled channels (device_id={}, version={})",
        cfg.devices.len(),
        cfg.device_id,
        cfg.config_version
    );
    if json {
        println!("{}", serde_json::to_string_pretty(&cfg)?);
    }
    Ok(())
}

fn device_list(file: &str) -> Result<()> {
    let cfg = reg::load_gateway_file(file)?;
    for d in &cfg.devices {
        let address = reg::device_address(d)?;
        let sensors: Vec<&str> = d.sensors.iter().map(|s| s.kind.name()).collect();
        println!(
            "{}\t{}\tkind={:?}\tsensors={}\t{}",
            address.to_colon_string(),
            d.name,
            d.kind,
            sensors.join(","),
            d.description
        );
    }
    Ok(())
}

fn frame_decode(family: FrameFamily, data_type: &str, data_hex: &[String]) -> Result<()> {
    let tag = parse_u8(data_type)?;
    let bytes = parse_hex_bytes(data_hex)?;
    let section = DataSection::new(tag, &bytes);
    let readings = reg::decode_section(family.device_kind(), &section).ok_or_else(|| {
        anyhow::anyhow!(
            "section not recognized as {family:?}: type={tag:#04x} data={}",
            to_hex_string(&bytes)
        )
    })?;
    for r in readings {
        println!("{}\t{}", r.kind.name(), fmt_value(r.value));
    }
    Ok(())
}

fn address_decode(input: &str) -> Result<()> {
    let raw = reg::decode_address(input);
    match BleAddress::new(raw) {
        Some(a) => println!("{raw}\t{a}\t{}", a.to_colon_string()),
        None => println!("{raw}\tinvalid"),
    }
    Ok(())
}

fn print_registry(registry: &Registry) {
    for d in registry.devices() {
        println!(
            "{}\t{}\tenabled={}",
            d.address().to_colon_string(),
            d.name(),
            d.enabled()
        );
        for s in d.sensors() {
            println!(
                "  {}\tenabled={}\tvalue={}",
                s.kind().name(),
                s.enabled(),
                fmt_value(s.displayed())
            );
        }
    }
}

fn remote_command(file: &str, method: &str, payload: &str, watch: bool) -> Result<()> {
    let (cfg, registry) = load_registry(file, watch)?;
    let hub = metrics_hub()?;
    let handler = CommandHandler::new(
        Arc::clone(&registry),
        stdout_emitter(&cfg, &hub),
        cfg.config_version.clone(),
    )
    .with_metrics(hub.gw.clone());
    let response = handler.handle(method, payload);
    println!("status: {}", response.status);
    println!("version: {}", handler.version());
    print_registry(&registry);
    Ok(())
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameLogHeader {
    format: String,
    version: u32,
}

/// One recorded advertisement.
#[derive(Debug, Serialize, Deserialize)]
struct FrameLogRecord {
    #[serde(default)]
    ts: String,
    address: String,
    #[serde(default)]
    rssi: i16,
    sections: Vec<FrameLogSection>,
}

#[derive(Debug, Serialize, Deserialize)]
struct FrameLogSection {
    #[serde(rename = "type")]
    data_type: u8,
    data: String,
}

fn record_to_frame(rec: &FrameLogRecord) -> Result<AdvertisementFrame> {
    let address = BleAddress::new(reg::decode_address(&rec.address))
        .ok_or_else(|| anyhow::anyhow!("bad address: {}", rec.address))?;
    let mut sections = Vec::with_capacity(rec.sections.len());
    for s in &rec.sections {
        sections.push(DataSection::new(s.data_type, &parse_hex_compact(&s.data)?));
    }
    let mut frame = AdvertisementFrame::new(address, sections);
    frame.rssi = rec.rssi;
    if let Ok(ts) =
        time::OffsetDateTime::parse(&rec.ts, &time::format_description::well_known::Rfc3339)
    {
        frame.timestamp = Timestamp(ts);
    }
    Ok(frame)
}

fn replay(file: &str, frames: &str, show_metrics: bool, watch: bool) -> Result<()> {
    let (cfg, registry) = load_registry(file, watch)?;
    let hub = metrics_hub()?;
    hub.gw.devices_loaded.set(registry.devices().len() as i64);
    let ingest = BroadcastIngest::new(registry, stdout_emitter(&cfg, &hub))
        .with_metrics(hub.gw.clone());

    let f = File::open(frames).with_context(|| format!("opening frame log: {frames}"))?;
    let mut reader = BufReader::new(f);
    let mut first = String::new();
    let _ = reader.read_line(&mut first)?;
    let header: FrameLogHeader = match serde_json::from_str(&first) {
        Ok(h) => h,
        Err(e) => {
            error!("invalid bgwlog header: {e}");
            return Err(anyhow::anyhow!("invalid bgwlog header"));
        }
    };
    if header.format != "bgwlog" {
        return Err(anyhow::anyhow!("unexpected log format '{}'", header.format));
    }

    let (mut total, mut applied) = (0usize, 0usize);
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let rec: FrameLogRecord = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                error!("bad record: {e}");
                continue;
            }
        };
        let frame = match record_to_frame(&rec) {
            Ok(f) => f,
            Err(e) => {
                error!("bad frame: {e}");
                continue;
            }
        };
        total += 1;
        match ingest.on_frame(&frame) {
            FrameOutcome::Applied { readings } => applied += readings,
            other => info!(address = %frame.address, outcome = ?other, "frame skipped"),
        }
    }
    info!(frames = total, readings = applied, "replay done");
    if show_metrics {
        print!("{}", hub.encode_text());
    }
    Ok(())
}

/// Plausible payloads for each converter so a mock session produces values.
fn script_channel(link: &MockGattLink, channel: &PolledChannel, cycle: u32) {
    let step = u8::try_from(cycle % 16).unwrap_or_default();
    match channel.converter {
        ConverterKind::BatteryLevel => {
            link.set_value(channel.service, channel.data, &[90u8.saturating_sub(step)]);
        }
        ConverterKind::Temperature => {
            let raw = 0x0190i16 + i16::from(step);
            link.set_value(channel.service, channel.data, &raw.to_le_bytes());
        }
        ConverterKind::RangeScaled => {
            if let (Some(config), 0) = (channel.config, cycle) {
                let mut record = [0u8; 16];
                record[0] = 1;
                link.push_reads(channel.service, config, &[record.as_slice()]);
            }
            // two count bytes, range 64000, full 16-bit resolution
            link.set_value(channel.service, channel.data, &[0x0E, 0x00, 0x04 + step]);
        }
    }
}

/// Run UI jobs on the calling thread for `span`.
async fn pump_ui(queue: &UiQueue, span: Duration) {
    let deadline = tokio::time::Instant::now() + span;
    let mut tick = tokio::time::interval(Duration::from_millis(20));
    while tokio::time::Instant::now() < deadline {
        tick.tick().await;
        queue.run_pending();
    }
}

fn poll_mock(file: &str, cycles: u32, gap: Duration, watch: bool) -> Result<()> {
    // cycles run on blocking threads; display updates stay on this one
    let (dispatcher, queue) = reg::ui_queue();
    let (cfg, registry) = load_registry_with(file, watch, Arc::new(dispatcher))?;
    let hub = metrics_hub()?;
    let emitter = stdout_emitter(&cfg, &hub);
    let mut config = AcquisitionConfig::from(&cfg.polling);
    // the timer only fires at start; triggers drive the rest
    config.interval = Duration::from_secs(3600);

    let mut pending = Vec::new();
    for desc in cfg.devices.iter().filter(|d| d.kind == DeviceKind::GenericPolled) {
        let address = reg::device_address(desc)?;
        let Some(device) = registry.device(address) else {
            continue;
        };
        let channels = reg::polled_channels(desc)?;
        let services: Vec<_> = channels.iter().map(|c| c.service).collect();
        let link = MockGattLink::new(address).with_services(&services);
        for c in &channels {
            script_channel(&link, c, 0);
        }
        let acq = Acquisition::new(link.clone(), Arc::clone(device), &channels, config)
            .with_emitter(emitter.clone())
            .with_metrics(hub.gw.clone());
        pending.push((link, channels, acq));
    }
    if pending.is_empty() {
        warn!("no generic_polled devices in {file}");
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let sessions: Vec<_> = pending
            .into_iter()
            .map(|(link, channels, acq)| (link, channels, spawn_poller(acq)))
            .collect();
        for cycle in 1..cycles.max(1) {
            pump_ui(&queue, gap).await;
            for (link, channels, handle) in &sessions {
                for c in channels {
                    script_channel(link, c, cycle);
                }
                handle.trigger();
            }
        }
        pump_ui(&queue, gap).await;
        for (_, _, handle) in sessions {
            handle.shutdown().await;
        }
    });
    queue.run_pending();
    print_registry(&registry);
    info!(cycles = hub.gw.acquisition_cycles.get(), "mock polling done");
    Ok(())
}
