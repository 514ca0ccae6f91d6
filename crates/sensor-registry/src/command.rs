//! Remote command resolution.
//!
//! Free-text command arguments (address, sensor type, action) are resolved against the
//! registry into a borrowed [`Command`]. Resolution is all-or-nothing: any problem
//! yields a [`CommandDecodeError`] listing everything that was wrong and no command.

use crate::registry::{ActionOutcome, Device, Registry, Sensor};
use crate::{CommandAction, SensorKind};
use ble_transport::BleAddress;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Parse an address string. Hex when prefixed with `0x`/`x`, when it contains a hex
/// letter, or when it is colon separated; decimal otherwise. Unparsable input is 0.
pub fn decode_address(input: &str) -> u64 {
    let s = input.trim();
    let (digits, hex) = if let Some(rest) = strip_prefix_ci(s, "0x") {
        (rest.to_string(), true)
    } else if let Some(rest) = strip_prefix_ci(s, "x") {
        (rest.to_string(), true)
    } else if s.contains(':') {
        (s.replace(':', ""), true)
    } else {
        let hex = s.chars().any(|c| matches!(c, 'a'..='f' | 'A'..='F'));
        (s.to_string(), hex)
    };
    let radix = if hex { 16 } else { 10 };
    u64::from_str_radix(&digits, radix).unwrap_or(0)
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        s.get(prefix.len()..)
    } else {
        None
    }
}

/// One reason a command could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandProblem {
    #[error("Argument bluetooth address is empty")]
    EmptyAddress,
    #[error("Argument action is empty")]
    EmptyAction,
    #[error("Invalid Bluetooth address {0}")]
    InvalidAddress(String),
    #[error("Invalid action {0}")]
    InvalidAction(String),
    #[error("Argument sensor is empty")]
    EmptySensor,
    #[error("Invalid sensor {0}")]
    InvalidSensor(String),
    #[error("No device for bluetooth address {0}")]
    NoDevice(BleAddress),
    #[error("No sensor for bluetooth address {address} sensor type {}", .kind.name())]
    NoSensor {
        address: BleAddress,
        kind: SensorKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDecodeError {
    pub problems: Vec<CommandProblem>,
}

impl fmt::Display for CommandDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error decoding sensor changed command:")?;
        for p in &self.problems {
            writeln!(f, "{p}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandDecodeError {}

impl From<Vec<CommandProblem>> for CommandDecodeError {
    fn from(problems: Vec<CommandProblem>) -> Self {
        Self { problems }
    }
}

#[derive(Clone, Copy)]
pub enum CommandTarget<'a> {
    /// The whole device; the action cascades to every sensor.
    Device,
    Sensor(&'a Arc<Sensor>),
}

/// A resolved command borrowing into the registry. Lives for one dispatch.
#[derive(Clone, Copy)]
pub struct Command<'a> {
    pub device: &'a Arc<Device>,
    pub target: CommandTarget<'a>,
    pub action: CommandAction,
}

impl fmt::Debug for Command<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match self.target {
            CommandTarget::Device => "device".to_string(),
            CommandTarget::Sensor(s) => s.kind().name().to_string(),
        };
        f.debug_struct("Command")
            .field("device", &self.device.address())
            .field("target", &target)
            .field("action", &self.action)
            .finish()
    }
}

pub fn resolve_device_command<'a>(
    registry: &'a Registry,
    address: &str,
    action: &str,
) -> Result<Command<'a>, CommandDecodeError> {
    let mut problems = Vec::new();
    if address.trim().is_empty() {
        problems.push(CommandProblem::EmptyAddress);
    }
    if action.trim().is_empty() {
        problems.push(CommandProblem::EmptyAction);
    }
    if !problems.is_empty() {
        return Err(problems.into());
    }

    let resolved = BleAddress::new(decode_address(address));
    if resolved.is_none() {
        problems.push(CommandProblem::InvalidAddress(address.to_string()));
    }
    let action_kind = CommandAction::resolve(action.trim());
    if action_kind == CommandAction::None {
        problems.push(CommandProblem::InvalidAction(action.to_string()));
    }
    let Some(resolved) = resolved.filter(|_| problems.is_empty()) else {
        return Err(problems.into());
    };

    match registry.device(resolved) {
        Some(device) => Ok(Command {
            device,
            target: CommandTarget::Device,
            action: action_kind,
        }),
        None => Err(vec![CommandProblem::NoDevice(resolved)].into()),
    }
}

pub fn resolve_sensor_command<'a>(
    registry: &'a Registry,
    address: &str,
    sensor: &str,
    action: &str,
) -> Result<Command<'a>, CommandDecodeError> {
    let command = resolve_device_command(registry, address, action)?;

    if sensor.trim().is_empty() {
        return Err(vec![CommandProblem::EmptySensor].into());
    }
    let Some(kind) = SensorKind::resolve(sensor.trim()) else {
        return Err(vec![CommandProblem::InvalidSensor(sensor.to_string())].into());
    };
    match command.device.sensor(kind) {
        Some(s) => Ok(Command {
            target: CommandTarget::Sensor(s),
            ..command
        }),
        None => Err(vec![CommandProblem::NoSensor {
            address: command.device.address(),
            kind,
        }]
        .into()),
    }
}

/// Apply a resolved command to its explicit target.
pub fn dispatch(command: &Command<'_>) -> ActionOutcome {
    debug!(?command, "dispatching command");
    match command.target {
        CommandTarget::Device => command.device.perform_action(command.action),
        CommandTarget::Sensor(sensor) => sensor.perform_action(command.action),
    }
}
