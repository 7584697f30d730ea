use anyhow::{anyhow, bail, Context, Result};
use clap::Subcommand;
use indi_protocol::protocol::parse_number;
use indi_protocol::{
    Blob, BlobMode, Device, ElementValue, Event, IndiClient, PropertyVector, SwitchState,
    Transport, VectorKind,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How long a single read may block while the CLI waits for traffic
const READ_SLICE: Duration = Duration::from_millis(200);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Discover devices and print their properties
    List {
        /// Only ask for this device
        #[arg(long)]
        device: Option<String>,

        /// Print the property tree as JSON
        #[arg(long)]
        json: bool,

        /// Seconds to collect definitions before printing
        #[arg(long, default_value_t = 2.0)]
        settle: f64,
    },

    /// Print one vector, or one element of it
    Get {
        device: String,
        vector: String,
        element: Option<String>,
    },

    /// Send new values to a vector, e.g. `set CCD CCD_EXPOSURE CCD_EXPOSURE_VALUE=2.5`
    Set {
        device: String,
        vector: String,

        /// NAME=VALUE pairs, typed from the vector kind
        #[arg(required = true)]
        values: Vec<String>,

        /// Wait up to this many seconds for the server to finish the command
        #[arg(long)]
        wait: Option<f64>,
    },

    /// Print events as they arrive
    Watch {
        /// Stop after this many seconds (default: run until interrupted)
        #[arg(long)]
        seconds: Option<f64>,
    },

    /// Save the raw bytes of the next frame a BLOB vector delivers
    Blob {
        device: String,
        vector: String,

        #[arg(long, short)]
        output: PathBuf,

        /// Seconds to wait for the frame
        #[arg(long, default_value_t = 60.0)]
        timeout: f64,
    },
}

pub fn run<T: Transport>(client: &mut IndiClient<T>, command: Command) -> Result<()> {
    match command {
        Command::List {
            device,
            json,
            settle,
        } => {
            client.get_properties(device.as_deref())?;
            collect_for(client, seconds(settle)?)?;

            let devices: Vec<&Device> = client
                .devices()
                .filter(|d| device.as_deref().map_or(true, |name| d.name == name))
                .collect();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&devices).context("Failed to serialize devices")?
                );
            } else if devices.is_empty() {
                println!("No devices found");
            } else {
                for device in devices {
                    print_device(device);
                }
            }
            Ok(())
        }
        Command::Get {
            device,
            vector,
            element,
        } => {
            let vector = discover_vector(client, &device, &vector)?;
            match element {
                Some(name) => {
                    let element = vector.element(&name).ok_or_else(|| {
                        anyhow!("{}.{} has no element '{}'", device, vector.name, name)
                    })?;
                    println!("{}", element.display_value());
                }
                None => print_vector(vector),
            }
            Ok(())
        }
        Command::Set {
            device,
            vector,
            values,
            wait,
        } => {
            let kind = discover_vector(client, &device, &vector)?.kind();
            let values = values
                .iter()
                .map(|raw| -> Result<(String, ElementValue)> {
                    let (name, value) = parse_assignment(raw)?;
                    Ok((name.to_string(), typed_value(kind, value)?))
                })
                .collect::<Result<Vec<_>>>()?;

            client
                .new_vector(&device, &vector, values)
                .with_context(|| format!("Failed to set {}.{}", device, vector))?;
            log::info!("📤 Sent new values for {}.{}", device, vector);

            if let Some(wait) = wait {
                let state = client
                    .wait_for_completion(&device, &vector, seconds(wait)?)
                    .with_context(|| format!("{}.{} did not complete", device, vector))?;
                println!("{}.{} -> {}", device, vector, state);
            }
            Ok(())
        }
        Command::Watch { seconds: limit } => {
            let limit = limit.map(seconds).transpose()?;
            client.get_properties(None)?;

            let started = Instant::now();
            while limit.map_or(true, |limit| started.elapsed() < limit) {
                client.process_events(READ_SLICE)?;
                for event in client.drain_events() {
                    println!("{}", serde_json::to_string(&event)?);
                }
            }
            Ok(())
        }
        Command::Blob {
            device,
            vector,
            output,
            timeout,
        } => {
            let found = discover_vector(client, &device, &vector)?;
            if found.kind() != VectorKind::Blob {
                bail!("{}.{} is a {} vector, not BLOB", device, vector, found.kind());
            }
            client.enable_blob(&device, Some(vector.as_str()), BlobMode::Also)?;
            client.drain_events();

            let deadline = deadline_after(seconds(timeout)?);
            let element = loop {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    bail!("No frame from {}.{} within {}s", device, vector, timeout);
                }
                client.process_events(READ_SLICE)?;
                let received = client.drain_events().into_iter().find_map(|e| match e {
                    Event::BlobReceived {
                        device: d,
                        vector: v,
                        element,
                        ..
                    } if d == device && v == vector => Some(element),
                    _ => None,
                });
                if let Some(element) = received {
                    break element;
                }
            };

            let blob = client
                .get_blob(&device, &vector, &element)
                .ok_or_else(|| anyhow!("Frame for {}.{} vanished", vector, element))?;
            write_blob(&output, blob)?;
            println!(
                "Saved {} bytes ({}) to {}",
                blob.data.len(),
                blob.format,
                output.display()
            );
            Ok(())
        }
    }
}

/// Process server traffic for `duration`
fn collect_for<T: Transport>(client: &mut IndiClient<T>, duration: Duration) -> Result<()> {
    let deadline = deadline_after(duration);
    loop {
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(());
                }
                (deadline - now).min(READ_SLICE)
            }
            None => READ_SLICE,
        };
        client.process_events(slice)?;
    }
}

/// `None` when `duration` reaches past what the clock can represent
fn deadline_after(duration: Duration) -> Option<Instant> {
    Instant::now().checked_add(duration)
}

/// Ask for one device and wait until the named vector is defined
fn discover_vector<'a, T: Transport>(
    client: &'a mut IndiClient<T>,
    device: &str,
    vector: &str,
) -> Result<&'a PropertyVector> {
    client.get_properties(Some(device))?;
    client
        .wait_for(device, vector, Duration::from_secs(5), |_| true)
        .with_context(|| format!("Server did not define {}.{}", device, vector))
}

fn seconds(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value).map_err(|_| anyhow!("invalid duration: {}", value))
}

/// Split `NAME=VALUE` on the first `=`
fn parse_assignment(raw: &str) -> Result<(&str, &str)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => Ok((name.trim(), value)),
        _ => bail!("expected NAME=VALUE, got '{}'", raw),
    }
}

fn typed_value(kind: VectorKind, raw: &str) -> Result<ElementValue> {
    match kind {
        VectorKind::Number => parse_number(raw)
            .map(ElementValue::Number)
            .ok_or_else(|| anyhow!("'{}' is not a number", raw)),
        VectorKind::Text => Ok(ElementValue::Text(raw.to_string())),
        VectorKind::Switch => match raw.trim().to_ascii_lowercase().as_str() {
            "on" | "1" | "true" => Ok(ElementValue::Switch(SwitchState::On)),
            "off" | "0" | "false" => Ok(ElementValue::Switch(SwitchState::Off)),
            _ => bail!("'{}' is not a switch state (use On or Off)", raw),
        },
        VectorKind::Blob => {
            let data = fs::read(raw).with_context(|| format!("Failed to read {}", raw))?;
            let format = Path::new(raw)
                .extension()
                .map(|ext| format!(".{}", ext.to_string_lossy()))
                .unwrap_or_default();
            Ok(ElementValue::Blob { data, format })
        }
        VectorKind::Light => bail!("light vectors are read-only"),
    }
}

fn write_blob(path: &Path, blob: &Blob) -> Result<()> {
    fs::write(path, &blob.data).with_context(|| format!("Failed to write {}", path.display()))
}

fn print_device(device: &Device) {
    println!("{}", device.name);
    for vector in device.vectors.values() {
        print_vector(vector);
    }
}

fn print_vector(vector: &PropertyVector) {
    println!(
        "  {} \"{}\" [{} {} {}] group={}",
        vector.name,
        vector.label,
        vector.kind(),
        vector.perm,
        vector.state,
        vector.group
    );
    for element in vector.iter_elements() {
        println!(
            "    {:<24} {:<24} {}",
            element.name(),
            element.label(),
            element.display_value()
        );
    }
}
