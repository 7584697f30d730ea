//! Simple example of using the indi_protocol client
//!
//! Connects to an INDI server, lists what it advertises, takes one exposure
//! and reports the size of the returned frame.
//!
//! First, start an INDI server with the CCD simulator:
//! ```bash
//! indiserver indi_simulator_ccd
//! ```
//!
//! Then run this example:
//! ```bash
//! cd indi_protocol && cargo run --example simple_client
//! ```

use indi_protocol::{ClientConfig, Event, IndiClient, PropertyState};
use log::{error, info};
use std::time::Duration;

const CAMERA: &str = "CCD Simulator";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    info!("🚀 Starting INDI client example");

    let config = ClientConfig::from_env()?;
    let mut client = IndiClient::connect_with_config(config)?;

    client.on_message(|msg| println!("💬 {}", msg.message));
    client.get_properties(None)?;

    // Let the server finish announcing its devices
    client.wait_for(CAMERA, "CONNECTION", Duration::from_secs(5), |_| true)?;
    client.process_events(Duration::from_millis(500))?;

    for device in client.devices() {
        println!("📷 {}", device.name);
        for vector in device.vectors.values() {
            println!("   {} [{}] {}", vector.name, vector.kind(), vector.state);
        }
    }

    client.set_switch_by_label(CAMERA, "CONNECTION", "Connect")?;
    client.wait_for_completion(CAMERA, "CONNECTION", Duration::from_secs(10))?;

    info!("📸 Starting a 1 second exposure");
    client.set_number(CAMERA, "CCD_EXPOSURE", "CCD_EXPOSURE_VALUE", 1.0)?;
    match client.wait_for_completion(CAMERA, "CCD_EXPOSURE", Duration::from_secs(30))? {
        PropertyState::Ok => info!("✅ Exposure complete"),
        state => {
            error!("❌ Exposure ended in state {}", state);
            return Err(format!("exposure failed with state {}", state).into());
        }
    }

    // The frame may trail the final exposure update slightly
    client.wait_for(CAMERA, "CCD1", Duration::from_secs(10), |v| v.state == PropertyState::Ok)?;
    for event in client.drain_events() {
        if let Event::BlobReceived { element, size, format, .. } = event {
            println!("🖼️ {} delivered {} bytes ({})", element, size, format);
        }
    }

    client.disconnect();
    Ok(())
}
