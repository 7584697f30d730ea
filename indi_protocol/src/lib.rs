//! # INDI Protocol
//!
//! Client for the INDI (Instrument Neutral Distributed Interface) XML-over-TCP
//! protocol used to control astronomical cameras, mounts and focusers.
//!
//! This crate provides:
//! - An incremental XML stream parser tolerant of elements split across reads
//! - A typed mirror of the devices and property vectors a server advertises
//! - BLOB decoding for inline base64 camera frames
//! - A client facade with callbacks, an event queue and "set, then wait" helpers
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use indi_protocol::{IndiClient, PropertyState};
//! use std::time::Duration;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut client = IndiClient::connect("localhost", 7624)?;
//! client.get_properties(None)?;
//!
//! // Wait until the camera has announced its exposure control
//! client.wait_for("CCD Simulator", "CCD_EXPOSURE", Duration::from_secs(5), |_| true)?;
//!
//! client.set_number("CCD Simulator", "CCD_EXPOSURE", "CCD_EXPOSURE_VALUE", 2.0)?;
//! let state = client.wait_for_completion("CCD Simulator", "CCD_EXPOSURE", Duration::from_secs(30))?;
//! assert_eq!(state, PropertyState::Ok);
//!
//! if let Some(frame) = client.get_blob("CCD Simulator", "CCD1", "CCD1") {
//!     println!("Got {} bytes ({})", frame.data.len(), frame.plain_format());
//! }
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod parser;
pub mod poller;
pub mod property;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use client::IndiClient;
pub use config::{ClientConfig, ConfigError};
pub use dispatch::Event;
pub use error::{IndiError, Result};
pub use poller::Poller;
pub use property::{Blob, Device, ElementRef, Elements, PropertyModel, PropertyVector};
pub use protocol::{
    BlobMode, ElementValue, PropertyPerm, PropertyState, ServerMessage, SwitchRule, SwitchState,
    VectorKind,
};
pub use transport::{TcpTransport, Transport};
