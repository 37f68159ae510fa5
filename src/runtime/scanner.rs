//! Bus discovery
//!
//! Sweeps the address range probing the device-type parameter; every
//! responder is read out and kept, substituting defaults for anything it
//! refuses to answer, so the operator always retains control.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::protocols::propar::constants::{MAX_SCAN_ADDRESS, MIN_ADDRESS};
use crate::protocols::propar::db::{dde, ParameterDb};
use crate::protocols::propar::instrument::Instrument;
use crate::protocols::propar::port::PortManager;
use crate::protocols::propar::types::ParameterValue;

/// DDE bundle read from every responder.
pub const SCAN_BUNDLE: [u16; 8] = [
    dde::USER_TAG,
    dde::FLUID_NAME,
    dde::CAPACITY,
    dde::CAPACITY_UNIT,
    dde::FLUID_INDEX,
    dde::FSETPOINT,
    dde::MODEL_NUMBER,
    dde::IDENT_NUMBER,
];

/// How long one silent address may hold up the sweep.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Device family derived from the identification number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceType {
    Dmfc,
    Dmfm,
    Depc,
    Depm,
    Dlfc,
    Dlfm,
    Unknown,
}

impl DeviceType {
    pub fn from_ident(ident_nr: Option<i64>) -> Self {
        match ident_nr {
            Some(7) => DeviceType::Dmfc,
            Some(8) => DeviceType::Dmfm,
            Some(9) => DeviceType::Depc,
            Some(10) => DeviceType::Depm,
            Some(12) => DeviceType::Dlfc,
            Some(13) => DeviceType::Dlfm,
            _ => DeviceType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Dmfc => "DMFC",
            DeviceType::Dmfm => "DMFM",
            DeviceType::Depc => "DEPC",
            DeviceType::Depm => "DEPM",
            DeviceType::Dlfc => "DLFC",
            DeviceType::Dlfm => "DLFM",
            DeviceType::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything discovery learns about one instrument.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentInfo {
    pub port: String,
    pub address: u8,
    pub usertag: String,
    pub fluid: String,
    pub capacity: f32,
    pub unit: String,
    pub fluid_index: u8,
    pub fsetpoint: f32,
    pub model: String,
    pub device_type: DeviceType,
    pub ident_nr: Option<i64>,
}

/// Sweep one port for instruments.
pub async fn scan_port(
    port: Arc<PortManager>,
    probe_timeout: Duration,
) -> Result<Vec<InstrumentInfo>> {
    let db = ParameterDb::global();
    let probe = db.get(dde::DEVICE_TYPE)?.descriptor();
    let mut found = Vec::new();

    info!(port = %port.name(), "scanning addresses {MIN_ADDRESS}..={MAX_SCAN_ADDRESS}");

    for address in MIN_ADDRESS..=MAX_SCAN_ADDRESS {
        let instrument = Instrument::new(port.clone(), address)?;

        let responded = matches!(
            timeout(
                probe_timeout,
                instrument.read_parameters_once(std::slice::from_ref(&probe)),
            )
            .await,
            Ok(Ok(_))
        );
        if !responded {
            continue;
        }

        debug!(port = %port.name(), address, "instrument responded to probe");
        found.push(read_instrument_info(&instrument).await);
    }

    info!(port = %port.name(), count = found.len(), "scan finished");
    Ok(found)
}

/// Read the discovery bundle, substituting defaults for whatever fails.
///
/// The instrument is kept in all cases so the user retains control.
async fn read_instrument_info(instrument: &Instrument) -> InstrumentInfo {
    let address = instrument.address();
    let values: Vec<Option<ParameterValue>> = match instrument.read_ddes(&SCAN_BUNDLE).await {
        Ok(values) => values.into_iter().map(Some).collect(),
        Err(e) => {
            warn!(
                port = %instrument.port_name(),
                address,
                "bundle read failed, retrying per parameter: {e}"
            );
            read_bundle_individually(instrument).await
        }
    };

    let ident_nr = values[7].as_ref().and_then(|v| v.as_i64());
    let string_or = |value: &Option<ParameterValue>, default: String| {
        value
            .as_ref()
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .unwrap_or(default)
    };

    InstrumentInfo {
        port: instrument.port_name().to_string(),
        address,
        usertag: string_or(&values[0], format!("Instrument_{address}")),
        fluid: string_or(&values[1], "Unknown".to_string()),
        capacity: values[2]
            .as_ref()
            .and_then(|v| v.as_f32())
            .unwrap_or(100.0),
        unit: string_or(&values[3], "ml/min".to_string()),
        fluid_index: values[4]
            .as_ref()
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
            .clamp(0, u8::MAX as i64) as u8,
        fsetpoint: values[5].as_ref().and_then(|v| v.as_f32()).unwrap_or(0.0),
        model: string_or(&values[6], format!("Unknown_Model_Addr{address}")),
        device_type: DeviceType::from_ident(ident_nr),
        ident_nr,
    }
}

/// Fallback path: fetch the bundle one parameter at a time so a single bad
/// register does not blank the whole record.
async fn read_bundle_individually(instrument: &Instrument) -> Vec<Option<ParameterValue>> {
    let db = ParameterDb::global();
    let mut values = Vec::with_capacity(SCAN_BUNDLE.len());
    for dde_nr in SCAN_BUNDLE {
        let value = match db.get(dde_nr) {
            Ok(spec) => instrument
                .read_parameters_once(std::slice::from_ref(&spec.descriptor()))
                .await
                .ok()
                .and_then(|mut v| v.pop()),
            Err(_) => None,
        };
        values.push(value);
    }
    values
}
