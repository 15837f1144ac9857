//! Tuning parameter types shared between the satfinder core and its
//! collaborators.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Default RTSP control port for SAT>IP servers.
pub const DEFAULT_RTSP_PORT: u16 = 554;

/// Default roll-off factor sent with every setup request.
pub const DEFAULT_ROLLOFF: &str = "0.35";

/// Signal source (DiSEqC position) sent with every setup request.
pub const DEFAULT_SOURCE: u8 = 1;

/// Polarisation of the requested transponder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Polarisation {
    Horizontal,
    Vertical,
    CircularLeft,
    CircularRight,
}

impl Polarisation {
    /// Query-string form used in SAT>IP stream URIs.
    pub fn as_query(self) -> &'static str {
        match self {
            Polarisation::Horizontal => "h",
            Polarisation::Vertical => "v",
            Polarisation::CircularLeft => "l",
            Polarisation::CircularRight => "r",
        }
    }
}

impl FromStr for Polarisation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "h" | "H" => Ok(Polarisation::Horizontal),
            "v" | "V" => Ok(Polarisation::Vertical),
            "l" | "L" => Ok(Polarisation::CircularLeft),
            "r" | "R" => Ok(Polarisation::CircularRight),
            other => Err(ValidationError::InvalidPolarisation(other.to_string())),
        }
    }
}

impl fmt::Display for Polarisation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_query())
    }
}

/// Modulation system of the requested transponder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliverySystem {
    Dvbs,
    Dvbs2,
}

impl DeliverySystem {
    /// Query-string form (`msys` parameter).
    pub fn as_query(self) -> &'static str {
        match self {
            DeliverySystem::Dvbs => "dvbs",
            DeliverySystem::Dvbs2 => "dvbs2",
        }
    }

    /// Modulation type implied by the system (`mtype` parameter).
    pub fn modulation_type(self) -> &'static str {
        match self {
            DeliverySystem::Dvbs => "qpsk",
            DeliverySystem::Dvbs2 => "8psk",
        }
    }
}

impl FromStr for DeliverySystem {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dvbs" => Ok(DeliverySystem::Dvbs),
            "dvbs2" => Ok(DeliverySystem::Dvbs2),
            other => Err(ValidationError::InvalidDeliverySystem(other.to_string())),
        }
    }
}

impl fmt::Display for DeliverySystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_query())
    }
}

/// Forward-error-correction code rate.
///
/// The wire form is the two digits without the slash (`34` for 3/4), as
/// used by the SAT>IP `fec` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FecRate {
    #[serde(rename = "1/2")]
    Rate1of2,
    #[serde(rename = "2/3")]
    Rate2of3,
    #[serde(rename = "3/4")]
    Rate3of4,
    #[serde(rename = "3/5")]
    Rate3of5,
    #[serde(rename = "4/5")]
    Rate4of5,
    #[serde(rename = "5/6")]
    Rate5of6,
    #[serde(rename = "7/8")]
    Rate7of8,
    #[serde(rename = "8/9")]
    Rate8of9,
    #[serde(rename = "9/10")]
    Rate9of10,
}

impl FecRate {
    /// Wire form for the `fec` query parameter.
    pub fn as_query(self) -> &'static str {
        match self {
            FecRate::Rate1of2 => "12",
            FecRate::Rate2of3 => "23",
            FecRate::Rate3of4 => "34",
            FecRate::Rate3of5 => "35",
            FecRate::Rate4of5 => "45",
            FecRate::Rate5of6 => "56",
            FecRate::Rate7of8 => "78",
            FecRate::Rate8of9 => "89",
            FecRate::Rate9of10 => "910",
        }
    }
}

impl FromStr for FecRate {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Accept both the human form ("3/4") and the wire form ("34").
        match s {
            "12" | "1/2" => Ok(FecRate::Rate1of2),
            "23" | "2/3" => Ok(FecRate::Rate2of3),
            "34" | "3/4" => Ok(FecRate::Rate3of4),
            "35" | "3/5" => Ok(FecRate::Rate3of5),
            "45" | "4/5" => Ok(FecRate::Rate4of5),
            "56" | "5/6" => Ok(FecRate::Rate5of6),
            "78" | "7/8" => Ok(FecRate::Rate7of8),
            "89" | "8/9" => Ok(FecRate::Rate8of9),
            "910" | "9/10" => Ok(FecRate::Rate9of10),
            other => Err(ValidationError::InvalidFecRate(other.to_string())),
        }
    }
}

impl fmt::Display for FecRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FecRate::Rate1of2 => "1/2",
            FecRate::Rate2of3 => "2/3",
            FecRate::Rate3of4 => "3/4",
            FecRate::Rate3of5 => "3/5",
            FecRate::Rate4of5 => "4/5",
            FecRate::Rate5of6 => "5/6",
            FecRate::Rate7of8 => "7/8",
            FecRate::Rate8of9 => "8/9",
            FecRate::Rate9of10 => "9/10",
        };
        f.write_str(s)
    }
}

/// A validated description of one target signal.
///
/// Immutable once created. `TuneRequest::new` and the `FromStr` impl
/// validate on construction; values deserialized from a config file must
/// be passed through [`TuneRequest::validate`] before use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuneRequest {
    /// Transponder frequency in MHz.
    pub frequency_mhz: f64,
    pub polarisation: Polarisation,
    pub system: DeliverySystem,
    /// Symbol rate in kSym/s.
    pub symbol_rate: u32,
    pub fec: FecRate,
    /// Optional display label.
    #[serde(default)]
    pub label: Option<String>,
}

impl TuneRequest {
    pub fn new(
        frequency_mhz: f64,
        polarisation: Polarisation,
        system: DeliverySystem,
        symbol_rate: u32,
        fec: FecRate,
        label: Option<String>,
    ) -> Result<Self, ValidationError> {
        let request = Self {
            frequency_mhz,
            polarisation,
            system,
            symbol_rate,
            fec,
            label,
        };
        request.validate()?;
        Ok(request)
    }

    /// Check the numeric ranges. Enum fields are valid by construction.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.frequency_mhz.is_finite() || self.frequency_mhz <= 0.0 {
            return Err(ValidationError::InvalidFrequency(self.frequency_mhz));
        }
        if self.symbol_rate == 0 {
            return Err(ValidationError::InvalidSymbolRate(self.symbol_rate));
        }
        Ok(())
    }

    /// Name shown next to this request's signal bars.
    pub fn display_name(&self) -> String {
        match &self.label {
            Some(label) => format!("{}/{}|{}", self.frequency_mhz, self.polarisation, label),
            None => format!("{}/{}", self.frequency_mhz, self.polarisation),
        }
    }

    /// Build the SAT>IP stream-URI query for a SETUP request.
    ///
    /// The requested PIDs are kept minimal (PAT only) since the tool never
    /// demultiplexes the transport stream.
    pub fn stream_query(&self, pids: &[u16]) -> String {
        let pids = pids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "?src={}&freq={}&sr={}&msys={}&mtype={}&pol={}&fec={}&ro={}&pids={}",
            DEFAULT_SOURCE,
            self.frequency_mhz,
            self.symbol_rate,
            self.system.as_query(),
            self.system.modulation_type(),
            self.polarisation.as_query(),
            self.fec.as_query(),
            DEFAULT_ROLLOFF,
            pids,
        )
    }
}

impl FromStr for TuneRequest {
    type Err = ValidationError;

    /// Parse the CLI tune-spec syntax:
    /// `frequency,polarisation,system,symbol_rate,fec[,name]`
    /// e.g. `10817.5,v,dvbs2,23000,34,BBC1HD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad_spec = || ValidationError::InvalidTuneSpec {
            spec: s.to_string(),
        };

        let parts: Vec<&str> = s.split(',').collect();
        if parts.len() < 5 || parts.len() > 6 {
            return Err(bad_spec());
        }

        let frequency_mhz: f64 = parts[0].trim().parse().map_err(|_| bad_spec())?;
        let polarisation: Polarisation = parts[1].trim().parse()?;
        let system: DeliverySystem = parts[2].trim().parse()?;
        let symbol_rate: u32 = parts[3].trim().parse().map_err(|_| bad_spec())?;
        let fec: FecRate = parts[4].trim().parse()?;
        let label = parts
            .get(5)
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty());

        TuneRequest::new(frequency_mhz, polarisation, system, symbol_rate, fec, label)
    }
}

/// Resolved server endpoint plus the deterministic client port plan.
///
/// Session `i` claims the UDP pair (`base_rtp_port + 2i`,
/// `base_rtp_port + 2i + 1`) for RTP/RTCP. The pairs must be reachable
/// through any firewall in front of the client; this is a deployment
/// precondition, not something the sessions negotiate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunerEndpoint {
    /// Server host name or address.
    pub host: String,
    /// RTSP control port.
    pub rtsp_port: u16,
    /// First client RTP port; pairs are allocated upwards from here.
    pub base_rtp_port: u16,
}

impl TunerEndpoint {
    pub fn new(host: impl Into<String>, rtsp_port: u16, base_rtp_port: u16) -> Self {
        Self {
            host: host.into(),
            rtsp_port,
            base_rtp_port,
        }
    }

    /// `rtsp://host[:port]/`, omitting the port when it is the default.
    pub fn base_uri(&self) -> String {
        if self.rtsp_port == DEFAULT_RTSP_PORT {
            format!("rtsp://{}/", self.host)
        } else {
            format!("rtsp://{}:{}/", self.host, self.rtsp_port)
        }
    }

    /// Socket address of the RTSP control port.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.rtsp_port)
    }

    /// The (RTP, RTCP) client port pair for the given session index, or
    /// `None` if the pair would overflow the port range.
    pub fn port_pair(&self, index: usize) -> Option<(u16, u16)> {
        let offset = u16::try_from(index.checked_mul(2)?).ok()?;
        let rtp = self.base_rtp_port.checked_add(offset)?;
        let rtcp = rtp.checked_add(1)?;
        Some((rtp, rtcp))
    }
}
