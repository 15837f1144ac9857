//! RTCP status-record parsing.
//!
//! SAT>IP servers report per-tuner signal telemetry in a custom RTCP APP
//! packet on the RTCP leg of each session's port pair:
//!
//! 1. a 4-byte name field, set to `SES1`
//! 2. a 2-byte identifier field, set to zero
//! 3. a 2-byte length of the string that follows
//! 4. a NUL-padded string of the form
//!    `ver=<maj>.<min>;src=<srcID>;tuner=<feID>,<level>,<lock>,<quality>,
//!    <frequency>,<polarisation>,<system>,<type>,<pilots>,<roll_off>,
//!    <symbol_rate>,<fec_inner>;pids=<pid0>,...,<pidn>`
//!
//! Datagrams usually arrive as compound packets (SR + SDES + APP); only
//! the APP packet carries the signal data.

use crate::error::ProtocolError;

/// RTCP packet type for application-defined packets.
pub const RTCP_PT_APP: u8 = 204;

/// Signal level ceiling on the wire (0–255; -25 dBm maps to 224, -65 dBm
/// to 32, no signal to 0).
pub const LEVEL_WIRE_MAX: u8 = 255;

/// Quality ceiling on the wire (0–15; 15 means a BER below 2e-4 after
/// Viterbi for DVB-S, a PER below 1e-7 for DVB-S2).
pub const QUALITY_WIRE_MAX: u8 = 15;

/// One decoded SAT>IP tuner status record.
#[derive(Debug, Clone, PartialEq)]
pub struct TunerStatus {
    /// APP packet name, `SES1` on compliant servers.
    pub name: String,
    /// Protocol version string from the `ver=` entry.
    pub version: Option<String>,
    /// Signal source from the `src=` entry.
    pub source: Option<u32>,
    /// Frontend (tuner) id on the server.
    pub frontend: u16,
    /// Raw signal level, 0–255.
    pub signal_level: u8,
    /// Whether the frontend has locked onto the transponder.
    pub lock: bool,
    /// Raw signal quality, 0–15.
    pub quality: u8,
    /// Echoed tuning parameters.
    pub frequency_mhz: f64,
    pub polarisation: String,
    pub system: String,
    pub modulation: String,
    pub pilots: bool,
    pub rolloff: f64,
    pub symbol_rate: u32,
    pub fec: String,
    /// PIDs currently streamed for this session.
    pub pids: Vec<u16>,
}

impl TunerStatus {
    /// Signal level normalized to 0–100.
    pub fn level_percent(&self) -> u8 {
        (u32::from(self.signal_level) * 100 / u32::from(LEVEL_WIRE_MAX)) as u8
    }

    /// Signal quality normalized to 0–100.
    pub fn quality_percent(&self) -> u8 {
        (u32::from(self.quality) * 100 / u32::from(QUALITY_WIRE_MAX)) as u8
    }

    fn parse_app(specific: &[u8]) -> Result<Self, ProtocolError> {
        if specific.len() < 8 {
            return Err(ProtocolError::InvalidAppRecord(format!(
                "record too short: {} bytes",
                specific.len()
            )));
        }

        let name = String::from_utf8_lossy(&specific[..4]).into_owned();
        let identifier = u16::from_be_bytes([specific[4], specific[5]]);
        let declared_len = usize::from(u16::from_be_bytes([specific[6], specific[7]]));

        if identifier != 0 {
            return Err(ProtocolError::InvalidAppRecord(format!(
                "expected identifier 0, got {}",
                identifier
            )));
        }

        let text = std::str::from_utf8(&specific[8..])
            .map_err(|_| ProtocolError::InvalidAppRecord("non-UTF-8 payload".to_string()))?
            .trim_end_matches('\0');
        if text.len() != declared_len {
            return Err(ProtocolError::InvalidAppRecord(format!(
                "expected string length {}, got {}",
                declared_len,
                text.len()
            )));
        }

        let mut version = None;
        let mut source = None;
        let mut tuner = None;
        let mut pids = Vec::new();

        for entry in text.split(';') {
            if let Some(raw) = entry.strip_prefix("ver=") {
                version = Some(raw.to_string());
            } else if let Some(raw) = entry.strip_prefix("src=") {
                source = Some(raw.parse().map_err(|_| {
                    ProtocolError::InvalidAppRecord(format!("bad src entry: {:?}", raw))
                })?);
            } else if let Some(raw) = entry.strip_prefix("tuner=") {
                tuner = Some(raw.trim());
            } else if let Some(raw) = entry.strip_prefix("pids=") {
                pids = raw
                    .split(',')
                    .filter(|p| !p.is_empty())
                    .map(|p| {
                        p.parse().map_err(|_| {
                            ProtocolError::InvalidAppRecord(format!("bad pid: {:?}", p))
                        })
                    })
                    .collect::<Result<_, _>>()?;
            }
        }

        let tuner = tuner.ok_or_else(|| {
            ProtocolError::InvalidAppRecord("missing tuner section".to_string())
        })?;
        let fields: Vec<&str> = tuner.split(',').collect();
        if fields.len() != 12 {
            return Err(ProtocolError::InvalidAppRecord(format!(
                "tuner section has {} fields, expected 12",
                fields.len()
            )));
        }

        let bad = |what: &str, raw: &str| {
            ProtocolError::InvalidAppRecord(format!("bad {} field: {:?}", what, raw))
        };

        let frontend = fields[0].parse().map_err(|_| bad("frontend", fields[0]))?;
        let signal_level: u8 = fields[1].parse().map_err(|_| bad("level", fields[1]))?;
        let lock = fields[2] == "1";
        let quality: u8 = fields[3].parse().map_err(|_| bad("quality", fields[3]))?;
        if quality > QUALITY_WIRE_MAX {
            return Err(bad("quality", fields[3]));
        }
        let frequency_mhz = fields[4].parse().map_err(|_| bad("frequency", fields[4]))?;
        let rolloff = fields[9].parse().map_err(|_| bad("roll_off", fields[9]))?;
        let symbol_rate = fields[10]
            .parse()
            .map_err(|_| bad("symbol_rate", fields[10]))?;

        Ok(TunerStatus {
            name,
            version,
            source,
            frontend,
            signal_level,
            lock,
            quality,
            frequency_mhz,
            polarisation: fields[5].to_string(),
            system: fields[6].to_string(),
            modulation: fields[7].to_string(),
            pilots: fields[8].eq_ignore_ascii_case("on"),
            rolloff,
            symbol_rate,
            fec: fields[11].to_string(),
            pids,
        })
    }
}

/// Walk a (possibly compound) RTCP datagram and decode the first APP
/// packet found, skipping the other packet types.
///
/// Returns `Ok(None)` when the datagram is well formed but carries no APP
/// packet.
pub fn first_app_status(packet: &[u8]) -> Result<Option<TunerStatus>, ProtocolError> {
    let mut index = 0;

    // Each RTCP packet is a 4-byte header, a 4-byte SSRC, then
    // type-specific data; the length field counts 32-bit words after the
    // header word.
    while index + 8 <= packet.len() {
        let version = packet[index] >> 6;
        if version != 2 {
            return Err(ProtocolError::InvalidRtcpVersion(version));
        }

        let packet_type = packet[index + 1];
        let length_words = usize::from(u16::from_be_bytes([packet[index + 2], packet[index + 3]]));
        let total = length_words * 4 + 4;

        if index + total > packet.len() {
            return Err(ProtocolError::TruncatedRtcp {
                expected: total,
                actual: packet.len() - index,
            });
        }

        if packet_type == RTCP_PT_APP {
            if total < 8 {
                return Err(ProtocolError::InvalidAppRecord(
                    "APP packet shorter than its SSRC".to_string(),
                ));
            }
            let specific = &packet[index + 8..index + total];
            return TunerStatus::parse_app(specific).map(Some);
        }

        index += total;
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A real compound datagram (SR + SDES + APP) captured from a SAT>IP
    /// server before lock was achieved.
    const COMPOUND: &[u8] = &[
        0x80, 0xc8, 0x00, 0x06, 0x00, 0x82, 0x7a, 0xb5, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x8c, 0x7b, 0x82, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x01, 0x37, 0x60, 0x81, 0xca,
        0x00, 0x06, 0x00, 0x82, 0x7a, 0xb5, 0x01, 0x11, 0x46, 0x46, 0x3a, 0x46, 0x46, 0x3a, 0x46,
        0x46, 0x3a, 0x46, 0x46, 0x3a, 0x46, 0x46, 0x3a, 0x46, 0x46, 0x00, 0x80, 0xcc, 0x00, 0x1f,
        0x00, 0x82, 0x7a, 0xb5, 0x53, 0x45, 0x53, 0x31, 0x00, 0x00, 0x00, 0x6e, 0x76, 0x65, 0x72,
        0x3d, 0x31, 0x2e, 0x30, 0x3b, 0x73, 0x72, 0x63, 0x3d, 0x31, 0x3b, 0x74, 0x75, 0x6e, 0x65,
        0x72, 0x3d, 0x31, 0x2c, 0x31, 0x31, 0x35, 0x2c, 0x31, 0x2c, 0x31, 0x33, 0x2c, 0x31, 0x30,
        0x37, 0x31, 0x34, 0x2c, 0x68, 0x2c, 0x64, 0x76, 0x62, 0x73, 0x2c, 0x71, 0x70, 0x73, 0x6b,
        0x2c, 0x6f, 0x66, 0x66, 0x2c, 0x30, 0x2e, 0x33, 0x35, 0x2c, 0x32, 0x32, 0x30, 0x30, 0x30,
        0x2c, 0x35, 0x36, 0x3b, 0x70, 0x69, 0x64, 0x73, 0x3d, 0x30, 0x2c, 0x31, 0x2c, 0x31, 0x36,
        0x2c, 0x31, 0x37, 0x2c, 0x32, 0x36, 0x36, 0x2c, 0x32, 0x33, 0x35, 0x33, 0x2c, 0x32, 0x33,
        0x35, 0x34, 0x2c, 0x32, 0x33, 0x35, 0x35, 0x2c, 0x32, 0x33, 0x35, 0x36, 0x2c, 0x32, 0x33,
        0x35, 0x37, 0x00, 0x00,
    ];

    /// Build a minimal single-packet datagram around an APP string.
    fn app_datagram(name: &[u8; 4], identifier: u16, declared_len: u16, text: &str) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(name);
        payload.extend_from_slice(&identifier.to_be_bytes());
        payload.extend_from_slice(&declared_len.to_be_bytes());
        payload.extend_from_slice(text.as_bytes());
        while payload.len() % 4 != 0 {
            payload.push(0);
        }

        let length_words = ((payload.len() + 4) / 4) as u16;
        let mut packet = vec![0x80, RTCP_PT_APP];
        packet.extend_from_slice(&length_words.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 0, 1]); // ssrc
        packet.extend_from_slice(&payload);
        packet
    }

    const STATUS_TEXT: &str =
        "ver=1.0;src=1;tuner=1,115,1,13,10714,h,dvbs,qpsk,off,0.35,22000,56;pids=0,16";

    #[test]
    fn decodes_app_packet_from_compound_datagram() {
        let status = first_app_status(COMPOUND).unwrap().unwrap();
        assert_eq!(status.name, "SES1");
        assert_eq!(status.version.as_deref(), Some("1.0"));
        assert_eq!(status.source, Some(1));
        assert_eq!(status.frontend, 1);
        assert_eq!(status.signal_level, 115);
        assert!(status.lock);
        assert_eq!(status.quality, 13);
        assert_eq!(status.frequency_mhz, 10714.0);
        assert_eq!(status.polarisation, "h");
        assert_eq!(status.system, "dvbs");
        assert_eq!(status.modulation, "qpsk");
        assert!(!status.pilots);
        assert_eq!(status.rolloff, 0.35);
        assert_eq!(status.symbol_rate, 22000);
        assert_eq!(status.fec, "56");
        assert_eq!(
            status.pids,
            vec![0, 1, 16, 17, 266, 2353, 2354, 2355, 2356, 2357]
        );
    }

    #[test]
    fn normalizes_level_and_quality_to_percent() {
        let status = first_app_status(COMPOUND).unwrap().unwrap();
        assert_eq!(status.level_percent(), 45); // 115/255
        assert_eq!(status.quality_percent(), 86); // 13/15
    }

    #[test]
    fn datagram_without_app_packet_yields_none() {
        // SR + SDES only: the first 56 bytes of the compound fixture.
        assert_eq!(first_app_status(&COMPOUND[..56]).unwrap(), None);
    }

    #[test]
    fn rejects_wrong_rtcp_version() {
        let mut packet = COMPOUND.to_vec();
        packet[0] = 0x40; // version 1
        assert!(matches!(
            first_app_status(&packet),
            Err(ProtocolError::InvalidRtcpVersion(1))
        ));
    }

    #[test]
    fn rejects_truncated_packet() {
        assert!(matches!(
            first_app_status(&COMPOUND[..20]),
            Err(ProtocolError::TruncatedRtcp { .. })
        ));
    }

    #[test]
    fn rejects_nonzero_identifier() {
        let len = STATUS_TEXT.len() as u16;
        let packet = app_datagram(b"SES1", 7, len, STATUS_TEXT);
        assert!(matches!(
            first_app_status(&packet),
            Err(ProtocolError::InvalidAppRecord(_))
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        let packet = app_datagram(b"SES1", 0, 3, STATUS_TEXT);
        assert!(matches!(
            first_app_status(&packet),
            Err(ProtocolError::InvalidAppRecord(_))
        ));
    }

    #[test]
    fn rejects_short_tuner_section() {
        let text = "ver=1.0;tuner=1,115,1;pids=0";
        let packet = app_datagram(b"SES1", 0, text.len() as u16, text);
        assert!(matches!(
            first_app_status(&packet),
            Err(ProtocolError::InvalidAppRecord(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_quality() {
        let text = "tuner=1,115,1,16,10714,h,dvbs,qpsk,off,0.35,22000,56";
        let packet = app_datagram(b"SES1", 0, text.len() as u16, text);
        assert!(matches!(
            first_app_status(&packet),
            Err(ProtocolError::InvalidAppRecord(_))
        ));
    }

    #[test]
    fn lock_flag_parses_from_wire_digit() {
        let text = "tuner=1,115,0,13,10714,h,dvbs,qpsk,off,0.35,22000,56";
        let packet = app_datagram(b"SES1", 0, text.len() as u16, text);
        let status = first_app_status(&packet).unwrap().unwrap();
        assert!(!status.lock);
    }
}
