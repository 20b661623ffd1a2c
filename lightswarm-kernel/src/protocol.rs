/**
 * PROTOCOLE LIGHTSWARM - Codec binaire des trames échangées avec l'essaim
 *
 * RÔLE :
 * Traduit les datagrammes UDP bruts en messages typés et inversement.
 * Aucun état : chaque trame est décodée indépendamment des précédentes.
 *
 * FORMAT :
 * - Trame courte (14 octets) : [0xF0][type][id][payload 10 octets][0x0F]
 * - Trame de log : [0xF0][5][id][longueur][réservé][texte ASCII][terminateur]
 *
 * Le texte d'une trame de log ressemble à " 0,1,28,512,PR,42 | 1,0,28,300,PR,43 "
 * (index, maître, version, valeur, état, id) : seul le 4e champ du premier
 * enregistrement est exploité comme échantillon.
 *
 * UTILITÉ DANS LIGHTSWARM :
 * 🎯 Validation stricte : une trame invalide devient une erreur typée, jamais un panic
 * 🎯 Types fermés : chaque octet de type inconnu est un cas explicite
 */

use serde::Serialize;
use std::fmt;
use std::net::Ipv4Addr;

pub const SYNC_BYTE: u8 = 0xF0;
pub const TERMINATOR: u8 = 0x0F;
pub const SHORT_PACKET_LEN: usize = 14;
pub const PAYLOAD_LEN: usize = 10;
/// sync + type + id + longueur + réservé
pub const LOG_HEADER_LEN: usize = 5;
pub const MAX_BLINK_TENTHS: u8 = 126;

// Le firmware ESP8266 construit la trame de log avec strcpy : le dernier octet est le NUL final.
const FIRMWARE_NUL_TERMINATOR: u8 = 0x00;
const SAMPLE_FIELD: usize = 3;

/// Erreurs de décodage d'un datagramme
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedPacketError {
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),
    #[error("bad sync byte 0x{0:02X}")]
    BadSync(u8),
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("{kind} packet must be {expected} bytes, got {actual}")]
    BadLength {
        kind: PacketType,
        expected: usize,
        actual: usize,
    },
    #[error("bad terminator 0x{0:02X}")]
    BadTerminator(u8),
    #[error("external id 0 is reserved for unassigned slots")]
    ReservedMemberId,
    #[error("log payload is not ASCII")]
    NonAsciiPayload,
    #[error("log payload too long: {0} bytes")]
    PayloadTooLong(usize),
    #[error("log record has {0} fields, expected at least 4")]
    MissingSampleField(usize),
    #[error("invalid sample value {0:?}")]
    InvalidSample(String),
}

impl MalformedPacketError {
    /// Raison courte utilisée dans le journal
    pub fn reason(&self) -> &'static str {
        match self {
            Self::TooShort(_) => "too_short",
            Self::BadSync(_) => "bad_sync",
            Self::UnknownType(_) => "unknown_type",
            Self::BadLength { .. } => "bad_length",
            Self::BadTerminator(_) => "bad_terminator",
            Self::ReservedMemberId => "reserved_member_id",
            Self::NonAsciiPayload => "non_ascii_payload",
            Self::PayloadTooLong(_) => "payload_too_long",
            Self::MissingSampleField(_) => "missing_sample_field",
            Self::InvalidSample(_) => "invalid_sample",
        }
    }
}

/// Types de trames connus (octet 1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum PacketType {
    LightUpdate = 0,
    ResetSwarm = 1,
    ChangeTest = 2,
    ResetMe = 3,
    DefineServerLogger = 4,
    LogToServer = 5,
    MasterChange = 6,
    BlinkBrightLed = 7,
}

impl PacketType {
    pub const ALL: [PacketType; 8] = [
        PacketType::LightUpdate,
        PacketType::ResetSwarm,
        PacketType::ChangeTest,
        PacketType::ResetMe,
        PacketType::DefineServerLogger,
        PacketType::LogToServer,
        PacketType::MasterChange,
        PacketType::BlinkBrightLed,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::LightUpdate => "LIGHT_UPDATE",
            PacketType::ResetSwarm => "RESET_SWARM",
            PacketType::ChangeTest => "CHANGE_TEST",
            PacketType::ResetMe => "RESET_ME",
            PacketType::DefineServerLogger => "DEFINE_SERVER_LOGGER",
            PacketType::LogToServer => "LOG_TO_SERVER",
            PacketType::MasterChange => "MASTER_CHANGE",
            PacketType::BlinkBrightLed => "BLINK_BRIGHT_LED",
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<u8> for PacketType {
    type Error = MalformedPacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(PacketType::LightUpdate),
            1 => Ok(PacketType::ResetSwarm),
            2 => Ok(PacketType::ChangeTest),
            3 => Ok(PacketType::ResetMe),
            4 => Ok(PacketType::DefineServerLogger),
            5 => Ok(PacketType::LogToServer),
            6 => Ok(PacketType::MasterChange),
            7 => Ok(PacketType::BlinkBrightLed),
            other => Err(MalformedPacketError::UnknownType(other)),
        }
    }
}

/// Identifiant externe d'un membre (dernier octet de son IP côté firmware).
/// Jamais 0 : cette valeur marque un slot libre.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct MemberId(u8);

impl MemberId {
    pub const MIN: MemberId = MemberId(1);

    pub fn new(raw: u8) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Contenu d'une trame LIGHT_UPDATE : drapeau maître, version firmware,
/// puis quatre canaux 16 bits big-endian (clair, rouge, vert, bleu).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LightReport {
    pub is_master: bool,
    pub version: u8,
    pub clear: u16,
    pub red: u16,
    pub green: u16,
    pub blue: u16,
}

impl LightReport {
    fn to_payload(self) -> [u8; PAYLOAD_LEN] {
        let mut p = [0u8; PAYLOAD_LEN];
        p[0] = u8::from(self.is_master);
        p[1] = self.version;
        p[2..4].copy_from_slice(&self.clear.to_be_bytes());
        p[4..6].copy_from_slice(&self.red.to_be_bytes());
        p[6..8].copy_from_slice(&self.green.to_be_bytes());
        p[8..10].copy_from_slice(&self.blue.to_be_bytes());
        p
    }

    fn from_payload(p: &[u8; PAYLOAD_LEN]) -> Self {
        Self {
            is_master: p[0] != 0,
            version: p[1],
            clear: u16::from_be_bytes([p[2], p[3]]),
            red: u16::from_be_bytes([p[4], p[5]]),
            green: u16::from_be_bytes([p[6], p[7]]),
            blue: u16::from_be_bytes([p[8], p[9]]),
        }
    }
}

/// Rapport texte d'une trame LOG_TO_SERVER, validé une seule fois au décodage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogReport {
    records: Vec<String>,
    sample: i32,
}

impl LogReport {
    /// Parse le texte "a,b,c,VALEUR,...|..." en enregistrements nettoyés
    pub fn parse(text: &str) -> Result<Self, MalformedPacketError> {
        if !text.is_ascii() {
            return Err(MalformedPacketError::NonAsciiPayload);
        }
        if text.len() > usize::from(u8::MAX) {
            return Err(MalformedPacketError::PayloadTooLong(text.len()));
        }

        let records: Vec<String> = text
            .split('|')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from)
            .collect();

        let first = records
            .first()
            .ok_or(MalformedPacketError::MissingSampleField(0))?;
        let fields: Vec<&str> = first.split(',').map(str::trim).collect();
        let raw = fields
            .get(SAMPLE_FIELD)
            .ok_or(MalformedPacketError::MissingSampleField(fields.len()))?;
        let sample = raw
            .parse::<i32>()
            .map_err(|_| MalformedPacketError::InvalidSample(raw.to_string()))?;

        Ok(Self { records, sample })
    }

    pub fn records(&self) -> &[String] {
        &self.records
    }

    pub fn sample(&self) -> i32 {
        self.sample
    }

    pub fn to_text(&self) -> String {
        self.records.join("|")
    }
}

/// Message typé de l'essaim
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    LightUpdate {
        member: MemberId,
        report: LightReport,
    },
    ResetSwarm {
        member: MemberId,
    },
    ChangeTest {
        member: MemberId,
        payload: [u8; PAYLOAD_LEN],
    },
    ResetMe {
        member: MemberId,
    },
    DefineServerLogger {
        member: MemberId,
        server: Ipv4Addr,
    },
    LogToServer {
        member: MemberId,
        version: u8,
        report: LogReport,
    },
    MasterChange {
        member: MemberId,
    },
    BlinkBrightLed {
        member: MemberId,
        target: MemberId,
        version: u8,
        tenths: u8,
    },
}

/// Durée de clignotement en dixièmes de seconde, bornée à [0, 126]
pub fn blink_tenths(seconds: f32) -> u8 {
    // NaN passe à travers clamp puis devient 0 via `as`
    (seconds * 10.0).clamp(0.0, f32::from(MAX_BLINK_TENTHS)) as u8
}

impl Packet {
    /// BLINK_BRIGHT_LED adressé à `target`, durée en secondes bornée
    pub fn blink(target: MemberId, version: u8, seconds: f32) -> Self {
        Packet::BlinkBrightLed {
            member: target,
            target,
            version,
            tenths: blink_tenths(seconds),
        }
    }

    pub fn kind(&self) -> PacketType {
        match self {
            Packet::LightUpdate { .. } => PacketType::LightUpdate,
            Packet::ResetSwarm { .. } => PacketType::ResetSwarm,
            Packet::ChangeTest { .. } => PacketType::ChangeTest,
            Packet::ResetMe { .. } => PacketType::ResetMe,
            Packet::DefineServerLogger { .. } => PacketType::DefineServerLogger,
            Packet::LogToServer { .. } => PacketType::LogToServer,
            Packet::MasterChange { .. } => PacketType::MasterChange,
            Packet::BlinkBrightLed { .. } => PacketType::BlinkBrightLed,
        }
    }

    pub fn member(&self) -> MemberId {
        match self {
            Packet::LightUpdate { member, .. }
            | Packet::ResetSwarm { member }
            | Packet::ChangeTest { member, .. }
            | Packet::ResetMe { member }
            | Packet::DefineServerLogger { member, .. }
            | Packet::LogToServer { member, .. }
            | Packet::MasterChange { member }
            | Packet::BlinkBrightLed { member, .. } => *member,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        if let Packet::LogToServer { member, version, report } = self {
            let text = report.to_text();
            let mut out = Vec::with_capacity(LOG_HEADER_LEN + text.len() + 1);
            out.extend_from_slice(&[SYNC_BYTE, PacketType::LogToServer.code(), member.get()]);
            // LogReport::parse garantit une longueur <= 255
            out.push(text.len() as u8);
            out.push(*version);
            out.extend_from_slice(text.as_bytes());
            out.push(TERMINATOR);
            return out;
        }

        let payload = match self {
            Packet::LightUpdate { report, .. } => report.to_payload(),
            Packet::ChangeTest { payload, .. } => *payload,
            Packet::DefineServerLogger { server, .. } => {
                let mut p = [0u8; PAYLOAD_LEN];
                p[..4].copy_from_slice(&server.octets());
                p
            }
            Packet::BlinkBrightLed { target, version, tenths, .. } => {
                let mut p = [0u8; PAYLOAD_LEN];
                p[0] = target.get();
                p[1] = *version;
                p[2] = (*tenths).min(MAX_BLINK_TENTHS);
                p
            }
            _ => [0u8; PAYLOAD_LEN],
        };

        let mut out = Vec::with_capacity(SHORT_PACKET_LEN);
        out.extend_from_slice(&[SYNC_BYTE, self.kind().code(), self.member().get()]);
        out.extend_from_slice(&payload);
        out.push(TERMINATOR);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Packet, MalformedPacketError> {
        if bytes.len() < 3 {
            return Err(MalformedPacketError::TooShort(bytes.len()));
        }
        if bytes[0] != SYNC_BYTE {
            return Err(MalformedPacketError::BadSync(bytes[0]));
        }
        match PacketType::try_from(bytes[1])? {
            PacketType::LogToServer => decode_log(bytes),
            kind => decode_short(kind, bytes),
        }
    }
}

fn decode_short(kind: PacketType, bytes: &[u8]) -> Result<Packet, MalformedPacketError> {
    if bytes.len() != SHORT_PACKET_LEN {
        return Err(MalformedPacketError::BadLength {
            kind,
            expected: SHORT_PACKET_LEN,
            actual: bytes.len(),
        });
    }
    let last = bytes[SHORT_PACKET_LEN - 1];
    if last != TERMINATOR {
        return Err(MalformedPacketError::BadTerminator(last));
    }
    let member = MemberId::new(bytes[2]).ok_or(MalformedPacketError::ReservedMemberId)?;

    let mut payload = [0u8; PAYLOAD_LEN];
    payload.copy_from_slice(&bytes[3..3 + PAYLOAD_LEN]);

    let packet = match kind {
        PacketType::LightUpdate => Packet::LightUpdate {
            member,
            report: LightReport::from_payload(&payload),
        },
        PacketType::ResetSwarm => Packet::ResetSwarm { member },
        PacketType::ChangeTest => Packet::ChangeTest { member, payload },
        PacketType::ResetMe => Packet::ResetMe { member },
        PacketType::DefineServerLogger => Packet::DefineServerLogger {
            member,
            server: Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]),
        },
        PacketType::MasterChange => Packet::MasterChange { member },
        PacketType::BlinkBrightLed => Packet::BlinkBrightLed {
            member,
            target: MemberId::new(payload[0]).ok_or(MalformedPacketError::ReservedMemberId)?,
            version: payload[1],
            tenths: payload[2],
        },
        PacketType::LogToServer => return decode_log(bytes),
    };
    Ok(packet)
}

fn decode_log(bytes: &[u8]) -> Result<Packet, MalformedPacketError> {
    if bytes.len() < LOG_HEADER_LEN + 1 {
        return Err(MalformedPacketError::BadLength {
            kind: PacketType::LogToServer,
            expected: LOG_HEADER_LEN + 1,
            actual: bytes.len(),
        });
    }
    let text_len = usize::from(bytes[3]);
    let expected = LOG_HEADER_LEN + text_len + 1;
    if bytes.len() != expected {
        return Err(MalformedPacketError::BadLength {
            kind: PacketType::LogToServer,
            expected,
            actual: bytes.len(),
        });
    }
    let last = bytes[expected - 1];
    if last != TERMINATOR && last != FIRMWARE_NUL_TERMINATOR {
        return Err(MalformedPacketError::BadTerminator(last));
    }
    let member = MemberId::new(bytes[2]).ok_or(MalformedPacketError::ReservedMemberId)?;

    let text = &bytes[LOG_HEADER_LEN..LOG_HEADER_LEN + text_len];
    let text = std::str::from_utf8(text).map_err(|_| MalformedPacketError::NonAsciiPayload)?;
    let report = LogReport::parse(text)?;

    Ok(Packet::LogToServer {
        member,
        version: bytes[4],
        report,
    })
}
