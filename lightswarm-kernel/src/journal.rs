/**
 * JOURNAL - Historique structuré de l'essaim
 *
 * RÔLE :
 * Reçoit les événements du coordinateur (arrivées, évictions, rapports du
 * maître, trames rejetées, resets) et les conserve.
 *
 * FONCTIONNEMENT :
 * - JsonlFileSink : un enregistrement JSON par ligne dans
 *   logfile_<YYYY-MM-DD_HH-MM-SS>_<session>.jsonl, nouveau fichier à chaque rotate()
 * - TracingSink : pas de répertoire configuré, les événements partent dans tracing
 * - MemorySink : copie partagée des événements, pour les tests et le devkit
 *
 * Un échec d'écriture n'est jamais fatal : il est loggé puis ignoré.
 */

use crate::display::DisplaySurface;
use crate::protocol::{MemberId, PacketType};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwarmEvent {
    KernelStarted {
        node_id: MemberId,
        bind: SocketAddr,
        advertise: Ipv4Addr,
    },
    MemberJoined {
        member: MemberId,
        slot: usize,
    },
    MemberEvicted {
        member: MemberId,
        slot: usize,
        previous: MemberId,
    },
    LightUpdate {
        member: MemberId,
        slot: usize,
        source: SocketAddr,
        is_master: bool,
        clear: u16,
    },
    PacketReceived {
        kind: PacketType,
        member: MemberId,
        source: SocketAddr,
    },
    MasterReport {
        member: MemberId,
        slot: usize,
        value: i32,
        version: u64,
        activity: u32,
        average: f64,
        records: Vec<String>,
    },
    SliceClosed {
        slices: usize,
        avg_values: Vec<f64>,
    },
    RefreshDispatched {
        surface: DisplaySurface,
        value: u32,
    },
    PacketDropped {
        reason: &'static str,
        detail: String,
        length: usize,
        raw_id: Option<u8>,
        source: SocketAddr,
    },
    SwarmReset {
        cleared_members: usize,
    },
    PacketSent {
        kind: PacketType,
        member: MemberId,
    },
    SendFailed {
        kind: PacketType,
        member: MemberId,
        detail: String,
    },
}

impl SwarmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SwarmEvent::KernelStarted { .. } => "kernel_started",
            SwarmEvent::MemberJoined { .. } => "member_joined",
            SwarmEvent::MemberEvicted { .. } => "member_evicted",
            SwarmEvent::LightUpdate { .. } => "light_update",
            SwarmEvent::PacketReceived { .. } => "packet_received",
            SwarmEvent::MasterReport { .. } => "master_report",
            SwarmEvent::SliceClosed { .. } => "slice_closed",
            SwarmEvent::RefreshDispatched { .. } => "refresh_dispatched",
            SwarmEvent::PacketDropped { .. } => "packet_dropped",
            SwarmEvent::SwarmReset { .. } => "swarm_reset",
            SwarmEvent::PacketSent { .. } => "packet_sent",
            SwarmEvent::SendFailed { .. } => "send_failed",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, SwarmEvent::PacketDropped { .. } | SwarmEvent::SendFailed { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("journal encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("journal timestamp: {0}")]
    Time(#[from] time::error::Format),
}

/// Frontière coordinateur → stockage de l'historique
pub trait LogSink: Send {
    fn emit(&mut self, event: &SwarmEvent);
    fn rotate(&mut self) -> Result<(), JournalError>;
}

#[derive(Serialize)]
struct JournalRecord<'a> {
    timestamp: String,
    session: Uuid,
    #[serde(flatten)]
    event: &'a SwarmEvent,
}

pub struct JsonlFileSink {
    dir: PathBuf,
    path: PathBuf,
    session: Uuid,
    writer: LineWriter<File>,
}

impl JsonlFileSink {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let session = Uuid::new_v4();
        let (path, writer) = open_session_file(&dir, session)?;
        info!(path = %path.display(), %session, "journal opened");
        Ok(Self {
            dir,
            path,
            session,
            writer,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    fn write_record(&mut self, event: &SwarmEvent) -> Result<(), JournalError> {
        let record = JournalRecord {
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339)?,
            session: self.session,
            event,
        };
        let line = serde_json::to_string(&record)?;
        writeln!(self.writer, "{line}")?;
        Ok(())
    }
}

fn open_session_file(dir: &Path, session: Uuid) -> Result<(PathBuf, LineWriter<File>), JournalError> {
    let stamp = OffsetDateTime::now_utc()
        .format(format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]"))?;
    let short = session.simple().to_string();
    let path = dir.join(format!("logfile_{stamp}_{}.jsonl", &short[..8]));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, LineWriter::new(file)))
}

impl LogSink for JsonlFileSink {
    fn emit(&mut self, event: &SwarmEvent) {
        if let Err(e) = self.write_record(event) {
            warn!(event = event.name(), "journal write failed: {e}");
        }
    }

    fn rotate(&mut self) -> Result<(), JournalError> {
        self.writer.flush()?;
        let session = Uuid::new_v4();
        let (path, writer) = open_session_file(&self.dir, session)?;
        info!(from = %self.path.display(), to = %path.display(), "journal rotated");
        self.path = path;
        self.session = session;
        self.writer = writer;
        Ok(())
    }
}

/// Pas de fichier : chaque événement devient une ligne tracing
pub struct TracingSink {
    session: Uuid,
}

impl TracingSink {
    pub fn new() -> Self {
        Self {
            session: Uuid::new_v4(),
        }
    }
}

impl Default for TracingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl LogSink for TracingSink {
    fn emit(&mut self, event: &SwarmEvent) {
        let record = serde_json::to_string(event).unwrap_or_else(|e| format!("<unencodable: {e}>"));
        if event.is_error() {
            error!(target: "lightswarm::journal", session = %self.session, event = event.name(), %record);
        } else {
            debug!(target: "lightswarm::journal", session = %self.session, event = event.name(), %record);
        }
    }

    fn rotate(&mut self) -> Result<(), JournalError> {
        self.session = Uuid::new_v4();
        info!(target: "lightswarm::journal", session = %self.session, "journal session rotated");
        Ok(())
    }
}

/// Journal en mémoire partagé : les clones voient les mêmes événements
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SwarmEvent>>>,
    rotations: Arc<Mutex<u32>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SwarmEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }

    pub fn rotations(&self) -> u32 {
        *self.rotations.lock()
    }
}

impl LogSink for MemorySink {
    fn emit(&mut self, event: &SwarmEvent) {
        self.events.lock().push(event.clone());
    }

    fn rotate(&mut self) -> Result<(), JournalError> {
        *self.rotations.lock() += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(raw: u8, slot: usize) -> SwarmEvent {
        SwarmEvent::MemberJoined {
            member: MemberId::new(raw).unwrap(),
            slot,
        }
    }

    #[test]
    fn test_file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlFileSink::open(dir.path()).unwrap();
        sink.emit(&joined(42, 0));
        sink.emit(&SwarmEvent::SwarmReset { cleared_members: 3 });

        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "member_joined");
        assert_eq!(lines[0]["member"], 42);
        assert_eq!(lines[0]["session"], sink.session().to_string());
        assert!(lines[0]["timestamp"].is_string());
        assert_eq!(lines[1]["event"], "swarm_reset");
    }

    #[test]
    fn test_rotation_creates_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonlFileSink::open(dir.path()).unwrap();
        let first = sink.path().to_path_buf();
        let first_session = sink.session();
        sink.emit(&joined(1, 0));

        sink.rotate().unwrap();
        sink.emit(&joined(2, 1));

        assert_ne!(sink.path(), first.as_path());
        assert_ne!(sink.session(), first_session);
        let name = sink.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("logfile_") && name.ends_with(".jsonl"), "{name}");
        assert_eq!(std::fs::read_to_string(&first).unwrap().lines().count(), 1);
        assert_eq!(std::fs::read_to_string(sink.path()).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_memory_sink_shared_between_clones() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.emit(&joined(3, 2));
        writer.rotate().unwrap();
        assert_eq!(sink.count("member_joined"), 1);
        assert_eq!(sink.rotations(), 1);
    }

    #[test]
    fn test_error_events_flagged() {
        let dropped = SwarmEvent::PacketDropped {
            reason: "bad_length",
            detail: "9 bytes".into(),
            length: 9,
            raw_id: Some(9),
            source: "10.0.0.9:2910".parse().unwrap(),
        };
        assert!(dropped.is_error());
        assert!(!joined(1, 0).is_error());
        let json = serde_json::to_value(&dropped).unwrap();
        assert_eq!(json["event"], "packet_dropped");
        assert_eq!(json["source"], "10.0.0.9:2910");
        assert_eq!(json["raw_id"], 9);
    }
}
