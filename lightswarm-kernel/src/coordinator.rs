/**
 * COORDINATEUR - Machine d'état de l'essaim LightSwarm
 *
 * RÔLE :
 * Propriétaire unique de tout l'état de l'essaim : roster, statistiques,
 * maître courant, portes des afficheurs. Reçoit les datagrammes décodés et
 * décide quoi afficher, quoi journaliser et quoi émettre.
 *
 * FONCTIONNEMENT :
 * - LIGHT_UPDATE : présence du membre, journal, rien d'autre
 * - LOG_TO_SERVER : nouveau maître, échantillon dans les stats, rafraîchissement
 *   des deux surfaces (identifiant du maître + barre d'activité)
 * - Autres types valides : réception journalisée seulement
 * - Trame invalide : exactement un événement PacketDropped
 * - Reset : RESET_SWARM diffusé, témoin armé, rotation du journal, compteurs remis à zéro
 *
 * PORTES D'AFFICHAGE :
 * Une seule demande en vol par surface. Pendant un rendu, la dernière valeur
 * reçue écrase la précédente dans une cellule unique ; elle part à la
 * complétion. Les valeurs intermédiaires sont perdues.
 *
 * UTILITÉ :
 * 🎯 Tout est synchrone ici : le runtime appelle, envoie les trames retournées
 * 🎯 Testable sans réseau ni afficheur (DisplayScheduler et LogSink injectés)
 */

use crate::display::{activity_level, DisplayScheduler, DisplaySurface};
use crate::journal::{LogSink, SwarmEvent};
use crate::protocol::{LightReport, LogReport, MemberId, Packet};
use crate::roster::{Resolution, Roster, SlotStatus};
use crate::stats::{RunningAverage, StatsEngine, StatsSettings};
use serde::Serialize;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Version de protocole annoncée dans BLINK_BRIGHT_LED
pub const PROTOCOL_VERSION: u8 = 7;

#[derive(Debug, Clone)]
pub struct SwarmSettings {
    /// Identifiant de ce coordinateur dans l'en-tête des trames diffusées
    pub node_id: MemberId,
    /// IPv4 annoncée aux membres par DEFINE_SERVER_LOGGER
    pub advertise: Ipv4Addr,
    pub protocol_version: u8,
    pub stats: StatsSettings,
    pub activity_scale: f64,
    pub activity_levels: u32,
    pub armed_indicator: Duration,
}

impl SwarmSettings {
    pub fn new(node_id: MemberId, advertise: Ipv4Addr) -> Self {
        Self {
            node_id,
            advertise,
            protocol_version: PROTOCOL_VERSION,
            stats: StatsSettings::default(),
            activity_scale: 145.0,
            activity_levels: 8,
            armed_indicator: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    Idle,
    AwaitingDisplayRefresh,
    ResetInProgress,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MasterState {
    pub master_slot: Option<usize>,
    pub master_id: Option<MemberId>,
    pub master_value: i32,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficCounters {
    pub received: u64,
    pub dropped: u64,
    pub light_updates: u64,
    pub log_reports: u64,
    pub other_packets: u64,
    pub joins: u64,
    pub evictions: u64,
    pub refreshes_dispatched: u64,
    pub refreshes_coalesced: u64,
    pub resets: u64,
    pub sent: u64,
    pub send_failures: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct SurfaceGate {
    in_flight: bool,
    pending: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberView {
    pub slot: usize,
    pub status: SlotStatus,
    pub external_id: u8,
    pub activity_counter: u32,
    pub last_seen_secs_ago: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SurfaceView {
    pub surface: DisplaySurface,
    pub in_flight: bool,
    pub pending: Option<u32>,
}

/// Vue immuable publiée après chaque événement
#[derive(Debug, Clone, Serialize)]
pub struct SwarmSnapshot {
    pub node_id: MemberId,
    pub state: CoordinatorState,
    pub master: MasterState,
    pub average: RunningAverage,
    pub activity_level: u32,
    pub members: Vec<MemberView>,
    pub avg_values: Vec<f64>,
    pub slices: usize,
    pub pending_samples: usize,
    pub surfaces: Vec<SurfaceView>,
    pub counters: TrafficCounters,
    pub uptime_secs: u64,
}

impl SwarmSnapshot {
    pub fn members_present(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.status == SlotStatus::Present)
            .count()
    }
}

pub struct SwarmCoordinator {
    settings: SwarmSettings,
    roster: Roster,
    stats: StatsEngine,
    master: MasterState,
    state: CoordinatorState,
    gates: [SurfaceGate; 2],
    display: Arc<dyn DisplayScheduler>,
    journal: Box<dyn LogSink>,
    counters: TrafficCounters,
    started_at: Instant,
}

impl SwarmCoordinator {
    pub fn new(
        settings: SwarmSettings,
        display: Arc<dyn DisplayScheduler>,
        journal: Box<dyn LogSink>,
        started_at: Instant,
    ) -> Self {
        Self {
            stats: StatsEngine::new(settings.stats),
            settings,
            roster: Roster::new(),
            master: MasterState::default(),
            state: CoordinatorState::Idle,
            gates: [SurfaceGate::default(); 2],
            display,
            journal,
            counters: TrafficCounters::default(),
            started_at,
        }
    }

    pub fn record_startup(&mut self, bind: SocketAddr) {
        info!(node_id = %self.settings.node_id, %bind, advertise = %self.settings.advertise, "coordinator started");
        self.emit(SwarmEvent::KernelStarted {
            node_id: self.settings.node_id,
            bind,
            advertise: self.settings.advertise,
        });
    }

    /// Point d'entrée de chaque datagramme reçu
    pub fn handle_datagram(&mut self, bytes: &[u8], source: SocketAddr, now: Instant) {
        self.counters.received += 1;
        match Packet::decode(bytes) {
            Ok(packet) => self.handle_packet(packet, source, now),
            Err(e) => {
                self.counters.dropped += 1;
                // octet d'identifiant brut, même si la trame est rejetée
                let raw_id = bytes.get(2).copied();
                error!(%source, length = bytes.len(), ?raw_id, reason = e.reason(), "dropped packet: {e}");
                self.emit(SwarmEvent::PacketDropped {
                    reason: e.reason(),
                    detail: e.to_string(),
                    length: bytes.len(),
                    raw_id,
                    source,
                });
            }
        }
    }

    pub fn handle_packet(&mut self, packet: Packet, source: SocketAddr, now: Instant) {
        match packet {
            Packet::LightUpdate { member, report } => self.handle_light_update(member, report, source, now),
            Packet::LogToServer { member, report, .. } => self.handle_log_report(member, report, now),
            other => {
                self.counters.other_packets += 1;
                debug!(kind = %other.kind(), member = %other.member(), %source, "packet received");
                self.emit(SwarmEvent::PacketReceived {
                    kind: other.kind(),
                    member: other.member(),
                    source,
                });
            }
        }
    }

    fn handle_light_update(&mut self, member: MemberId, report: LightReport, source: SocketAddr, now: Instant) {
        self.counters.light_updates += 1;
        let slot = self.resolve(member, now);
        self.roster.mark_presence(slot, now);
        debug!(%member, slot, clear = report.clear, is_master = report.is_master, "light update");
        self.emit(SwarmEvent::LightUpdate {
            member,
            slot,
            source,
            is_master: report.is_master,
            clear: report.clear,
        });
    }

    fn handle_log_report(&mut self, member: MemberId, report: LogReport, now: Instant) {
        self.counters.log_reports += 1;
        let slot = self.resolve(member, now);
        let value = report.sample();

        self.master = MasterState {
            master_slot: Some(slot),
            master_id: Some(member),
            master_value: value,
            version: self.master.version + 1,
        };

        let average = self.stats.record_sample(value);
        self.close_slice(now);
        self.stats.buffer_sample(value);
        let activity = self.roster.mark_log_activity(slot);

        info!(%member, slot, value, activity, average, "master report");
        self.emit(SwarmEvent::MasterReport {
            member,
            slot,
            value,
            version: self.master.version,
            activity,
            average,
            records: report.records().to_vec(),
        });

        self.refresh(DisplaySurface::MasterId, u32::from(member.get()));
        let level = activity_level(average, self.settings.activity_scale, self.settings.activity_levels);
        self.refresh(DisplaySurface::ActivityBar, level);
    }

    fn resolve(&mut self, member: MemberId, now: Instant) -> usize {
        match self.roster.resolve_slot(member, now) {
            Resolution::Existing(slot) => slot,
            Resolution::Claimed(slot) => {
                self.counters.joins += 1;
                info!(%member, slot, "member joined");
                self.emit(SwarmEvent::MemberJoined { member, slot });
                slot
            }
            Resolution::Evicted { slot, previous } => {
                self.counters.evictions += 1;
                info!(%member, slot, %previous, "roster full, evicted least recently seen member");
                self.emit(SwarmEvent::MemberEvicted { member, slot, previous });
                slot
            }
        }
    }

    fn close_slice(&mut self, now: Instant) {
        if self.stats.close_slice_if_due(now, self.started_at) {
            debug!(slices = self.stats.slice_count(), "time slice closed");
            self.emit(SwarmEvent::SliceClosed {
                slices: self.stats.slice_count(),
                avg_values: self.stats.avg_values().to_vec(),
            });
        }
    }

    fn refresh(&mut self, surface: DisplaySurface, value: u32) {
        let gate = &mut self.gates[surface.index()];
        if gate.in_flight {
            gate.pending = Some(value);
            self.counters.refreshes_coalesced += 1;
            debug!(surface = surface.name(), value, "refresh in flight, value pending");
        } else {
            gate.in_flight = true;
            self.dispatch(surface, value);
        }
        self.settle_state();
    }

    fn dispatch(&mut self, surface: DisplaySurface, value: u32) {
        self.counters.refreshes_dispatched += 1;
        self.display.request_refresh(surface, value);
        self.emit(SwarmEvent::RefreshDispatched { surface, value });
    }

    /// Le worker de `surface` a terminé son rendu
    pub fn on_refresh_complete(&mut self, surface: DisplaySurface) {
        if surface == DisplaySurface::ActivityBar {
            self.stats.reset_average_cycle();
        }
        let gate = &mut self.gates[surface.index()];
        match gate.pending.take() {
            Some(value) => self.dispatch(surface, value),
            None => gate.in_flight = false,
        }
        self.settle_state();
    }

    /// Reset demandé (bouton, signal, API) : retourne la trame RESET_SWARM à diffuser
    pub fn handle_reset(&mut self, _now: Instant) -> Packet {
        self.state = CoordinatorState::ResetInProgress;
        info!(node_id = %self.settings.node_id, "swarm reset requested");

        let packet = Packet::ResetSwarm {
            member: self.settings.node_id,
        };
        self.display.arm_indicator(self.settings.armed_indicator);
        if let Err(e) = self.journal.rotate() {
            warn!("journal rotation failed: {e}");
        }

        let cleared_members = self
            .roster
            .slots()
            .iter()
            .filter(|s| s.activity_counter > 0)
            .count();
        self.roster.reset_activity();
        self.stats.clear_pending();
        self.counters.resets += 1;
        self.emit(SwarmEvent::SwarmReset { cleared_members });

        self.state = CoordinatorState::Idle;
        self.settle_state();
        packet
    }

    /// DEFINE_SERVER_LOGGER : indique aux membres où envoyer leurs logs
    pub fn announce(&self) -> Packet {
        Packet::DefineServerLogger {
            member: self.settings.node_id,
            server: self.settings.advertise,
        }
    }

    pub fn blink_member(&self, member: MemberId, seconds: f32) -> Packet {
        Packet::blink(member, self.settings.protocol_version, seconds)
    }

    pub fn reset_member(&self, member: MemberId) -> Packet {
        Packet::ResetMe { member }
    }

    /// Résultat de l'envoi d'une trame produite par le coordinateur
    pub fn record_sent(&mut self, packet: &Packet, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => {
                self.counters.sent += 1;
                debug!(kind = %packet.kind(), member = %packet.member(), "packet sent");
                self.emit(SwarmEvent::PacketSent {
                    kind: packet.kind(),
                    member: packet.member(),
                });
            }
            Err(detail) => {
                self.counters.send_failures += 1;
                warn!(kind = %packet.kind(), member = %packet.member(), "send failed: {detail}");
                self.emit(SwarmEvent::SendFailed {
                    kind: packet.kind(),
                    member: packet.member(),
                    detail,
                });
            }
        }
    }

    /// Fenêtres de temps sans trafic : fermeture de tranche et plafond de l'historique
    pub fn tick(&mut self, now: Instant) {
        self.close_slice(now);
        if self.stats.trim_if_due(now, self.started_at) {
            debug!(slices = self.stats.slice_count(), "history trimmed");
        }
    }

    pub fn snapshot(&self, now: Instant) -> SwarmSnapshot {
        let members = self
            .roster
            .slots()
            .iter()
            .enumerate()
            .map(|(slot, s)| MemberView {
                slot,
                status: s.status,
                external_id: s.raw_id(),
                activity_counter: s.activity_counter,
                last_seen_secs_ago: s
                    .last_seen
                    .map(|seen| now.saturating_duration_since(seen).as_secs_f64()),
            })
            .collect();
        let surfaces = DisplaySurface::ALL
            .iter()
            .map(|surface| {
                let gate = self.gates[surface.index()];
                SurfaceView {
                    surface: *surface,
                    in_flight: gate.in_flight,
                    pending: gate.pending,
                }
            })
            .collect();

        SwarmSnapshot {
            node_id: self.settings.node_id,
            state: self.state,
            master: self.master,
            average: self.stats.average(),
            activity_level: activity_level(
                self.stats.current_average(),
                self.settings.activity_scale,
                self.settings.activity_levels,
            ),
            members,
            avg_values: self.stats.avg_values().to_vec(),
            slices: self.stats.slice_count(),
            pending_samples: self.stats.pending_samples().len(),
            surfaces,
            counters: self.counters,
            uptime_secs: now.saturating_duration_since(self.started_at).as_secs(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn master(&self) -> MasterState {
        self.master
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn stats(&self) -> &StatsEngine {
        &self.stats
    }

    pub fn counters(&self) -> TrafficCounters {
        self.counters
    }

    fn settle_state(&mut self) {
        if self.state == CoordinatorState::ResetInProgress {
            return;
        }
        self.state = if self.gates.iter().any(|g| g.in_flight) {
            CoordinatorState::AwaitingDisplayRefresh
        } else {
            CoordinatorState::Idle
        };
    }

    fn emit(&mut self, event: SwarmEvent) {
        self.journal.emit(&event);
    }
}
