/*!
Membre d'essaim simulé

Reproduit le comportement d'un capteur ESP8266 LightSwarm :
- LIGHT_UPDATE avec sa valeur de luminosité (canal clair)
- table locale de 6 pairs, slot 0 = lui-même
- élection du maître : luminosité la plus forte parmi les pairs récents
- trame de log au format firmware (" i,maître,version,clair,état,id " joints par "|",
  terminée par le NUL de strcpy)
- réactions aux commandes du coordinateur (reset, serveur de log, clignotement)
*/

use lightswarm_kernel::protocol::{LightReport, MemberId, Packet, PacketType, SYNC_BYTE};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

pub const FIRMWARE_VERSION: u8 = 28;
pub const SWARM_SLOTS: usize = 6;
pub const SWARM_PORT: u16 = 2910;
/// Un pair silencieux depuis plus longtemps est ignoré pour l'élection
pub const PEER_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default)]
struct PeerSlot {
    id: u8,
    clear: u16,
    version: u8,
    is_master: bool,
    last_seen: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberReaction {
    Ignored,
    BecameMaster,
    ServerDefined(Ipv4Addr),
    Blink(Duration),
    PeerUpdated { slot: usize },
}

#[derive(Debug, Clone)]
pub struct MemberSim {
    id: MemberId,
    version: u8,
    clear: u16,
    is_master: bool,
    server: Option<Ipv4Addr>,
    peers: [PeerSlot; SWARM_SLOTS],
}

impl MemberSim {
    pub fn new(id: MemberId) -> Self {
        let mut peers = [PeerSlot::default(); SWARM_SLOTS];
        peers[0].id = id.get();
        peers[0].version = FIRMWARE_VERSION;
        Self {
            id,
            version: FIRMWARE_VERSION,
            clear: 0,
            is_master: true,
            server: None,
            peers,
        }
    }

    pub fn with_clear(mut self, clear: u16) -> Self {
        self.set_clear(clear);
        self
    }

    pub fn id(&self) -> MemberId {
        self.id
    }

    pub fn clear(&self) -> u16 {
        self.clear
    }

    pub fn set_clear(&mut self, clear: u16) {
        self.clear = clear;
        self.peers[0].clear = clear;
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn server(&self) -> Option<Ipv4Addr> {
        self.server
    }

    /// Adresse source plausible : le dernier octet de l'IP est l'identifiant
    pub fn source_addr(&self) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, self.id.get()], SWARM_PORT))
    }

    /// Le firmware n'envoie son log que s'il est maître et connaît le serveur
    pub fn should_log(&self) -> bool {
        self.is_master && self.server.is_some()
    }

    pub fn light_update(&self) -> Packet {
        Packet::LightUpdate {
            member: self.id,
            report: LightReport {
                is_master: self.is_master,
                version: self.version,
                clear: self.clear,
                ..LightReport::default()
            },
        }
    }

    pub fn light_update_bytes(&self) -> Vec<u8> {
        self.light_update().encode()
    }

    pub fn log_text(&self, now: Instant) -> String {
        let records: Vec<String> = self
            .peers
            .iter()
            .enumerate()
            .map(|(i, peer)| {
                let state = if i == 0 {
                    "PR"
                } else {
                    match peer.last_seen {
                        None => "NP",
                        Some(seen) if now.saturating_duration_since(seen) > PEER_TIMEOUT => "TO",
                        Some(_) => "PR",
                    }
                };
                format!(
                    " {},{},{},{},{},{} ",
                    i,
                    u8::from(peer.is_master || (i == 0 && self.is_master)),
                    peer.version,
                    peer.clear,
                    state,
                    peer.id
                )
            })
            .collect();
        records.join("|")
    }

    /// Trame de log octet pour octet comme le firmware (terminateur NUL)
    pub fn log_report_bytes(&self, now: Instant) -> Vec<u8> {
        let text = self.log_text(now);
        let mut out = Vec::with_capacity(text.len() + 6);
        // 6 enregistrements d'au plus 22 caractères : toujours < 256
        out.extend_from_slice(&[
            SYNC_BYTE,
            PacketType::LogToServer.code(),
            self.id.get(),
            text.len() as u8,
            self.version,
        ]);
        out.extend_from_slice(text.as_bytes());
        out.push(0x00);
        out
    }

    pub fn handle(&mut self, packet: &Packet, now: Instant) -> MemberReaction {
        match packet {
            Packet::LightUpdate { member, report } if *member != self.id => {
                let slot = self.peer_slot(member.get(), now);
                let peer = &mut self.peers[slot];
                peer.clear = report.clear;
                peer.version = report.version;
                peer.is_master = report.is_master;
                peer.last_seen = Some(now);
                log::debug!("member {} saw light update from {member}", self.id);
                MemberReaction::PeerUpdated { slot }
            }
            Packet::ResetSwarm { .. } => {
                self.is_master = true;
                MemberReaction::BecameMaster
            }
            Packet::ResetMe { member } if *member == self.id => {
                self.is_master = true;
                MemberReaction::BecameMaster
            }
            Packet::DefineServerLogger { server, .. } => {
                self.server = Some(*server);
                MemberReaction::ServerDefined(*server)
            }
            Packet::BlinkBrightLed { target, tenths, .. } if *target == self.id => {
                MemberReaction::Blink(Duration::from_millis(u64::from(*tenths) * 100))
            }
            _ => MemberReaction::Ignored,
        }
    }

    /// Maître si aucun pair récent n'a une luminosité plus forte
    pub fn check_master(&mut self, now: Instant) -> bool {
        for peer in self.peers.iter_mut().skip(1) {
            let stale = peer
                .last_seen
                .map_or(true, |seen| now.saturating_duration_since(seen) > PEER_TIMEOUT);
            if stale {
                peer.clear = 0;
            }
        }
        self.is_master = self.peers.iter().skip(1).all(|p| p.clear <= self.clear);
        self.peers[0].is_master = self.is_master;
        self.is_master
    }

    fn peer_slot(&mut self, raw: u8, now: Instant) -> usize {
        if let Some(slot) = self.peers.iter().position(|p| p.id == raw) {
            return slot;
        }
        if let Some(slot) = self.peers.iter().skip(1).position(|p| p.id == 0) {
            self.peers[slot + 1].id = raw;
            return slot + 1;
        }
        let mut oldest = 1;
        for i in 2..SWARM_SLOTS {
            if self.peers[i].last_seen.unwrap_or(now) < self.peers[oldest].last_seen.unwrap_or(now) {
                oldest = i;
            }
        }
        self.peers[oldest] = PeerSlot {
            id: raw,
            ..PeerSlot::default()
        };
        oldest
    }
}
