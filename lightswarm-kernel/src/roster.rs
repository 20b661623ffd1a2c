/**
 * ROSTER - Table bornée des membres de l'essaim
 *
 * RÔLE :
 * Associe les identifiants externes des membres (octet 2 des trames) à des
 * slots internes stables, au nombre fixe de SWARM_SIZE.
 *
 * FONCTIONNEMENT :
 * - Membre connu : on retourne son slot et on rafraîchit last_seen
 * - Membre inconnu : premier slot libre (ordre d'index)
 * - Roster plein : éviction du slot présent le moins récemment actif,
 *   égalité départagée par le plus petit index
 *
 * INVARIANT : un identifiant non nul n'occupe jamais plus d'un slot.
 */

use crate::protocol::MemberId;
use serde::Serialize;
use std::time::Instant;

pub const SWARM_SIZE: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Unassigned,
    Present,
}

#[derive(Debug, Clone, Copy)]
pub struct MemberSlot {
    pub status: SlotStatus,
    pub last_seen: Option<Instant>,
    pub activity_counter: u32,
    pub external_id: Option<MemberId>,
}

impl MemberSlot {
    const fn unassigned() -> Self {
        Self {
            status: SlotStatus::Unassigned,
            last_seen: None,
            activity_counter: 0,
            external_id: None,
        }
    }

    /// Octet brut tel qu'envoyé sur le fil (0 = libre)
    pub fn raw_id(&self) -> u8 {
        self.external_id.map(MemberId::get).unwrap_or(0)
    }
}

/// Résultat d'une résolution de slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Existing(usize),
    Claimed(usize),
    /// Roster plein : `previous` a perdu son slot
    Evicted { slot: usize, previous: MemberId },
}

impl Resolution {
    pub fn slot(self) -> usize {
        match self {
            Resolution::Existing(slot) | Resolution::Claimed(slot) => slot,
            Resolution::Evicted { slot, .. } => slot,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Roster {
    slots: [MemberSlot; SWARM_SIZE],
}

impl Roster {
    pub fn new() -> Self {
        Self {
            slots: [MemberSlot::unassigned(); SWARM_SIZE],
        }
    }

    pub fn resolve_slot(&mut self, member: MemberId, now: Instant) -> Resolution {
        if let Some(slot) = self.find(member) {
            self.mark_presence(slot, now);
            return Resolution::Existing(slot);
        }

        if let Some(slot) = self.slots.iter().position(|s| s.status == SlotStatus::Unassigned) {
            self.assign(slot, member, now);
            return Resolution::Claimed(slot);
        }

        // Tous les slots sont présents ; comparaison stricte => le plus petit index gagne à égalité
        let mut slot = 0;
        for (i, candidate) in self.slots.iter().enumerate().skip(1) {
            if candidate.last_seen < self.slots[slot].last_seen {
                slot = i;
            }
        }
        let evicted = self.slots[slot].external_id;
        self.assign(slot, member, now);
        self.slots[slot].activity_counter = 0;

        match evicted {
            Some(previous) => Resolution::Evicted { slot, previous },
            None => Resolution::Claimed(slot),
        }
    }

    pub fn mark_log_activity(&mut self, slot: usize) -> u32 {
        let counter = &mut self.slots[slot].activity_counter;
        *counter = counter.saturating_add(1);
        *counter
    }

    pub fn mark_presence(&mut self, slot: usize, now: Instant) {
        let entry = &mut self.slots[slot];
        entry.status = SlotStatus::Present;
        entry.last_seen = Some(now);
    }

    pub fn reset_activity(&mut self) {
        for slot in &mut self.slots {
            slot.activity_counter = 0;
        }
    }

    pub fn find(&self, member: MemberId) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.status == SlotStatus::Present && s.external_id == Some(member))
    }

    pub fn slots(&self) -> &[MemberSlot] {
        &self.slots
    }

    pub fn slot(&self, slot: usize) -> Option<&MemberSlot> {
        self.slots.get(slot)
    }

    pub fn present_count(&self) -> usize {
        self.slots.iter().filter(|s| s.status == SlotStatus::Present).count()
    }

    fn assign(&mut self, slot: usize, member: MemberId, now: Instant) {
        let entry = &mut self.slots[slot];
        entry.external_id = Some(member);
        entry.status = SlotStatus::Present;
        entry.last_seen = Some(now);
    }
}

impl Default for Roster {
    fn default() -> Self {
        Self::new()
    }
}
