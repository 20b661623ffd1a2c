/**
 * LIGHTSWARM KERNEL - Coordinateur d'un essaim de capteurs lumineux
 *
 * RÔLE : Reçoit les trames UDP des membres, tient le roster, calcule les
 * statistiques et pilote les afficheurs (identifiant du maître, barre d'activité).
 *
 * ARCHITECTURE : protocol → coordinator → {roster, stats} → display / transport / journal.
 * Le runtime possède le coordinateur ; http et health lisent des snapshots.
 */

pub mod config;
pub mod coordinator;
pub mod display;
pub mod health;
pub mod http;
pub mod journal;
pub mod protocol;
pub mod roster;
pub mod runtime;
pub mod stats;
pub mod transport;
