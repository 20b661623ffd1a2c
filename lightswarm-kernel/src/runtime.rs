/**
 * RUNTIME - Boucle principale du kernel LightSwarm
 *
 * RÔLE :
 * Une seule tâche possède le SwarmCoordinator et traite tout dans l'ordre
 * d'arrivée : datagrammes, complétions d'affichage, commandes opérateur,
 * tick d'1s, annonce DEFINE_SERVER_LOGGER périodique, arrêt.
 *
 * Après chaque événement, un SwarmSnapshot est publié sur un canal watch :
 * l'API HTTP et le health ne voient jamais l'état mutable.
 */

use crate::coordinator::{SwarmCoordinator, SwarmSnapshot};
use crate::display::RefreshCompletion;
use crate::protocol::{MemberId, Packet};
use crate::transport::{Transport, TransportError, MAX_DATAGRAM};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Commandes opérateur (API HTTP, signal)
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorCommand {
    ResetSwarm,
    ResetMember(MemberId),
    Blink { member: MemberId, seconds: f32 },
}

pub struct KernelChannels {
    pub completions: mpsc::UnboundedReceiver<RefreshCompletion>,
    pub commands: mpsc::Receiver<OperatorCommand>,
    pub snapshots: watch::Sender<SwarmSnapshot>,
}

pub async fn run_kernel<T, S>(
    transport: T,
    mut coordinator: SwarmCoordinator,
    channels: KernelChannels,
    announce_every: Duration,
    shutdown: S,
) -> anyhow::Result<()>
where
    T: Transport,
    S: Future<Output = ()>,
{
    let KernelChannels {
        mut completions,
        mut commands,
        snapshots,
    } = channels;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // premier tick immédiat : annonce au démarrage
    let mut announce = tokio::time::interval(announce_every);
    announce.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!("[kernel] swarm loop running");
    loop {
        tokio::select! {
            received = transport.recv(&mut buf) => match received {
                Ok((len, source)) => coordinator.handle_datagram(&buf[..len], source, Instant::now()),
                Err(TransportError::Closed) => {
                    warn!("[kernel] transport closed, stopping swarm loop");
                    break;
                }
                Err(e) => {
                    warn!("[kernel] {e}");
                    continue;
                }
            },
            Some(done) = completions.recv() => {
                debug!(surface = done.surface.name(), value = done.value, ok = done.ok, "refresh completed");
                coordinator.on_refresh_complete(done.surface);
            },
            Some(command) = commands.recv() => {
                let packet = match command {
                    OperatorCommand::ResetSwarm => coordinator.handle_reset(Instant::now()),
                    OperatorCommand::ResetMember(member) => coordinator.reset_member(member),
                    OperatorCommand::Blink { member, seconds } => coordinator.blink_member(member, seconds),
                };
                send_packet(&transport, &mut coordinator, packet).await;
            },
            _ = tick.tick() => coordinator.tick(Instant::now()),
            _ = announce.tick() => {
                let packet = coordinator.announce();
                send_packet(&transport, &mut coordinator, packet).await;
            },
            _ = &mut shutdown => {
                info!("[kernel] shutdown requested");
                break;
            },
        }
        snapshots.send_replace(coordinator.snapshot(Instant::now()));
    }
    Ok(())
}

async fn send_packet<T: Transport>(transport: &T, coordinator: &mut SwarmCoordinator, packet: Packet) {
    let outcome = transport
        .send_broadcast(&packet.encode())
        .await
        .map_err(|e| e.to_string());
    coordinator.record_sent(&packet, outcome);
}

/// SIGUSR1 remplace le bouton physique de reset
#[cfg(unix)]
pub fn spawn_reset_signal(commands: mpsc::Sender<OperatorCommand>) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    tokio::spawn(async move {
        while usr1.recv().await.is_some() {
            info!("[kernel] SIGUSR1 received, resetting swarm");
            if commands.send(OperatorCommand::ResetSwarm).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}

pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("[kernel] cannot listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}
