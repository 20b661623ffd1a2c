/*!
Test Harness pour le kernel LightSwarm

Démarre la vraie boucle du kernel (run_kernel) sur un transport en mémoire :
- injection de trames comme si elles venaient de membres simulés
- afficheurs enregistrés, complétions pilotées par le test (ou automatiques)
- journal en mémoire pour assertions sur les événements
- accès aux snapshots publiés et aux diffusions du kernel
*/

use crate::member_sim::MemberSim;
use crate::memory_transport::{memory_transport, MemoryNetwork};
use anyhow::Result;
use lightswarm_kernel::coordinator::{SwarmCoordinator, SwarmSettings, SwarmSnapshot};
use lightswarm_kernel::display::{DisplayScheduler, DisplaySurface, RefreshCompletion};
use lightswarm_kernel::journal::{MemorySink, SwarmEvent};
use lightswarm_kernel::protocol::{MemberId, Packet, PacketType};
use lightswarm_kernel::runtime::{run_kernel, KernelChannels, OperatorCommand};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Afficheur qui note les demandes ; en mode auto, chaque demande est
/// immédiatement déclarée terminée.
pub struct RecordingDisplay {
    requests: Mutex<Vec<(DisplaySurface, u32)>>,
    armed: Mutex<Vec<Duration>>,
    completions: mpsc::UnboundedSender<RefreshCompletion>,
    auto_complete: bool,
}

impl RecordingDisplay {
    pub fn new(completions: mpsc::UnboundedSender<RefreshCompletion>, auto_complete: bool) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            armed: Mutex::new(Vec::new()),
            completions,
            auto_complete,
        }
    }

    pub fn requests(&self) -> Vec<(DisplaySurface, u32)> {
        self.requests.lock().clone()
    }

    pub fn values_for(&self, surface: DisplaySurface) -> Vec<u32> {
        self.requests
            .lock()
            .iter()
            .filter(|(s, _)| *s == surface)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn armed(&self) -> Vec<Duration> {
        self.armed.lock().clone()
    }

    pub fn complete(&self, surface: DisplaySurface) -> Result<()> {
        let value = self.values_for(surface).last().copied().unwrap_or(0);
        self.completions
            .send(RefreshCompletion { surface, value, ok: true })
            .map_err(|_| anyhow::anyhow!("kernel loop stopped"))
    }
}

impl DisplayScheduler for RecordingDisplay {
    fn request_refresh(&self, surface: DisplaySurface, value: u32) {
        self.requests.lock().push((surface, value));
        log::info!("🖥️ [MOCK] refresh {} = {}", surface.name(), value);
        if self.auto_complete {
            let _ = self.completions.send(RefreshCompletion { surface, value, ok: true });
        }
    }

    fn arm_indicator(&self, duration: Duration) {
        self.armed.lock().push(duration);
        log::info!("🔴 [MOCK] armed indicator for {:?}", duration);
    }
}

/// Harness de test complet : kernel réel, périphériques simulés
pub struct TestHarness {
    pub network: MemoryNetwork,
    pub display: Arc<RecordingDisplay>,
    pub journal: MemorySink,
    commands: mpsc::Sender<OperatorCommand>,
    snapshots: watch::Receiver<SwarmSnapshot>,
    shutdown: Option<oneshot::Sender<()>>,
    kernel: Option<JoinHandle<Result<()>>>,
}

pub const COORDINATOR_ID: u8 = 1;
pub const DEFAULT_TIMEOUT_MS: u64 = 2000;

impl TestHarness {
    /// Kernel avec réglages par défaut, complétions manuelles
    pub fn new() -> Self {
        let advertise = Ipv4Addr::new(192, 168, 1, COORDINATOR_ID);
        Self::with_settings(SwarmSettings::new(MemberId::MIN, advertise), false)
    }

    /// Doit être appelé depuis un runtime tokio
    pub fn with_settings(settings: SwarmSettings, auto_complete: bool) -> Self {
        env_logger::try_init().ok(); // Init logging pour tests

        let (transport, network) = memory_transport();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let display = Arc::new(RecordingDisplay::new(done_tx, auto_complete));
        let journal = MemorySink::new();

        let now = Instant::now();
        let coordinator = SwarmCoordinator::new(settings, display.clone(), Box::new(journal.clone()), now);
        let (snap_tx, snapshots) = watch::channel(coordinator.snapshot(now));
        let (commands, cmd_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let channels = KernelChannels {
            completions: done_rx,
            commands: cmd_rx,
            snapshots: snap_tx,
        };
        let kernel = tokio::spawn(run_kernel(
            transport,
            coordinator,
            channels,
            Duration::from_secs(3600),
            async move {
                let _ = stop_rx.await;
            },
        ));

        log::info!("🚀 LightSwarm kernel started in harness");
        Self {
            network,
            display,
            journal,
            commands,
            snapshots,
            shutdown: Some(stop_tx),
            kernel: Some(kernel),
        }
    }

    /// Simule un datagramme reçu d'une adresse quelconque
    pub fn inject(&self, bytes: Vec<u8>, source: SocketAddr) -> Result<()> {
        self.network.inject(bytes, source)
    }

    pub fn send_light_update(&self, member: &MemberSim) -> Result<()> {
        self.inject(member.light_update_bytes(), member.source_addr())
    }

    pub fn send_log_report(&self, member: &MemberSim) -> Result<()> {
        self.inject(member.log_report_bytes(Instant::now()), member.source_addr())
    }

    pub async fn command(&self, command: OperatorCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow::anyhow!("kernel loop stopped"))
    }

    pub fn complete_refresh(&self, surface: DisplaySurface) -> Result<()> {
        self.display.complete(surface)
    }

    pub fn snapshot(&self) -> SwarmSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn events(&self) -> Vec<SwarmEvent> {
        self.journal.events()
    }

    pub fn event_count(&self, name: &str) -> usize {
        self.journal.count(name)
    }

    /// Attend un snapshot satisfaisant `predicate`
    pub async fn wait_until<F>(&self, timeout_ms: u64, predicate: F) -> Result<SwarmSnapshot>
    where
        F: Fn(&SwarmSnapshot) -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            let snap = self.snapshot();
            if predicate(&snap) {
                return Ok(snap);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        log::warn!("⏰ Timeout waiting for swarm condition");
        anyhow::bail!("condition not reached within {timeout_ms}ms");
    }

    /// Attend qu'au moins `count` événements `name` soient journalisés
    pub async fn wait_for_events(&self, name: &str, count: usize, timeout_ms: u64) -> Result<()> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if self.journal.count(name) >= count {
                log::info!("✅ {} x{} journaled", name, count);
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!(
            "expected {count} '{name}' events, got {}",
            self.journal.count(name)
        );
    }

    /// Attend une diffusion du kernel d'un type donné
    pub async fn wait_for_sent(&self, kind: PacketType, timeout_ms: u64) -> Result<Packet> {
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if let Some(packet) = self.network.sent_packets().into_iter().find(|p| p.kind() == kind) {
                return Ok(packet);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        anyhow::bail!("no {kind} broadcast within {timeout_ms}ms");
    }

    /// Arrête la boucle du kernel et remonte son résultat
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(stop) = self.shutdown.take() {
            let _ = stop.send(());
        }
        match self.kernel.take() {
            Some(handle) => handle.await?,
            None => Ok(()),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        if let Some(stop) = self.shutdown.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_harness_announces_and_shuts_down() {
        let harness = TestHarness::new();
        let packet = harness
            .wait_for_sent(PacketType::DefineServerLogger, DEFAULT_TIMEOUT_MS)
            .await
            .unwrap();
        assert_eq!(
            packet,
            Packet::DefineServerLogger {
                member: MemberId::MIN,
                server: Ipv4Addr::new(192, 168, 1, COORDINATOR_ID),
            }
        );
        harness.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_auto_complete_returns_to_idle() {
        let settings = SwarmSettings::new(MemberId::MIN, Ipv4Addr::LOCALHOST);
        let harness = TestHarness::with_settings(settings, true);
        let member = MemberSim::new(MemberId::new(30).unwrap()).with_clear(400);
        harness.send_log_report(&member).unwrap();

        let snap = harness
            .wait_until(DEFAULT_TIMEOUT_MS, |s| {
                s.counters.log_reports == 1 && s.state == lightswarm_kernel::coordinator::CoordinatorState::Idle
            })
            .await
            .unwrap();
        assert_eq!(snap.master.master_id, MemberId::new(30));
        assert_eq!(snap.average.sum_count, 0);
        harness.shutdown().await.unwrap();
    }
}
