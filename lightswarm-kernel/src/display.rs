/**
 * AFFICHEURS - Planification asynchrone des rafraîchissements
 *
 * RÔLE :
 * Reçoit les demandes "afficher V sur la surface S" du coordinateur et les
 * exécute hors de la boucle de réception.
 *
 * FONCTIONNEMENT :
 * - Une tâche worker dédiée par surface (identifiant maître, barre d'activité)
 * - Chaque rendu terminé renvoie une RefreshCompletion au coordinateur
 * - Le rendu physique est délégué : log seul par défaut, ou commande externe
 *   configurée (ex: "seven-seg --value {value}")
 * - Témoin "armé" allumé pendant une durée fixe sur sa propre tâche
 *
 * Le coordinateur garde la porte "un seul rafraîchissement en vol par surface" ;
 * ce module ne fait qu'exécuter.
 */

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplaySurface {
    /// Afficheur 7 segments : identifiant du maître
    MasterId,
    /// Barre de LEDs : niveau d'activité de l'essaim
    ActivityBar,
}

impl DisplaySurface {
    pub const ALL: [DisplaySurface; 2] = [DisplaySurface::MasterId, DisplaySurface::ActivityBar];

    pub fn index(self) -> usize {
        match self {
            DisplaySurface::MasterId => 0,
            DisplaySurface::ActivityBar => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DisplaySurface::MasterId => "master_id",
            DisplaySurface::ActivityBar => "activity_bar",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshCompletion {
    pub surface: DisplaySurface,
    pub value: u32,
    pub ok: bool,
}

/// Frontière coordinateur → afficheurs (fire-and-forget)
pub trait DisplayScheduler: Send + Sync {
    fn request_refresh(&self, surface: DisplaySurface, value: u32);
    fn arm_indicator(&self, duration: Duration);
}

/// Niveau de la barre d'activité : moyenne / échelle, borné au dernier niveau
pub fn activity_level(average: f64, scale: f64, levels: u32) -> u32 {
    if !average.is_finite() || average <= 0.0 || scale <= 0.0 {
        return 0;
    }
    let top = levels.saturating_sub(1);
    let bucket = (average / scale).floor();
    if bucket >= f64::from(top) {
        top
    } else {
        bucket as u32
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("invalid command template {template:?}: {reason}")]
    Template { template: String, reason: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}")]
    CommandFailed { program: String, status: std::process::ExitStatus },
}

/// Découpe un template façon shell puis remplace {surface}, {value} et {state}
/// argument par argument (une valeur ne peut pas injecter d'arguments).
pub fn render_args(
    template: &str,
    surface: &str,
    value: &str,
    state: &str,
) -> Result<Vec<String>, RenderError> {
    let words = shell_words::split(template).map_err(|e| RenderError::Template {
        template: template.to_string(),
        reason: e.to_string(),
    })?;
    if words.is_empty() {
        return Err(RenderError::Template {
            template: template.to_string(),
            reason: "empty command".into(),
        });
    }
    Ok(words
        .into_iter()
        .map(|w| {
            w.replace("{surface}", surface)
                .replace("{value}", value)
                .replace("{state}", state)
        })
        .collect())
}

#[derive(Debug, Clone, Default)]
pub struct Renderer {
    /// Durée d'un cycle d'affichage quand aucun périphérique n'est branché
    pub hold: Duration,
    pub master_command: Option<String>,
    pub activity_command: Option<String>,
    pub indicator_command: Option<String>,
}

impl Renderer {
    fn command_for(&self, surface: DisplaySurface) -> Option<&str> {
        match surface {
            DisplaySurface::MasterId => self.master_command.as_deref(),
            DisplaySurface::ActivityBar => self.activity_command.as_deref(),
        }
    }

    pub async fn render(&self, surface: DisplaySurface, value: u32) -> Result<(), RenderError> {
        match self.command_for(surface) {
            Some(template) => {
                let args = render_args(template, surface.name(), &value.to_string(), "on")?;
                run_command(args).await
            }
            None => {
                info!(surface = surface.name(), value, "display refreshed");
                tokio::time::sleep(self.hold).await;
                Ok(())
            }
        }
    }

    pub async fn indicator(&self, on: bool) -> Result<(), RenderError> {
        let state = if on { "on" } else { "off" };
        match self.indicator_command.as_deref() {
            Some(template) => run_command(render_args(template, "indicator", "", state)?).await,
            None => {
                info!(state, "armed indicator");
                Ok(())
            }
        }
    }
}

async fn run_command(args: Vec<String>) -> Result<(), RenderError> {
    let (program, rest) = args.split_first().ok_or_else(|| RenderError::Template {
        template: String::new(),
        reason: "empty command".into(),
    })?;
    let status = tokio::process::Command::new(program)
        .args(rest)
        .status()
        .await
        .map_err(|source| RenderError::Spawn {
            program: program.clone(),
            source,
        })?;
    if !status.success() {
        return Err(RenderError::CommandFailed {
            program: program.clone(),
            status,
        });
    }
    debug!(program = %program, "render command completed");
    Ok(())
}

/// Implémentation réelle : un worker tokio par surface
pub struct SurfaceWorkers {
    senders: [mpsc::UnboundedSender<u32>; 2],
    renderer: Arc<Renderer>,
}

impl SurfaceWorkers {
    /// Démarre les workers ; doit être appelé depuis un runtime tokio
    pub fn spawn(renderer: Arc<Renderer>, completions: mpsc::UnboundedSender<RefreshCompletion>) -> Self {
        let senders = DisplaySurface::ALL.map(|surface| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(surface_worker(surface, rx, renderer.clone(), completions.clone()));
            tx
        });
        Self { senders, renderer }
    }
}

impl DisplayScheduler for SurfaceWorkers {
    fn request_refresh(&self, surface: DisplaySurface, value: u32) {
        if self.senders[surface.index()].send(value).is_err() {
            warn!(surface = surface.name(), "display worker stopped, refresh dropped");
        }
    }

    fn arm_indicator(&self, duration: Duration) {
        let renderer = self.renderer.clone();
        tokio::spawn(async move {
            if let Err(e) = renderer.indicator(true).await {
                warn!("armed indicator on failed: {e}");
            }
            tokio::time::sleep(duration).await;
            if let Err(e) = renderer.indicator(false).await {
                warn!("armed indicator off failed: {e}");
            }
        });
    }
}

async fn surface_worker(
    surface: DisplaySurface,
    mut requests: mpsc::UnboundedReceiver<u32>,
    renderer: Arc<Renderer>,
    completions: mpsc::UnboundedSender<RefreshCompletion>,
) {
    while let Some(value) = requests.recv().await {
        let result = renderer.render(surface, value).await;
        if let Err(e) = &result {
            warn!(surface = surface.name(), value, "display refresh failed: {e}");
        }
        let done = RefreshCompletion {
            surface,
            value,
            ok: result.is_ok(),
        };
        if completions.send(done).is_err() {
            break;
        }
    }
    debug!(surface = surface.name(), "display worker stopped");
}
