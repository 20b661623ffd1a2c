/**
 * STATISTIQUES - Moyenne glissante et historique par tranches de temps
 *
 * RÔLE :
 * Transforme le flux d'échantillons des trames de log en deux vues :
 * - moyenne courante du cycle d'affichage (remise à zéro après chaque rafraîchissement)
 * - historique des N dernières tranches de 4s avec leur moyenne
 *
 * FENÊTRES :
 * Une fenêtre se ferme la première fois que l'index floor((now - start) / fenêtre)
 * avance. Une boucle bloquée pendant la frontière ferme donc la tranche au
 * prochain appel au lieu de la rater.
 */

use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct StatsSettings {
    pub slice_window: Duration,
    pub max_slices: usize,
    pub trim_interval: Duration,
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            slice_window: Duration::from_secs(4),
            max_slices: 8,
            trim_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RunningAverage {
    pub sum_count: u64,
    pub current_average: f64,
}

#[derive(Debug, Clone)]
pub struct StatsEngine {
    settings: StatsSettings,
    average: RunningAverage,
    slices: VecDeque<Vec<i32>>,
    temp_slice: Vec<i32>,
    avg_values: Vec<f64>,
    last_window: u128,
    last_trim: u128,
}

fn window_index(now: Instant, start: Instant, window: Duration) -> u128 {
    let width = window.as_millis().max(1);
    now.saturating_duration_since(start).as_millis() / width
}

impl StatsEngine {
    pub fn new(settings: StatsSettings) -> Self {
        Self {
            settings,
            average: RunningAverage::default(),
            slices: VecDeque::with_capacity(settings.max_slices + 1),
            temp_slice: Vec::new(),
            avg_values: Vec::new(),
            last_window: 0,
            last_trim: 0,
        }
    }

    /// Moyenne incrémentale : (n·avg + value) / (n + 1)
    pub fn record_sample(&mut self, value: i32) -> f64 {
        let n = self.average.sum_count as f64;
        self.average.current_average = (n * self.average.current_average + f64::from(value)) / (n + 1.0);
        self.average.sum_count += 1;
        self.average.current_average
    }

    pub fn buffer_sample(&mut self, value: i32) {
        self.temp_slice.push(value);
    }

    /// Ferme la tranche en cours si une frontière de fenêtre a été franchie.
    /// Retourne true si une tranche a été ajoutée à l'historique.
    pub fn close_slice_if_due(&mut self, now: Instant, window_start: Instant) -> bool {
        let index = window_index(now, window_start, self.settings.slice_window);
        if index <= self.last_window {
            return false;
        }
        self.last_window = index;

        if self.temp_slice.is_empty() {
            return false;
        }
        self.slices.push_back(std::mem::take(&mut self.temp_slice));
        self.cap_history();
        self.recompute_averages();
        true
    }

    /// Plafond long terme de l'historique, toutes les `trim_interval` de uptime
    pub fn trim_if_due(&mut self, now: Instant, window_start: Instant) -> bool {
        let index = window_index(now, window_start, self.settings.trim_interval);
        if index <= self.last_trim {
            return false;
        }
        self.last_trim = index;
        if self.cap_history() {
            self.recompute_averages();
        }
        true
    }

    pub fn reset_average_cycle(&mut self) {
        self.average = RunningAverage::default();
    }

    /// Reset de l'essaim : on oublie la moyenne et la tranche non fermée
    pub fn clear_pending(&mut self) {
        self.reset_average_cycle();
        self.temp_slice.clear();
    }

    pub fn average(&self) -> RunningAverage {
        self.average
    }

    pub fn current_average(&self) -> f64 {
        self.average.current_average
    }

    pub fn slices(&self) -> impl Iterator<Item = &[i32]> {
        self.slices.iter().map(Vec::as_slice)
    }

    pub fn slice_count(&self) -> usize {
        self.slices.len()
    }

    pub fn avg_values(&self) -> &[f64] {
        &self.avg_values
    }

    pub fn pending_samples(&self) -> &[i32] {
        &self.temp_slice
    }

    fn cap_history(&mut self) -> bool {
        let mut dropped = false;
        while self.slices.len() > self.settings.max_slices {
            self.slices.pop_front();
            dropped = true;
        }
        dropped
    }

    fn recompute_averages(&mut self) {
        self.avg_values = self
            .slices
            .iter()
            .map(|slice| slice.iter().map(|v| f64::from(*v)).sum::<f64>() / slice.len() as f64)
            .collect();
    }
}

impl Default for StatsEngine {
    fn default() -> Self {
        Self::new(StatsSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn test_running_average_matches_mean() {
        let sequences: [&[i32]; 4] = [
            &[42],
            &[1, 2, 3, 4],
            &[1023, 0, 512, 700, 12, -5],
            &[i32::MAX, i32::MAX, i32::MIN],
        ];
        for samples in sequences {
            let mut stats = StatsEngine::default();
            for (k, value) in samples.iter().enumerate() {
                let avg = stats.record_sample(*value);
                let prefix = &samples[..=k];
                let mean = prefix.iter().map(|v| f64::from(*v)).sum::<f64>() / prefix.len() as f64;
                assert!((avg - mean).abs() <= EPS * mean.abs().max(1.0), "{avg} != {mean}");
            }
            assert_eq!(stats.average().sum_count, samples.len() as u64);

            stats.reset_average_cycle();
            assert_eq!(stats.current_average(), 0.0);
            assert_eq!(stats.average().sum_count, 0);
        }
    }

    #[test]
    fn test_history_bounded_and_oldest_dropped_first() {
        let start = Instant::now();
        let mut stats = StatsEngine::default();
        for i in 1..=20u64 {
            stats.buffer_sample(i as i32);
            let closed = stats.close_slice_if_due(start + Duration::from_secs(4 * i), start);
            assert!(closed);
            assert!(stats.slice_count() <= 8);
        }
        let retained: Vec<i32> = stats.slices().map(|s| s[0]).collect();
        assert_eq!(retained, (13..=20).collect::<Vec<_>>());
        assert_eq!(stats.avg_values(), &[13.0, 14.0, 15.0, 16.0, 17.0, 18.0, 19.0, 20.0]);
    }

    #[test]
    fn test_slice_closes_once_per_window() {
        let start = Instant::now();
        let mut stats = StatsEngine::default();
        stats.buffer_sample(10);
        stats.buffer_sample(20);
        assert!(!stats.close_slice_if_due(start + Duration::from_millis(3_999), start));

        assert!(stats.close_slice_if_due(start + Duration::from_millis(4_000), start));
        assert_eq!(stats.avg_values(), &[15.0]);

        stats.buffer_sample(30);
        assert!(!stats.close_slice_if_due(start + Duration::from_millis(4_500), start));
        assert_eq!(stats.pending_samples(), &[30]);
    }

    #[test]
    fn test_missed_boundary_still_closes() {
        let start = Instant::now();
        let mut stats = StatsEngine::default();
        stats.buffer_sample(7);
        // la boucle a été bloquée de 3.9s à 9.2s : la frontière de 4s et 8s est passée
        assert!(!stats.close_slice_if_due(start + Duration::from_millis(3_900), start));
        assert!(stats.close_slice_if_due(start + Duration::from_millis(9_200), start));
        assert_eq!(stats.slice_count(), 1);
    }

    #[test]
    fn test_empty_window_appends_nothing() {
        let start = Instant::now();
        let mut stats = StatsEngine::default();
        assert!(!stats.close_slice_if_due(start + Duration::from_secs(4), start));
        assert_eq!(stats.slice_count(), 0);
        assert!(stats.avg_values().is_empty());
    }

    #[test]
    fn test_trim_runs_every_interval() {
        let start = Instant::now();
        let settings = StatsSettings {
            max_slices: 3,
            ..StatsSettings::default()
        };
        let mut stats = StatsEngine::new(settings);
        assert!(!stats.trim_if_due(start + Duration::from_secs(29), start));
        assert!(stats.trim_if_due(start + Duration::from_secs(30), start));
        assert!(!stats.trim_if_due(start + Duration::from_secs(31), start));
        assert!(stats.trim_if_due(start + Duration::from_secs(75), start));
    }

    #[test]
    fn test_clear_pending_keeps_closed_history() {
        let start = Instant::now();
        let mut stats = StatsEngine::default();
        stats.buffer_sample(1);
        stats.close_slice_if_due(start + Duration::from_secs(4), start);
        stats.record_sample(100);
        stats.buffer_sample(2);

        stats.clear_pending();
        assert_eq!(stats.current_average(), 0.0);
        assert!(stats.pending_samples().is_empty());
        assert_eq!(stats.slice_count(), 1);
    }
}
