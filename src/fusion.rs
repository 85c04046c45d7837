//! Multi-sensor fusion
//!
//! [`fuse`] is a pure function over the latest per-location readings: no
//! state, no I/O, deterministic output. The alarm policy is quorum-based
//! (`min_sources` independent triggers) with a single-source override for
//! the designated priority source (gas by default) - a smoldering fire can
//! reach dangerous CO levels before anything else trips.

use crate::thermal::ThermalGrid;
use serde::{Deserialize, Serialize};

/// Independent sensing modalities feeding fusion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Thermal,
    Gas,
    Flame,
    Vision,
}

/// Per-source confidence weights
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceWeights {
    pub thermal: f64,
    pub gas: f64,
    pub flame: f64,
    pub vision: f64,
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            thermal: 0.4,
            gas: 0.5,
            flame: 0.3,
            vision: 0.2,
        }
    }
}

impl SourceWeights {
    fn get(&self, kind: SourceKind) -> f64 {
        match kind {
            SourceKind::Thermal => self.thermal,
            SourceKind::Gas => self.gas,
            SourceKind::Flame => self.flame,
            SourceKind::Vision => self.vision,
        }
    }
}

/// ADC channel semantics: which channel feeds which modality
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelMap {
    pub gas: String,
    pub flame: String,
    pub vision: String,
    /// Linear conversion from gas ADC counts to ppm
    pub gas_ppm_per_count: f64,
}

impl Default for ChannelMap {
    fn default() -> Self {
        Self {
            gas: "ADC1".to_string(),
            flame: "ADC2".to_string(),
            vision: "ADC3".to_string(),
            gas_ppm_per_count: 1.0,
        }
    }
}

/// Fusion configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FusionConfig {
    /// Grid cells above this temperature are hot
    pub temperature_threshold_c: f64,
    pub gas_ppm_threshold: f64,
    /// Vision score in [0,1] at or above which vision triggers
    pub vision_threshold: f64,
    /// Quorum: alarm when at least this many sources trigger
    pub min_sources: usize,
    /// This source alone raises the alarm regardless of the quorum
    pub priority_source: SourceKind,
    pub weights: SourceWeights,
    pub channels: ChannelMap,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            temperature_threshold_c: 40.0,
            gas_ppm_threshold: 500.0,
            vision_threshold: 0.5,
            min_sources: 2,
            priority_source: SourceKind::Gas,
            weights: SourceWeights::default(),
            channels: ChannelMap::default(),
        }
    }
}

/// Latest known readings for one logical location
///
/// Each field is independently optional and independently updated as
/// readings arrive (last value wins per field; modalities arrive in any
/// relative order).
#[derive(Debug, Clone, Default)]
pub struct FusionInput {
    pub thermal_hot_cells: Vec<(usize, usize)>,
    pub gas_ppm: Option<f64>,
    pub flame: Option<bool>,
    pub vision_score: Option<f64>,
}

/// One fusion decision; produced fresh on every invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusionResult {
    pub alarm: bool,
    /// Weighted sum of triggered sources, clamped to [0,1]
    pub confidence: f64,
    /// Every source that triggered, in fixed thermal/gas/flame/vision order
    pub contributing_sources: Vec<SourceKind>,
    /// Hot grid coordinates in row-major scan order
    pub hot_cells: Vec<(usize, usize)>,
}

/// Extract all cells above `threshold`, in row-major scan order
pub fn hot_cells(grid: &ThermalGrid, threshold: f64) -> Vec<(usize, usize)> {
    grid.iter_cells()
        .filter(|&(_, _, c)| c > threshold)
        .map(|(r, c, _)| (r, c))
        .collect()
}

/// Combine the latest per-modality readings into an alarm decision
pub fn fuse(input: &FusionInput, config: &FusionConfig) -> FusionResult {
    let mut contributing = Vec::new();

    if !input.thermal_hot_cells.is_empty() {
        contributing.push(SourceKind::Thermal);
    }
    if input.gas_ppm.is_some_and(|ppm| ppm > config.gas_ppm_threshold) {
        contributing.push(SourceKind::Gas);
    }
    if input.flame == Some(true) {
        contributing.push(SourceKind::Flame);
    }
    if input
        .vision_score
        .is_some_and(|score| score >= config.vision_threshold)
    {
        contributing.push(SourceKind::Vision);
    }

    let quorum = contributing.len() >= config.min_sources;
    let priority = contributing.contains(&config.priority_source);
    let alarm = quorum || priority;

    let confidence = contributing
        .iter()
        .map(|&kind| config.weights.get(kind))
        .sum::<f64>()
        .clamp(0.0, 1.0);

    FusionResult {
        alarm,
        confidence,
        contributing_sources: contributing,
        hot_cells: input.thermal_hot_cells.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GRID_CELLS, GRID_COLS};
    use crate::thermal::Provenance;

    fn config() -> FusionConfig {
        FusionConfig::default()
    }

    fn input_with(sources: &[SourceKind]) -> FusionInput {
        let mut input = FusionInput::default();
        for s in sources {
            match s {
                SourceKind::Thermal => input.thermal_hot_cells = vec![(0, 0)],
                SourceKind::Gas => input.gas_ppm = Some(1000.0),
                SourceKind::Flame => input.flame = Some(true),
                SourceKind::Vision => input.vision_score = Some(0.9),
            }
        }
        input
    }

    #[test]
    fn test_all_absent_is_quiet() {
        let result = fuse(&FusionInput::default(), &config());
        assert!(!result.alarm);
        assert_eq!(result.confidence, 0.0);
        assert!(result.contributing_sources.is_empty());
        assert!(result.hot_cells.is_empty());
    }

    #[test]
    fn test_single_non_priority_source_below_quorum() {
        for kind in [SourceKind::Thermal, SourceKind::Flame, SourceKind::Vision] {
            let result = fuse(&input_with(&[kind]), &config());
            assert!(!result.alarm, "{:?} alone must not alarm", kind);
            assert_eq!(result.contributing_sources, vec![kind]);
            assert!(result.confidence > 0.0);
        }
    }

    #[test]
    fn test_any_two_sources_alarm() {
        let pairs = [
            [SourceKind::Thermal, SourceKind::Flame],
            [SourceKind::Thermal, SourceKind::Vision],
            [SourceKind::Flame, SourceKind::Vision],
            [SourceKind::Thermal, SourceKind::Gas],
        ];
        for pair in pairs {
            let result = fuse(&input_with(&pair), &config());
            assert!(result.alarm, "{:?} must alarm", pair);
            assert_eq!(result.contributing_sources.len(), 2);
        }
    }

    #[test]
    fn test_gas_priority_override() {
        // 600 ppm over a 500 ppm threshold, nothing else firing
        let input = FusionInput {
            gas_ppm: Some(600.0),
            ..FusionInput::default()
        };
        let result = fuse(&input, &config());
        assert!(result.alarm);
        assert_eq!(result.contributing_sources, vec![SourceKind::Gas]);
        assert!(result.confidence > 0.0);
    }

    #[test]
    fn test_priority_override_ignores_min_sources() {
        let high_quorum = FusionConfig {
            min_sources: 4,
            ..config()
        };
        let result = fuse(&input_with(&[SourceKind::Gas]), &high_quorum);
        assert!(result.alarm);

        // A non-priority source still respects the quorum
        let result = fuse(&input_with(&[SourceKind::Flame]), &high_quorum);
        assert!(!result.alarm);
    }

    #[test]
    fn test_gas_below_threshold_does_not_trigger() {
        let input = FusionInput {
            gas_ppm: Some(499.9),
            ..FusionInput::default()
        };
        let result = fuse(&input, &config());
        assert!(!result.alarm);
        assert!(result.contributing_sources.is_empty());
    }

    #[test]
    fn test_all_sources_listed_no_suppression() {
        let all = [
            SourceKind::Thermal,
            SourceKind::Gas,
            SourceKind::Flame,
            SourceKind::Vision,
        ];
        let result = fuse(&input_with(&all), &config());
        assert!(result.alarm);
        assert_eq!(result.contributing_sources, all.to_vec());
    }

    #[test]
    fn test_confidence_clamped_to_one() {
        let result = fuse(
            &input_with(&[
                SourceKind::Thermal,
                SourceKind::Gas,
                SourceKind::Flame,
                SourceKind::Vision,
            ]),
            &config(),
        );
        // Default weights sum to 1.4
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_confidence_is_weighted_sum() {
        let result = fuse(&input_with(&[SourceKind::Thermal, SourceKind::Flame]), &config());
        assert!((result.confidence - 0.7).abs() < 1e-12);
    }

    #[test]
    fn test_hot_cells_row_major_and_idempotent() {
        let mut cells = vec![0i16; GRID_CELLS];
        // 45C at (0,5), (2,1), (2,0) with scale 1.0
        cells[5] = 45;
        cells[2 * GRID_COLS + 1] = 45;
        cells[2 * GRID_COLS] = 45;
        let grid = ThermalGrid::from_raw(1, &cells, 1.0, 0.0, Provenance::Embedded);

        let first = hot_cells(&grid, 40.0);
        assert_eq!(first, vec![(0, 5), (2, 0), (2, 1)]);

        // Re-running on the unchanged grid yields the identical list
        let second = hot_cells(&grid, 40.0);
        assert_eq!(first, second);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let cells = vec![40i16; GRID_CELLS];
        let grid = ThermalGrid::from_raw(1, &cells, 1.0, 0.0, Provenance::Embedded);
        assert!(hot_cells(&grid, 40.0).is_empty());
        assert_eq!(hot_cells(&grid, 39.9).len(), GRID_CELLS);
    }

    #[test]
    fn test_vision_threshold_is_inclusive() {
        let input = FusionInput {
            vision_score: Some(0.5),
            ..FusionInput::default()
        };
        let result = fuse(&input, &config());
        assert_eq!(result.contributing_sources, vec![SourceKind::Vision]);
    }
}
