//! Streaming affect metrics over short and long sliding windows
//!
//! One [`MetricsEngine`] belongs to exactly one capture session. Samples are
//! pushed in arrival order; [`MetricsEngine::compute`] derives the composite
//! scores from the current window contents.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

use crate::models::{
    DerivedMetrics, Emotion, FaceBox, HeadPose, ProbabilityVector, RawFrameEvent, NUM_CLASSES,
};

/// Guard added to probabilities before taking logarithms.
const LOG_EPSILON: f64 = 1e-12;

/// Long-window sample count above which risk switches to the trend formula.
const RISK_LONG_WINDOW_MIN: usize = 10;

/// Window sizes and smoothing for one engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub short_window: usize,
    pub long_window: usize,
    pub ema_alpha: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            short_window: 30,
            long_window: 300,
            ema_alpha: 0.2,
        }
    }
}

/// One classified frame as seen by the engine.
#[derive(Debug, Clone)]
pub struct Sample {
    pub probs: ProbabilityVector,
    pub top: Emotion,
    pub face_box: Option<FaceBox>,
    pub ear: Option<f64>,
    pub pose: Option<HeadPose>,
    pub received_at: Instant,
}

impl Sample {
    pub fn new(probs: ProbabilityVector, top: Emotion) -> Self {
        Self {
            probs,
            top,
            face_box: None,
            ear: None,
            pose: None,
            received_at: Instant::now(),
        }
    }

    pub fn with_box(mut self, face_box: FaceBox) -> Self {
        self.face_box = Some(face_box);
        self
    }

    pub fn with_ear(mut self, ear: f64) -> Self {
        self.ear = Some(ear);
        self
    }

    pub fn from_event(event: &RawFrameEvent) -> Self {
        Self {
            probs: event.probability_vector(),
            top: event.top_emotion(),
            face_box: event.face_box,
            ear: event.eye_aspect_ratio.filter(|e| e.is_finite()),
            pose: event.head_pose,
            received_at: Instant::now(),
        }
    }
}

/// Per-session aggregator turning raw frames into [`DerivedMetrics`].
#[derive(Debug)]
pub struct MetricsEngine {
    config: EngineConfig,
    short: VecDeque<Sample>,
    long: VecDeque<Sample>,
    velocities: VecDeque<f64>,
    prev_center: Option<(f64, f64)>,
    engagement_ema: Option<f64>,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl MetricsEngine {
    pub fn new(config: EngineConfig) -> Self {
        let config = EngineConfig {
            short_window: config.short_window.max(1),
            long_window: config.long_window.max(1),
            ema_alpha: config.ema_alpha.clamp(0.0, 1.0),
        };

        Self {
            config,
            short: VecDeque::with_capacity(config.short_window),
            long: VecDeque::with_capacity(config.long_window),
            velocities: VecDeque::with_capacity(config.short_window),
            prev_center: None,
            engagement_ema: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn short_len(&self) -> usize {
        self.short.len()
    }

    pub fn long_len(&self) -> usize {
        self.long.len()
    }

    pub fn is_empty(&self) -> bool {
        self.short.is_empty()
    }

    /// Append a sample to both windows, evicting the oldest on overflow, and
    /// track face-box movement.
    pub fn push(&mut self, sample: Sample) {
        let movement = match sample.face_box {
            Some(face_box) => {
                let (cx, cy) = face_box.center();
                let dist = match self.prev_center {
                    Some((px, py)) => (cx - px).hypot(cy - py),
                    None => 0.0,
                };
                self.prev_center = Some((cx, cy));
                dist / face_box.scale()
            }
            // No face found this frame: counts as no movement
            None => 0.0,
        };
        push_bounded(&mut self.velocities, movement, self.config.short_window);

        push_bounded(&mut self.long, sample.clone(), self.config.long_window);
        push_bounded(&mut self.short, sample, self.config.short_window);
    }

    /// Derive the composite scores; `None` before the first sample.
    ///
    /// Updates the engagement moving average, so each call counts as one
    /// observation.
    pub fn compute(&mut self) -> Option<DerivedMetrics> {
        let current = self.short.back()?.probs;

        let p = |e: Emotion| current.get(e);

        let attentiveness = clamp01(
            0.6 * p(Emotion::Surprise) + 0.35 * p(Emotion::Neutral)
                - 0.25
                    * (p(Emotion::Sad) + p(Emotion::Angry) + p(Emotion::Fear) + p(Emotion::Disgust)),
        );

        let positivity_raw = p(Emotion::Happy) + 0.2 * p(Emotion::Neutral)
            - 0.6 * p(Emotion::Sad)
            - 0.6 * p(Emotion::Angry)
            - 0.5 * p(Emotion::Disgust)
            - 0.4 * p(Emotion::Fear)
            + 0.15 * p(Emotion::Surprise);
        let positivity = clamp01((positivity_raw + 0.6) / 1.6);

        let engagement_raw = 0.7 * attentiveness + 0.3 * positivity;
        let ema = match self.engagement_ema {
            None => engagement_raw,
            Some(prev) => (1.0 - self.config.ema_alpha) * prev + self.config.ema_alpha * engagement_raw,
        };
        self.engagement_ema = Some(ema);
        let engagement = clamp01(ema);

        let boredom = clamp01(
            0.8 * low_arousal_fraction(&self.short)
                + 0.2 * (1.0 - normalized_entropy(&mean_probabilities(&self.short))),
        );

        let base = current.frustration_base();
        let previous: Vec<f64> = self
            .short
            .iter()
            .take(self.short.len() - 1)
            .map(|s| s.probs.frustration_base())
            .collect();
        let previous_mean = if previous.is_empty() { 0.0 } else { statistical::mean(&previous) };
        let frustration = clamp01(0.6 * base + 0.4 * (base - previous_mean).max(0.0));

        let volatility = clamp01(mean_class_std(&self.short) / 0.5);

        let velocities: Vec<f64> = self.velocities.iter().copied().collect();
        let movement = if velocities.is_empty() { 0.0 } else { statistical::mean(&velocities) };
        let distraction = clamp01(0.6 * clamp01(movement * 3.0) + 0.4 * (1.0 - attentiveness));

        let ears: Vec<f64> = self.short.iter().filter_map(|s| s.ear).collect();
        let fatigue = if ears.is_empty() {
            0.0
        } else {
            clamp01(1.0 - (statistical::mean(&ears) - 0.10) / 0.25)
        };

        // Formula switches abruptly once the long window has enough history
        let risk = if self.long.len() > RISK_LONG_WINDOW_MIN {
            clamp01(
                0.5 * low_arousal_fraction(&self.long)
                    + 0.3 * frustration
                    + 0.2 * clamp01(mean_class_std(&self.long) / 0.5),
            )
        } else {
            clamp01(0.5 * boredom + 0.3 * frustration + 0.2 * volatility)
        };

        Some(DerivedMetrics {
            attentiveness,
            positivity,
            engagement,
            boredom,
            frustration,
            volatility,
            distraction,
            fatigue,
            risk,
        })
    }
}

fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, capacity: usize) {
    while buf.len() >= capacity {
        buf.pop_front();
    }
    buf.push_back(item);
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}

fn low_arousal_fraction(window: &VecDeque<Sample>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let count = window.iter().filter(|s| s.top.is_low_arousal()).count();
    count as f64 / window.len() as f64
}

fn class_column(window: &VecDeque<Sample>, class: usize) -> Vec<f64> {
    window.iter().map(|s| s.probs.as_array()[class]).collect()
}

fn mean_probabilities(window: &VecDeque<Sample>) -> [f64; NUM_CLASSES] {
    let mut means = [0.0; NUM_CLASSES];
    if window.is_empty() {
        return means;
    }
    for (class, mean) in means.iter_mut().enumerate() {
        *mean = statistical::mean(&class_column(window, class));
    }
    means
}

/// Shannon entropy divided by `ln(NUM_CLASSES)`, so a uniform vector scores 1.
fn normalized_entropy(probs: &[f64; NUM_CLASSES]) -> f64 {
    let entropy: f64 = probs
        .iter()
        .map(|&p| {
            let p = p.max(0.0);
            -p * (p + LOG_EPSILON).ln()
        })
        .sum();
    entropy / (NUM_CLASSES as f64).ln()
}

/// Mean over classes of the population standard deviation within the window.
fn mean_class_std(window: &VecDeque<Sample>) -> f64 {
    if window.is_empty() {
        return 0.0;
    }
    let stds: Vec<f64> = (0..NUM_CLASSES)
        .map(|class| statistical::population_standard_deviation(&class_column(window, class), None))
        .collect();
    statistical::mean(&stds)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn happy() -> ProbabilityVector {
        ProbabilityVector::new([0.8, 0.04, 0.03, 0.05, 0.03, 0.02, 0.03])
    }

    fn neutral() -> ProbabilityVector {
        ProbabilityVector::new([0.05, 0.1, 0.05, 0.05, 0.05, 0.05, 0.65])
    }

    fn assert_in_unit_range(m: &DerivedMetrics) {
        for (name, value) in m.fields() {
            assert!(
                (0.0..=1.0).contains(&value),
                "{} = {} outside [0, 1]",
                name,
                value
            );
        }
    }

    #[test]
    fn test_empty_engine_computes_nothing() {
        let mut engine = MetricsEngine::default();
        assert!(engine.compute().is_none());
    }

    #[test]
    fn test_windows_are_fifo_bounded() {
        let mut engine = MetricsEngine::new(EngineConfig {
            short_window: 3,
            long_window: 5,
            ema_alpha: 0.2,
        });
        for _ in 0..12 {
            engine.push(Sample::new(neutral(), Emotion::Neutral));
        }
        assert_eq!(engine.short_len(), 3);
        assert_eq!(engine.long_len(), 5);
        assert_eq!(engine.velocities.len(), 3);
    }

    #[test]
    fn test_oldest_sample_evicted_first() {
        let mut engine = MetricsEngine::new(EngineConfig {
            short_window: 2,
            long_window: 2,
            ema_alpha: 0.2,
        });
        engine.push(Sample::new(happy(), Emotion::Happy));
        engine.push(Sample::new(neutral(), Emotion::Neutral));
        engine.push(Sample::new(neutral(), Emotion::Sad));
        let tops: Vec<Emotion> = engine.short.iter().map(|s| s.top).collect();
        assert_eq!(tops, vec![Emotion::Neutral, Emotion::Sad]);
    }

    #[test]
    fn test_first_engagement_bypasses_smoothing() {
        let mut engine = MetricsEngine::default();
        engine.push(Sample::new(happy(), Emotion::Happy));
        let m = engine.compute().unwrap();
        assert!((m.engagement - (0.7 * m.attentiveness + 0.3 * m.positivity)).abs() < 1e-12);
    }

    #[test]
    fn test_engagement_ema_blends_with_alpha() {
        let mut engine = MetricsEngine::default();
        engine.push(Sample::new(happy(), Emotion::Happy));
        let first = engine.compute().unwrap();

        engine.push(Sample::new(neutral(), Emotion::Neutral));
        let second = engine.compute().unwrap();
        let raw = 0.7 * second.attentiveness + 0.3 * second.positivity;
        let expected = 0.8 * first.engagement + 0.2 * raw;
        assert!((second.engagement - expected).abs() < 1e-12);
    }

    #[test]
    fn test_movement_normalized_by_box_size() {
        let mut engine = MetricsEngine::default();
        let b1 = FaceBox { x: 0.0, y: 0.0, w: 100.0, h: 100.0 };
        let b2 = FaceBox { x: 30.0, y: 40.0, w: 100.0, h: 100.0 };
        engine.push(Sample::new(neutral(), Emotion::Neutral).with_box(b1));
        engine.push(Sample::new(neutral(), Emotion::Neutral).with_box(b2));
        let v: Vec<f64> = engine.velocities.iter().copied().collect();
        assert_eq!(v[0], 0.0);
        // displacement 50 px over a 100 px face
        assert!((v[1] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_fatigue_from_eye_aspect_ratio() {
        let mut engine = MetricsEngine::default();
        engine.push(Sample::new(neutral(), Emotion::Neutral).with_ear(0.10));
        assert!((engine.compute().unwrap().fatigue - 1.0).abs() < 1e-12);

        let mut engine = MetricsEngine::default();
        engine.push(Sample::new(neutral(), Emotion::Neutral).with_ear(0.35));
        assert!(engine.compute().unwrap().fatigue.abs() < 1e-12);

        let mut engine = MetricsEngine::default();
        engine.push(Sample::new(neutral(), Emotion::Neutral).with_ear(0.225));
        assert!((engine.compute().unwrap().fatigue - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_frustration_trend_uses_previous_samples() {
        let mut engine = MetricsEngine::default();
        engine.push(Sample::new(neutral(), Emotion::Neutral));
        let angry = ProbabilityVector::new([0.0, 0.0, 0.7, 0.0, 0.1, 0.1, 0.1]);
        engine.push(Sample::new(angry, Emotion::Angry));
        let m = engine.compute().unwrap();
        let base = 0.9;
        let prev = 0.15;
        assert!((m.frustration - clamp01(0.6 * base + 0.4 * (base - prev))).abs() < 1e-9);
    }

    #[test]
    fn test_constant_window_has_zero_volatility() {
        let mut engine = MetricsEngine::default();
        for _ in 0..5 {
            engine.push(Sample::new(neutral(), Emotion::Neutral));
        }
        assert!(engine.compute().unwrap().volatility.abs() < 1e-12);
    }

    #[test]
    fn test_uniform_probabilities_have_full_entropy() {
        let uniform = [1.0 / NUM_CLASSES as f64; NUM_CLASSES];
        assert!((normalized_entropy(&uniform) - 1.0).abs() < 1e-9);

        let mut one_hot = [0.0; NUM_CLASSES];
        one_hot[0] = 1.0;
        assert!(normalized_entropy(&one_hot).abs() < 1e-9);
    }

    #[test]
    fn test_extreme_vectors_stay_in_range() {
        let mut engine = MetricsEngine::default();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for i in 0..400 {
            let mut values = [0.0; NUM_CLASSES];
            for v in values.iter_mut() {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                *v = (seed % 1000) as f64;
            }
            if i % 7 == 0 {
                values = [0.0; NUM_CLASSES];
                values[i % NUM_CLASSES] = 1.0;
            }
            let probs = ProbabilityVector::new(values);
            let mut sample = Sample::new(probs, probs.argmax())
                .with_box(FaceBox { x: (i * 37 % 500) as f64, y: 0.0, w: 2.0, h: 2.0 });
            if i % 3 == 0 {
                sample = sample.with_ear((i % 50) as f64 / 100.0);
            }
            engine.push(sample);
            assert_in_unit_range(&engine.compute().unwrap());
        }
    }

    #[test]
    fn test_happy_stream_is_engaged_and_calm() {
        let mut engine = MetricsEngine::default();
        let mut engagement = Vec::new();
        let still = FaceBox { x: 100.0, y: 80.0, w: 120.0, h: 120.0 };
        for _ in 0..5 {
            engine.push(Sample::new(happy(), Emotion::Happy).with_box(still));
            let m = engine.compute().unwrap();
            assert_in_unit_range(&m);
            assert_eq!(m.fatigue, 0.0);
            assert!(m.distraction < 0.5, "distraction {}", m.distraction);
            engagement.push(m.engagement);
        }
        // Constant input: the moving average never drops
        for pair in engagement.windows(2) {
            assert!(pair[1] >= pair[0] - 1e-12);
        }
        assert!(engagement[4] > 0.0);
    }

    #[test]
    fn test_neutral_stream_is_bored_and_switches_risk_branch() {
        let mut engine = MetricsEngine::default();
        for i in 1..=15 {
            engine.push(Sample::new(neutral(), Emotion::Neutral));
            let m = engine.compute().unwrap();
            assert_in_unit_range(&m);
            assert!(m.boredom > 0.5, "boredom {} at sample {}", m.boredom, i);

            let short_branch = clamp01(0.5 * m.boredom + 0.3 * m.frustration + 0.2 * m.volatility);
            let long_branch = clamp01(0.5 * 1.0 + 0.3 * m.frustration + 0.2 * 0.0);
            if i <= RISK_LONG_WINDOW_MIN {
                assert!((m.risk - short_branch).abs() < 1e-12);
            } else {
                assert!((m.risk - long_branch).abs() < 1e-12);
            }
        }
    }
}
