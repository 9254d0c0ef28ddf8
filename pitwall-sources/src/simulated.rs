//! Simulated source that generates synthetic telemetry for offline use
//!
//! Drives a small field of cars around a 5 km circuit with straights, braking
//! zones, corners and acceleration phases. Cars move forward by the distance
//! their current speed covers in the elapsed wall-clock time, so progression
//! does not depend on how often the source is polled.

use chrono::Utc;
use pitwall_core::model::{RadioMessage, TelemetrySample};
use pitwall_core::source::{SampleSource, SourceError};
use pitwall_core::units::{Fraction, Kph, Meters};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const TRACK_LENGTH_M: f64 = 5000.0;
pub const SECTORS: u8 = 3;
pub const DEFAULT_DRIVERS: usize = 2;
pub const DEFAULT_RADIO_EVERY: u64 = 150;

const RADIO_PHRASES: [&str; 15] = [
    "Box box box",
    "Full speed ahead",
    "Push push push",
    "Save fuel",
    "Watch your mirrors",
    "Clear to pass",
    "Stay out",
    "Box this lap",
    "Keep pushing",
    "Smooth driving",
    "Watch the gap",
    "Maintain position",
    "Attack mode",
    "Defend position",
    "Pit window open",
];

// =============================================================================
// Track definition: segments as fractions of the lap
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq)]
enum SegmentKind {
    Straight, // Full throttle, top speed
    Braking,  // Heavy braking into a corner
    Corner,   // Coasting through the apex
    Accel,    // Accelerating out of a corner
}

#[derive(Clone, Copy)]
struct TrackSegment {
    kind: SegmentKind,
    length: f64,       // fraction of the lap
    speed_factor: f64, // fraction of the driver's base speed at segment end
}

fn demo_track() -> [TrackSegment; 5] {
    [
        TrackSegment { kind: SegmentKind::Straight, length: 0.2, speed_factor: 1.0 },
        TrackSegment { kind: SegmentKind::Braking,  length: 0.2, speed_factor: 0.7 },
        TrackSegment { kind: SegmentKind::Corner,   length: 0.2, speed_factor: 0.5 },
        TrackSegment { kind: SegmentKind::Accel,    length: 0.2, speed_factor: 0.8 },
        TrackSegment { kind: SegmentKind::Straight, length: 0.2, speed_factor: 1.0 },
    ]
}

/// Driving style of one simulated car
#[derive(Clone, Debug, PartialEq)]
pub struct DriverProfile {
    pub driver_id: String,
    pub team: String,
    /// Top speed on the straights (km/h)
    pub base_speed: f64,
    /// Jitter amplitude applied to speed (km/h)
    pub speed_variance: f64,
    pub throttle_aggression: f64,
    pub brake_aggression: f64,
}

impl DriverProfile {
    /// Profile for the `index`-th car: aggressive, conservative, then balanced
    pub fn for_index(index: usize) -> Self {
        let letter = char::from(b'A' + (index % 26) as u8);
        let (base_speed, speed_variance, throttle_aggression, brake_aggression) = match index {
            0 => (280.0, 15.0, 0.8, 0.7),
            1 => (270.0, 10.0, 0.6, 0.5),
            _ => (275.0, 12.0, 0.7, 0.6),
        };
        Self {
            driver_id: format!("DRIVER_{}", letter),
            team: format!("TEAM_{}", letter),
            base_speed,
            speed_variance,
            throttle_aggression,
            brake_aggression,
        }
    }
}

/// Where a simulated car is and how fast it is going
#[derive(Clone, Debug, PartialEq)]
pub struct CarState {
    pub lap: u32,
    /// Meters into the current lap
    pub distance: f64,
    pub speed_kph: f64,
    pub throttle: f64,
    pub brake: f64,
    pub gear: i8,
}

impl CarState {
    pub fn sector(&self) -> u8 {
        let sector_length = TRACK_LENGTH_M / SECTORS as f64;
        ((self.distance / sector_length) as u8 + 1).min(SECTORS)
    }

    pub fn track_position(&self) -> f64 {
        self.distance / TRACK_LENGTH_M
    }
}

/// Distance covered at `speed_kph` over `dt`
pub fn distance_increment(speed_kph: f64, dt: Duration) -> f64 {
    Kph(speed_kph).to_meters_per_second() * dt.as_secs_f64()
}

struct LapInputs {
    speed_kph: f64,
    throttle: f64,
    brake: f64,
}

fn compute_lap_inputs(profile: &DriverProfile, track_position: f64) -> LapInputs {
    let track = demo_track();
    let t = track_position.rem_euclid(1.0);

    // Find current segment
    let mut start = 0.0;
    let mut seg_idx = track.len() - 1;
    for (i, seg) in track.iter().enumerate() {
        if start + seg.length > t {
            seg_idx = i;
            break;
        }
        start += seg.length;
    }

    let seg = track[seg_idx];
    let seg_t = ((t - start) / seg.length).clamp(0.0, 1.0);
    let prev_factor = if seg_idx > 0 {
        track[seg_idx - 1].speed_factor
    } else {
        track[track.len() - 1].speed_factor
    };

    let smooth_t = smoothstep(seg_t);
    let speed_kph = profile.base_speed * lerp(prev_factor, seg.speed_factor, smooth_t);

    let base_throttle = (speed_kph / 300.0).min(1.0) * profile.throttle_aggression;
    let (throttle, brake) = match seg.kind {
        SegmentKind::Straight => (base_throttle, 0.0),
        SegmentKind::Braking => (base_throttle * 0.3, profile.brake_aggression * (0.8 - 0.3 * smooth_t)),
        SegmentKind::Corner => (base_throttle * (0.1 + 0.2 * seg_t), profile.brake_aggression * 0.2 * (1.0 - seg_t)),
        SegmentKind::Accel => (base_throttle * (0.5 + 0.5 * smooth_t), profile.brake_aggression * 0.1 * (1.0 - seg_t)),
    };

    LapInputs {
        speed_kph,
        throttle: throttle.min(1.0),
        brake: brake.min(1.0),
    }
}

fn smoothstep(t: f64) -> f64 {
    let t = t.clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

fn speed_to_gear(speed_kph: f64) -> i8 {
    match speed_kph {
        x if x < 50.0 => 1,
        x if x < 100.0 => 2,
        x if x < 150.0 => 3,
        x if x < 200.0 => 4,
        x if x < 250.0 => 5,
        x if x < 300.0 => 6,
        _ => 7,
    }
}

/// Simple deterministic noise from a seed
fn noise(seed: f64) -> f64 {
    let x = (seed * 12.9898 + 78.233).sin() * 43_758.547;
    x - x.floor()
}

/// Small jitter centered around 0
fn jitter(seed: f64, amplitude: f64) -> f64 {
    (noise(seed) - 0.5) * 2.0 * amplitude
}

// =============================================================================
// SimulatedSource
// =============================================================================

struct SimulatedCar {
    profile: DriverProfile,
    state: CarState,
}

pub struct SimulatedSource {
    cars: Vec<SimulatedCar>,
    tick: u64,
    radio_every: u64,
    pending_radio: Vec<RadioMessage>,
    last_poll: Option<Instant>,
    closed: bool,
}

impl SimulatedSource {
    /// Create a source simulating `drivers` cars with the stock profiles
    pub fn new(drivers: usize) -> Self {
        Self::with_profiles((0..drivers).map(DriverProfile::for_index).collect())
    }

    pub fn with_profiles(profiles: Vec<DriverProfile>) -> Self {
        let cars = profiles
            .into_iter()
            .enumerate()
            .map(|(i, profile)| {
                // Stagger the field so cars are not on top of each other
                let distance = (i as f64 * 0.1 * TRACK_LENGTH_M) % TRACK_LENGTH_M;
                let inputs = compute_lap_inputs(&profile, distance / TRACK_LENGTH_M);
                let state = CarState {
                    lap: 1,
                    distance,
                    speed_kph: inputs.speed_kph,
                    throttle: inputs.throttle,
                    brake: inputs.brake,
                    gear: speed_to_gear(inputs.speed_kph),
                };
                SimulatedCar { profile, state }
            })
            .collect();

        Self {
            cars,
            tick: 0,
            radio_every: DEFAULT_RADIO_EVERY,
            pending_radio: Vec::new(),
            last_poll: None,
            closed: false,
        }
    }

    /// Emit one scripted radio line per driver every `ticks` advances (0 disables)
    pub fn with_radio_every(mut self, ticks: u64) -> Self {
        self.radio_every = ticks;
        self
    }

    pub fn driver_ids(&self) -> Vec<&str> {
        self.cars.iter().map(|c| c.profile.driver_id.as_str()).collect()
    }

    pub fn car(&self, driver_id: &str) -> Option<&CarState> {
        self.cars
            .iter()
            .find(|c| c.profile.driver_id == driver_id)
            .map(|c| &c.state)
    }

    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Move every car forward by `dt` and return one sample per car
    pub fn advance(&mut self, dt: Duration) -> Vec<TelemetrySample> {
        self.tick += 1;
        let n = self.tick as f64;

        let mut samples = Vec::with_capacity(self.cars.len());
        for (i, car) in self.cars.iter_mut().enumerate() {
            let seed = n + i as f64 * 101.0;
            let state = &mut car.state;

            state.distance += distance_increment(state.speed_kph, dt);
            while state.distance >= TRACK_LENGTH_M {
                state.distance -= TRACK_LENGTH_M;
                state.lap += 1;
                debug!("{} started lap {}", car.profile.driver_id, state.lap);
            }

            let inputs = compute_lap_inputs(&car.profile, state.track_position());
            state.speed_kph = (inputs.speed_kph + jitter(seed, car.profile.speed_variance * 0.3)).max(0.0);
            state.throttle = (inputs.throttle + jitter(seed * 1.2, 0.05)).clamp(0.0, 1.0);
            state.brake = (inputs.brake + jitter(seed * 1.3, 0.02)).clamp(0.0, 1.0);
            state.gear = speed_to_gear(state.speed_kph);

            samples.push(TelemetrySample {
                timestamp: Utc::now(),
                driver_id: car.profile.driver_id.clone(),
                lap: Some(state.lap),
                distance_m: Some(Meters(state.distance)),
                sector: Some(state.sector()),
                track_x: Some(Fraction::new(state.track_position())),
                speed_kph: Some(Kph(state.speed_kph)),
                throttle_pct: Some(Fraction::new(state.throttle)),
                brake_pct: Some(Fraction::new(state.brake)),
                gear: Some(state.gear),
            });

            // Stagger radio calls between drivers
            if self.radio_every > 0 && (self.tick + i as u64 * 37) % self.radio_every == 0 {
                let phrase = RADIO_PHRASES[(noise(seed * 0.7) * RADIO_PHRASES.len() as f64) as usize % RADIO_PHRASES.len()];
                self.pending_radio.push(RadioMessage::new(
                    car.profile.driver_id.clone(),
                    car.profile.team.clone(),
                    phrase,
                ));
            }
        }

        samples
    }

    fn ensure_open(&self) -> Result<(), SourceError> {
        if self.closed {
            return Err(SourceError::Closed(self.name().to_string()));
        }
        Ok(())
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new(DEFAULT_DRIVERS)
    }
}

impl SampleSource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    fn is_connected(&self) -> bool {
        !self.closed
    }

    fn poll_samples(&mut self) -> Result<Vec<TelemetrySample>, SourceError> {
        self.ensure_open()?;

        let now = Instant::now();
        let dt = self
            .last_poll
            .map(|last| now.duration_since(last))
            .unwrap_or(Duration::ZERO);
        self.last_poll = Some(now);

        Ok(self.advance(dt))
    }

    fn poll_texts(&mut self) -> Result<Vec<RadioMessage>, SourceError> {
        self.ensure_open()?;
        Ok(std::mem::take(&mut self.pending_radio))
    }

    fn skip_tick(&mut self) {
        if !self.closed {
            self.last_poll = Some(Instant::now());
        }
    }

    fn close(&mut self) {
        if !self.closed {
            info!("Simulated source closed after {} ticks", self.tick);
        }
        self.closed = true;
        self.pending_radio.clear();
    }
}
