//! Collaborators the prediction core calls out to: the simulation step, the
//! position error policy and the authority's clock. Reference
//! implementations live alongside the traits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::MovementConfig;
use crate::movement::input::QuantizedInput;
use crate::movement::snapshot::KinematicSnapshot;
use crate::util::math::Vec3;

/// Advances a body by one step. Must be deterministic: identical state, input
/// and delta on client and authority give identical results.
pub trait MovementSimulator {
    fn simulate(
        &self,
        state: &KinematicSnapshot,
        input: &QuantizedInput,
        delta_time: f64,
    ) -> KinematicSnapshot;
}

/// Decides whether a client's claimed result is too far from the authority's
pub trait PositionErrorPolicy {
    fn exceeds_tolerance(
        &self,
        authoritative: &KinematicSnapshot,
        claimed: &KinematicSnapshot,
    ) -> bool;
}

/// Monotonic seconds since world start
pub trait Clock {
    fn now(&self) -> f64;
}

/// Spring that holds the body above the ground plane at z = 0
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoverSpring {
    /// Spring length; no force above this height
    pub length: f32,
    pub tension: f32,
    pub damping: f32,
}

impl Default for HoverSpring {
    fn default() -> Self {
        Self {
            length: 200.0,
            tension: 1500.0,
            damping: 2.5,
        }
    }
}

/// Thrust-and-torque hovercraft model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoverSimulator {
    /// Forward acceleration at full input (units/s²)
    pub forward_speed: f32,
    pub strafe_speed: f32,
    /// Yaw acceleration at full input (degrees/s²)
    pub steer_speed: f32,
    /// Pitch acceleration at full input (degrees/s²)
    pub pitch_speed: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub hover: Option<HoverSpring>,
}

impl Default for HoverSimulator {
    fn default() -> Self {
        Self {
            forward_speed: 200.0,
            strafe_speed: 125.0,
            steer_speed: 30.0,
            pitch_speed: 25.0,
            linear_damping: 0.2,
            angular_damping: 1.0,
            hover: None,
        }
    }
}

impl HoverSimulator {
    pub fn with_hover(mut self, spring: HoverSpring) -> Self {
        self.hover = Some(spring);
        self
    }

    fn hover_acceleration(&self, state: &KinematicSnapshot) -> Vec3 {
        let Some(spring) = &self.hover else {
            return Vec3::ZERO;
        };
        let height = state.position.z;
        if height < 0.0 || height > spring.length {
            return Vec3::ZERO;
        }
        let compression = 1.0 - height / spring.length;
        let accel_z = compression * spring.tension - spring.damping * state.linear_velocity.z;
        Vec3::new(0.0, 0.0, accel_z)
    }
}

impl MovementSimulator for HoverSimulator {
    fn simulate(
        &self,
        state: &KinematicSnapshot,
        input: &QuantizedInput,
        delta_time: f64,
    ) -> KinematicSnapshot {
        let dt = delta_time as f32;
        if dt <= 0.0 {
            return *state;
        }

        let rotation = state.rotation;
        let accel = rotation.forward() * (input.forward * self.forward_speed)
            + rotation.right() * (input.strafe * self.strafe_speed)
            + self.hover_acceleration(state);
        let alpha = rotation.up() * (input.steer * self.steer_speed.to_radians())
            + rotation.right() * (input.pitch * self.pitch_speed.to_radians());

        // Semi-implicit Euler with implicit damping
        let linear_velocity =
            (state.linear_velocity + accel * dt) * (1.0 / (1.0 + self.linear_damping * dt));
        let angular_velocity =
            (state.angular_velocity + alpha * dt) * (1.0 / (1.0 + self.angular_damping * dt));

        KinematicSnapshot {
            position: state.position + linear_velocity * dt,
            rotation: rotation.integrate(angular_velocity, dt),
            linear_velocity,
            angular_velocity,
        }
    }
}

/// Flags a client whose claimed position is too far from the authority's
#[derive(Debug, Clone, Copy)]
pub struct SquaredDistancePolicy {
    pub max_error_sq: f32,
}

impl SquaredDistancePolicy {
    pub fn new(max_error_sq: f32) -> Self {
        Self { max_error_sq }
    }

    pub fn from_config(config: &MovementConfig) -> Self {
        Self::new(config.max_position_error_sq)
    }
}

impl PositionErrorPolicy for SquaredDistancePolicy {
    fn exceeds_tolerance(
        &self,
        authoritative: &KinematicSnapshot,
        claimed: &KinematicSnapshot,
    ) -> bool {
        let error_sq = authoritative.position.distance_sq_to(claimed.position);
        // Non-finite claims are never within tolerance
        error_sq.is_nan() || error_sq > self.max_error_sq
    }
}

/// Clock driven by hand, for tests and lock-step simulation
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    pub fn set(&self, now: f64) {
        self.bits.store(now.to_bits(), Ordering::Relaxed);
    }

    pub fn advance(&self, delta: f64) {
        self.set(self.now() + delta);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Wall clock measured from construction
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::math::Quat;

    const DT: f64 = 1.0 / 60.0;

    #[test]
    fn test_idle_at_rest_stays_put() {
        let sim = HoverSimulator::default();
        let state = KinematicSnapshot::at_rest(Vec3::new(5.0, 5.0, 5.0), Quat::IDENTITY);
        let next = sim.simulate(&state, &QuantizedInput::default(), DT);
        assert_eq!(next.position, state.position);
        assert_eq!(next.linear_velocity, Vec3::ZERO);
    }

    #[test]
    fn test_forward_thrust_moves_forward() {
        let sim = HoverSimulator::default();
        let mut state = KinematicSnapshot::default();
        let input = QuantizedInput::new(1.0, 0.0, 0.0, 0.0, 0);
        for _ in 0..60 {
            state = sim.simulate(&state, &input, DT);
        }
        assert!(state.position.x > 50.0);
        assert!(state.position.y.abs() < 1e-3);
    }

    #[test]
    fn test_steer_yaws() {
        let sim = HoverSimulator::default();
        let mut state = KinematicSnapshot::default();
        let input = QuantizedInput::new(0.0, 0.0, 1.0, 0.0, 0);
        for _ in 0..60 {
            state = sim.simulate(&state, &input, DT);
        }
        assert!(state.angular_velocity.z > 0.0);
        assert!(state.rotation.forward().y > 0.0);
    }

    #[test]
    fn test_deterministic() {
        let sim = HoverSimulator::default();
        let input = QuantizedInput::new(0.7, -0.2, 0.4, 0.1, 0);
        let mut a = KinematicSnapshot::default();
        let mut b = KinematicSnapshot::default();
        for _ in 0..120 {
            a = sim.simulate(&a, &input, DT);
            b = sim.simulate(&b, &input, DT);
        }
        assert_eq!(a, b);
    }

    #[test]
    fn test_zero_delta_is_identity() {
        let sim = HoverSimulator::default();
        let state = KinematicSnapshot::new(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::IDENTITY,
            Vec3::new(10.0, 0.0, 0.0),
            Vec3::ZERO,
        );
        let input = QuantizedInput::new(1.0, 0.0, 0.0, 0.0, 0);
        assert_eq!(sim.simulate(&state, &input, 0.0), state);
    }

    #[test]
    fn test_hover_spring_lifts() {
        let sim = HoverSimulator::default().with_hover(HoverSpring::default());
        let mut state = KinematicSnapshot::at_rest(Vec3::new(0.0, 0.0, 50.0), Quat::IDENTITY);
        state = sim.simulate(&state, &QuantizedInput::default(), DT);
        assert!(state.linear_velocity.z > 0.0);

        let high = KinematicSnapshot::at_rest(Vec3::new(0.0, 0.0, 500.0), Quat::IDENTITY);
        let next = sim.simulate(&high, &QuantizedInput::default(), DT);
        assert_eq!(next.linear_velocity.z, 0.0);
    }

    #[test]
    fn test_squared_distance_policy() {
        let policy = SquaredDistancePolicy::new(3.0);
        let a = KinematicSnapshot::default();
        let near = KinematicSnapshot::at_rest(Vec3::new(1.0, 1.0, 1.0), Quat::IDENTITY);
        let far = KinematicSnapshot::at_rest(Vec3::new(2.0, 0.0, 0.0), Quat::IDENTITY);
        let broken = KinematicSnapshot::at_rest(Vec3::new(f32::NAN, 0.0, 0.0), Quat::IDENTITY);
        assert!(!policy.exceeds_tolerance(&a, &near));
        assert!(policy.exceeds_tolerance(&a, &far));
        assert!(policy.exceeds_tolerance(&a, &broken));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1.5);
        assert_eq!(clock.now(), 1.5);
        clock.advance(0.25);
        assert_eq!(clock.now(), 1.75);
        clock.set(10.0);
        assert_eq!(clock.now(), 10.0);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
