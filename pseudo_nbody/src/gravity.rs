//! Per-pair acceleration and per-particle integration step shared by every engine.

use crate::particle::{SourceParticle, TestParticle};
use glam::Vec3;

/// Returns the softened gravitational acceleration `source` exerts on a particle at
/// `position`.
///
/// The softening is added to the squared distance, so coincident positions yield a zero
/// acceleration instead of a singularity.
///
/// ```
/// # use pseudo_nbody::{gravity, SourceParticle};
/// # use glam::Vec3;
/// let source = SourceParticle::new(Vec3::ZERO, 1000.0);
/// let acceleration = gravity::acceleration(&source, Vec3::new(100.0, 0.0, 0.0), 0.0);
///
/// assert!((acceleration.x + 0.1).abs() < 1e-6);
/// ```
#[inline]
pub fn acceleration(source: &SourceParticle, position: Vec3, softening: f32) -> Vec3 {
    let dir = source.position - position;
    let invr = (dir.length_squared() + softening).sqrt().recip();
    let invr3 = invr * invr * invr;

    dir * (source.mass * invr3)
}

/// Advances `particle` by `time_step` under the constant `acceleration`.
///
/// The position is advanced with the velocity from before the step, then the velocity is
/// updated.
#[inline]
pub fn integrate(particle: &mut TestParticle, acceleration: Vec3, time_step: f32) {
    particle.position +=
        particle.velocity * time_step + 0.5 * acceleration * time_step * time_step;
    particle.velocity += acceleration * time_step;
}
