use std::collections::VecDeque;
use std::f32::consts::{PI, TAU};

use glam::{Quat, Vec2, Vec3};

/// Values a [`InterpolatedTimeMachine`] can blend between.
pub trait Interpolate: Copy + Default {
    /// `self - earlier`.
    fn difference(self, earlier: Self) -> Self;

    /// `self + delta`.
    fn offset(self, delta: Self) -> Self;

    /// `self * numerator / denominator`.
    fn scale(self, numerator: i32, denominator: i32) -> Self;

    fn is_zero(&self) -> bool;
}

macro_rules! impl_interpolate_int {
    ($($ty:ty),*) => {$(
        impl Interpolate for $ty {
            fn difference(self, earlier: Self) -> Self {
                self.wrapping_sub(earlier)
            }

            fn offset(self, delta: Self) -> Self {
                self.wrapping_add(delta)
            }

            fn scale(self, numerator: i32, denominator: i32) -> Self {
                (self as i64 * numerator as i64 / denominator as i64) as $ty
            }

            fn is_zero(&self) -> bool {
                *self == 0
            }
        }
    )*};
}

impl_interpolate_int!(i16, i32);

impl Interpolate for f32 {
    fn difference(self, earlier: Self) -> Self {
        self - earlier
    }

    fn offset(self, delta: Self) -> Self {
        self + delta
    }

    fn scale(self, numerator: i32, denominator: i32) -> Self {
        self * numerator as f32 / denominator as f32
    }

    fn is_zero(&self) -> bool {
        *self == 0.0
    }
}

impl Interpolate for f64 {
    fn difference(self, earlier: Self) -> Self {
        self - earlier
    }

    fn offset(self, delta: Self) -> Self {
        self + delta
    }

    fn scale(self, numerator: i32, denominator: i32) -> Self {
        self * numerator as f64 / denominator as f64
    }

    fn is_zero(&self) -> bool {
        *self == 0.0
    }
}

impl Interpolate for Vec2 {
    fn difference(self, earlier: Self) -> Self {
        self - earlier
    }

    fn offset(self, delta: Self) -> Self {
        self + delta
    }

    fn scale(self, numerator: i32, denominator: i32) -> Self {
        self * numerator as f32 / denominator as f32
    }

    fn is_zero(&self) -> bool {
        *self == Vec2::ZERO
    }
}

impl Interpolate for Vec3 {
    fn difference(self, earlier: Self) -> Self {
        self - earlier
    }

    fn offset(self, delta: Self) -> Self {
        self + delta
    }

    fn scale(self, numerator: i32, denominator: i32) -> Self {
        self * numerator as f32 / denominator as f32
    }

    fn is_zero(&self) -> bool {
        *self == Vec3::ZERO
    }
}

pub fn normalize_angle(angle: f32) -> f32 {
    let mut normalized = angle % TAU;
    if normalized > PI {
        normalized -= TAU;
    } else if normalized <= -PI {
        normalized += TAU;
    }
    normalized
}

/// An angle in radians that interpolates along the shortest arc.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Angle(pub f32);

impl Interpolate for Angle {
    fn difference(self, earlier: Self) -> Self {
        Angle(normalize_angle(self.0 - earlier.0))
    }

    fn offset(self, delta: Self) -> Self {
        Angle(normalize_angle(self.0 + delta.0))
    }

    fn scale(self, numerator: i32, denominator: i32) -> Self {
        Angle(self.0 * numerator as f32 / denominator as f32)
    }

    fn is_zero(&self) -> bool {
        self.0 == 0.0
    }
}

/// Position and orientation sampled together.
///
/// Rotation blends along the shortest arc; the difference of two transforms
/// holds the rotation taking the earlier orientation to the later one.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Transform {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }
}

impl Interpolate for Transform {
    fn difference(self, earlier: Self) -> Self {
        Self {
            position: self.position - earlier.position,
            rotation: (self.rotation * earlier.rotation.inverse()).normalize(),
        }
    }

    fn offset(self, delta: Self) -> Self {
        Self {
            position: self.position + delta.position,
            rotation: (delta.rotation * self.rotation).normalize(),
        }
    }

    fn scale(self, numerator: i32, denominator: i32) -> Self {
        let t = numerator as f32 / denominator as f32;
        Self {
            position: self.position * t,
            rotation: Quat::IDENTITY.slerp(self.rotation, t),
        }
    }

    fn is_zero(&self) -> bool {
        self.position == Vec3::ZERO && self.rotation.abs_diff_eq(Quat::IDENTITY, 1e-6)
    }
}

/// Sparse per-tick history, bounded to the most recent `history` ticks.
#[derive(Debug, Clone)]
struct History<T> {
    samples: VecDeque<(u32, T)>,
    history: u32,
}

impl<T: Copy> History<T> {
    fn new(history: u32) -> Self {
        Self {
            samples: VecDeque::with_capacity(history as usize),
            history: history.max(1),
        }
    }

    fn set(&mut self, tick: u32, value: T) {
        match self.samples.back_mut() {
            Some((latest, _)) if tick < *latest => return,
            Some((latest, sample)) if tick == *latest => {
                *sample = value;
                return;
            }
            _ => {}
        }

        self.samples.push_back((tick, value));
        while self.samples.len() > self.history as usize {
            self.samples.pop_front();
        }
    }

    /// Nearest samples at or below and at or above `tick`.
    fn surrounding(&self, tick: u32) -> (Option<(u32, T)>, Option<(u32, T)>) {
        let split = self.samples.partition_point(|(t, _)| *t < tick);
        let upper = self.samples.get(split).copied();
        match upper {
            Some((t, value)) if t == tick => (Some((t, value)), Some((t, value))),
            _ => {
                let lower = split.checked_sub(1).and_then(|i| self.samples.get(i)).copied();
                (lower, upper)
            }
        }
    }

    fn purge(&mut self, tick: u32) {
        let Some(cutoff) = tick.checked_sub(self.history) else {
            return;
        };
        while self.samples.len() > 2 && self.samples.front().is_some_and(|(t, _)| *t <= cutoff) {
            self.samples.pop_front();
        }
    }
}

/// Keyed history that returns the nearest known sample.
#[derive(Debug, Clone)]
pub struct TimeMachine<T> {
    history: History<T>,
}

impl<T: Copy + Default> TimeMachine<T> {
    pub fn new(history: u32) -> Self {
        Self {
            history: History::new(history),
        }
    }

    pub fn set(&mut self, tick: u32, value: T) {
        self.history.set(tick, value);
    }

    /// The sample at or before `tick`, else the first one after it.
    pub fn get(&self, tick: u32) -> T {
        match self.history.surrounding(tick) {
            (Some((_, value)), _) | (None, Some((_, value))) => value,
            (None, None) => T::default(),
        }
    }

    pub fn purge(&mut self, tick: u32) {
        self.history.purge(tick);
    }

    pub fn len(&self) -> usize {
        self.history.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.samples.is_empty()
    }

    pub fn latest_tick(&self) -> Option<u32> {
        self.history.samples.back().map(|(tick, _)| *tick)
    }
}

/// Keyed history that interpolates linearly between known samples.
///
/// Requests past the newest sample return that sample unchanged; nothing is
/// extrapolated.
#[derive(Debug, Clone)]
pub struct InterpolatedTimeMachine<T> {
    history: History<T>,
}

impl<T: Interpolate> InterpolatedTimeMachine<T> {
    pub fn new(history: u32) -> Self {
        Self {
            history: History::new(history),
        }
    }

    pub fn set(&mut self, tick: u32, value: T) {
        self.history.set(tick, value);
    }

    pub fn get(&self, tick: u32) -> T {
        match self.history.surrounding(tick) {
            (Some((lower_tick, lower)), Some((upper_tick, upper))) => {
                if lower_tick == upper_tick {
                    return lower;
                }
                let difference = upper.difference(lower);
                if difference.is_zero() {
                    return lower;
                }
                let span = (upper_tick - lower_tick) as i32;
                let elapsed = (tick - lower_tick) as i32;
                lower.offset(difference.scale(elapsed, span))
            }
            (Some((_, lower)), None) => lower,
            (None, Some((_, upper))) => upper,
            (None, None) => T::default(),
        }
    }

    pub fn purge(&mut self, tick: u32) {
        self.history.purge(tick);
    }

    pub fn len(&self) -> usize {
        self.history.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.samples.is_empty()
    }

    pub fn latest_tick(&self) -> Option<u32> {
        self.history.samples.back().map(|(tick, _)| *tick)
    }
}
