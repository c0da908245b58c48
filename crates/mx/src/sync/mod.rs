mod prediction;
mod time_machine;

pub use prediction::{InputPrediction, PredictionError};
pub use time_machine::{
    Angle, InterpolatedTimeMachine, Interpolate, TimeMachine, Transform, normalize_angle,
};
