use heatcast_domain::{Channel, WindDirection};
use heatcast_tables::WIND_ACTIVATION_MS;

use super::{BeforeInfoStage, StageInput, StageOutcome};

const OUTER_PER_DEGREE: f64 = 1.5;
const OUTER_CAP: f64 = 3.0;
const INNER_GLIDE: f64 = 2.0;
const INNER_CLIMB_PENALTY: f64 = -2.0;
const INNER_CLIMB_LIMIT: f64 = 1.0;
const SYNERGY: f64 = 2.0;

/// Tilt contribution by course, before any wind synergy.
#[must_use]
pub fn tilt_points(course: u8, tilt: f64) -> f64 {
    match course {
        1 | 2 if tilt <= 0.0 => INNER_GLIDE,
        1 | 2 if tilt >= INNER_CLIMB_LIMIT => INNER_CLIMB_PENALTY,
        4..=6 => (OUTER_PER_DEGREE * tilt.max(0.0)).min(OUTER_CAP),
        _ => 0.0,
    }
}

/// Climbing trim into a headwind, or gliding trim with a tailwind.
#[must_use]
pub fn wind_synergy(tilt: f64, direction: Option<WindDirection>, wind_speed: Option<f64>) -> f64 {
    let strong_enough = wind_speed.is_some_and(|speed| speed >= WIND_ACTIVATION_MS);
    match direction {
        Some(WindDirection::Headwind) if strong_enough && tilt > 0.0 => SYNERGY,
        Some(WindDirection::Tailwind) if strong_enough && tilt < 0.0 => SYNERGY,
        _ => 0.0,
    }
}

/// Motor trim angle read against course and wind.
pub struct TiltWindStage;

impl BeforeInfoStage for TiltWindStage {
    fn channel(&self) -> Channel {
        Channel::TiltWind
    }

    fn evaluate(&self, input: &StageInput<'_>) -> StageOutcome {
        let Some(tilt) = input
            .entry
            .and_then(|entry| entry.tilt_angle)
            .filter(|tilt| tilt.is_finite())
        else {
            return StageOutcome::unavailable();
        };
        let weather = input.heat.weather();
        let synergy = wind_synergy(
            tilt,
            weather.and_then(|weather| weather.wind_direction),
            weather.and_then(|weather| weather.wind_speed),
        );
        StageOutcome::scored(tilt_points(input.course(), tilt) + synergy)
    }
}
