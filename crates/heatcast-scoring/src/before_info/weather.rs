use heatcast_domain::{Channel, Weather, WeatherCondition, WindDirection};
use heatcast_tables::{TableProvider, WindBand, WIND_ACTIVATION_MS};

use super::{BeforeInfoStage, StageInput, StageOutcome};

const COMPRESSION: f64 = 6.0;
const SLICK_TURN: f64 = -0.5;
const HOT_AIR_THRESHOLD: f64 = 30.0;
const HOT_AIR_OUTER: f64 = -0.5;
const COLD_WATER_THRESHOLD: f64 = 10.0;
const COLD_WATER_INSIDE: f64 = -0.5;
const FOG_GAP: f64 = 10.0;
const FOG_OUTER: f64 = -0.5;

/// Condition, air and water temperature terms.
///
/// Wet turns and cold, heavy water both cost courses 1-2 grip at the first
/// mark. Hot air costs courses 4-6 top-end, and so does air at least
/// [`FOG_GAP`] degrees warmer than the water (sea fog on the back straight).
#[must_use]
pub fn condition_adjustment(course: u8, weather: &Weather) -> f64 {
    let wet = match (course, weather.condition) {
        (1 | 2, Some(WeatherCondition::Rain | WeatherCondition::Snow)) => SLICK_TURN,
        _ => 0.0,
    };
    let hot = match weather.temperature {
        Some(value) if course >= 4 && value >= HOT_AIR_THRESHOLD => HOT_AIR_OUTER,
        _ => 0.0,
    };
    let cold_water = match weather.water_temperature {
        Some(value) if course <= 2 && value <= COLD_WATER_THRESHOLD => COLD_WATER_INSIDE,
        _ => 0.0,
    };
    let fog = match (weather.temperature, weather.water_temperature) {
        (Some(air), Some(water)) if course >= 4 && air - water >= FOG_GAP => FOG_OUTER,
        _ => 0.0,
    };
    wet + hot + cold_water + fog
}

/// Sums the wind, wave and condition terms and compresses into `(-6, 6)`.
/// Returns `None` when wind speed is unknown.
#[must_use]
pub fn weather_points(
    weather: &Weather,
    venue: u8,
    course: u8,
    tables: &dyn TableProvider,
) -> Option<f64> {
    let speed = weather.wind_speed.filter(|speed| speed.is_finite())?;
    if speed < WIND_ACTIVATION_MS {
        return Some(0.0);
    }
    let Some(band) = WindBand::from_speed(speed) else {
        return Some(0.0);
    };

    let wind = match weather.wind_direction {
        Some(direction) if direction != WindDirection::Calm => tables
            .wind_adjustment(venue, course, direction, band)
            .unwrap_or(0.0),
        _ => 0.0,
    };
    let wave = match (course, weather.wave_height) {
        (1 | 2, Some(height)) => tables.wave_adjustment(course, height).unwrap_or(0.0),
        _ => 0.0,
    };
    let condition = condition_adjustment(course, weather);

    let sum = wind + wave + condition;
    Some(COMPRESSION * (sum / COMPRESSION).tanh())
}

/// Venue-aware wind, wave and condition effects by course.
pub struct WeatherStage;

impl BeforeInfoStage for WeatherStage {
    fn channel(&self) -> Channel {
        Channel::Weather
    }

    fn evaluate(&self, input: &StageInput<'_>) -> StageOutcome {
        input
            .heat
            .weather()
            .and_then(|weather| {
                weather_points(weather, input.heat.venue, input.course(), input.tables)
            })
            .map_or_else(StageOutcome::unavailable, StageOutcome::scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heatcast_tables::{EmptyTables, StaticTables};
    use proptest::prelude::*;

    fn weather(speed: f64, direction: WindDirection) -> Weather {
        Weather {
            temperature: Some(20.0),
            water_temperature: Some(18.0),
            wind_speed: Some(speed),
            wind_direction: Some(direction),
            wave_height: Some(12.0),
            condition: Some(WeatherCondition::Rain),
        }
    }

    proptest! {
        #[test]
        fn below_activation_wind_scores_exactly_zero(
            speed in 0.0_f64..WIND_ACTIVATION_MS,
            direction in prop::sample::select(vec![
                WindDirection::Calm,
                WindDirection::Headwind,
                WindDirection::Tailwind,
                WindDirection::Crosswind,
            ]),
            // 4 and 24 carry their own rows; 9 and 12 fall back to the shared ones.
            venue in prop::sample::select(vec![4_u8, 9, 12, 24]),
            course in 1_u8..=6,
            water in proptest::option::of(-2.0_f64..35.0),
            wave in proptest::option::of(0.0_f64..40.0),
        ) {
            let tables = StaticTables::builtin_v1();
            let mut input = weather(speed, direction);
            input.water_temperature = water;
            input.wave_height = wave;
            prop_assert_eq!(weather_points(&input, venue, course, &tables), Some(0.0));
        }
    }

    #[test]
    fn unknown_wind_speed_is_unavailable() {
        let mut input = weather(5.0, WindDirection::Headwind);
        input.wind_speed = None;
        assert_eq!(weather_points(&input, 4, 1, &StaticTables::builtin_v1()), None);
    }

    #[test]
    fn strong_headwind_hurts_lane_one_and_helps_lane_four() {
        let tables = StaticTables::builtin_v1();
        let gusty = weather(6.0, WindDirection::Headwind);
        let inside = weather_points(&gusty, 9, 1, &tables).unwrap_or(f64::NAN);
        let outside = weather_points(&gusty, 9, 4, &tables).unwrap_or(f64::NAN);
        assert!(inside < 0.0);
        assert!(outside > 0.0);
        assert!(inside > -COMPRESSION);
    }

    #[test]
    fn missing_tables_leave_only_the_condition_term() {
        let points = weather_points(&weather(6.0, WindDirection::Headwind), 9, 1, &EmptyTables)
            .unwrap_or(f64::NAN);
        let expected = COMPRESSION * (SLICK_TURN / COMPRESSION).tanh();
        assert!((points - expected).abs() < 1e-12);
    }

    fn temperatures(air: Option<f64>, water: Option<f64>) -> Weather {
        Weather {
            temperature: air,
            water_temperature: water,
            condition: None,
            ..weather(6.0, WindDirection::Headwind)
        }
    }

    #[test]
    fn hot_air_only_touches_outer_courses() {
        let hot = temperatures(Some(33.0), Some(28.0));
        assert_eq!(condition_adjustment(5, &hot), HOT_AIR_OUTER);
        assert_eq!(condition_adjustment(2, &hot), 0.0);
    }

    #[test]
    fn cold_water_costs_the_inside_courses() {
        let cold = temperatures(Some(8.0), Some(2.0));
        assert_eq!(condition_adjustment(1, &cold), COLD_WATER_INSIDE);
        assert_eq!(condition_adjustment(2, &cold), COLD_WATER_INSIDE);
        assert_eq!(condition_adjustment(3, &cold), 0.0);
        assert_eq!(condition_adjustment(1, &temperatures(Some(8.0), None)), 0.0);
    }

    #[test]
    fn warm_air_over_cold_water_costs_the_outer_courses() {
        let foggy = temperatures(Some(24.0), Some(12.0));
        assert_eq!(condition_adjustment(5, &foggy), FOG_OUTER);
        assert_eq!(condition_adjustment(2, &foggy), 0.0);
        assert_eq!(condition_adjustment(5, &temperatures(Some(24.0), Some(16.0))), 0.0);
    }

    #[test]
    fn water_temperature_moves_the_weather_score() {
        let tables = StaticTables::builtin_v1();
        let score = |water: Option<f64>| {
            let mut input = weather(6.0, WindDirection::Headwind);
            input.water_temperature = water;
            weather_points(&input, 9, 1, &tables).unwrap_or(f64::NAN)
        };
        let cold = score(Some(2.0));
        let warm = score(Some(33.0));
        let unknown = score(None);
        assert!(cold < warm, "cold={cold} warm={warm}");
        assert!((warm - unknown).abs() < 1e-12);
    }
}
