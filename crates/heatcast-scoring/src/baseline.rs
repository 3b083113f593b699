//! Long-horizon baseline score.

use heatcast_domain::{BaselineScores, ClassRank, Entrant};

use crate::clamp_into;

/// Points by assigned lane, lane 1 first.
pub const LANE_LADDER: [f64; 6] = [40.0, 22.0, 17.0, 13.0, 8.0, 4.0];
pub const LANE_MAX: f64 = 40.0;
pub const COMPETITOR_MAX: f64 = 30.0;
pub const EQUIPMENT_MAX: f64 = 20.0;
pub const CLASS_MAX: f64 = 10.0;

const GLOBAL_WEIGHT: f64 = 0.7;
const LOCAL_WEIGHT: f64 = 0.3;
const WIN_RATE_SCALE: f64 = 10.0;

const NEUTRAL_WIN_RATE: f64 = 5.0;
const NEUTRAL_EQUIPMENT_RATE: f64 = 35.0;
const NEUTRAL_CLASS: ClassRank = ClassRank::LowerMid;

#[must_use]
pub fn lane_points(lane: u8) -> f64 {
    usize::from(lane)
        .checked_sub(1)
        .and_then(|index| LANE_LADDER.get(index))
        .copied()
        .unwrap_or(0.0)
}

#[must_use]
pub fn competitor_points(win_rate: Option<f64>, local_win_rate: Option<f64>) -> f64 {
    let global = win_rate.filter(|v| v.is_finite()).unwrap_or(NEUTRAL_WIN_RATE);
    let local = local_win_rate.filter(|v| v.is_finite()).unwrap_or(global);
    let blend = GLOBAL_WEIGHT * global + LOCAL_WEIGHT * local;
    clamp_into(blend / WIN_RATE_SCALE * COMPETITOR_MAX, 0.0, COMPETITOR_MAX)
}

#[must_use]
pub fn equipment_points(second_rate: Option<f64>) -> f64 {
    let rate = second_rate
        .filter(|v| v.is_finite())
        .unwrap_or(NEUTRAL_EQUIPMENT_RATE);
    clamp_into(rate / 100.0 * EQUIPMENT_MAX, 0.0, EQUIPMENT_MAX)
}

#[must_use]
pub fn class_points(class: Option<ClassRank>) -> f64 {
    match class.unwrap_or(NEUTRAL_CLASS) {
        ClassRank::Top => 10.0,
        ClassRank::UpperMid => 7.0,
        ClassRank::LowerMid => 4.0,
        ClassRank::Bottom => 1.0,
    }
}

/// Scores an entrant from lane, win rates, equipment and class.
#[must_use]
pub fn score_baseline(entrant: &Entrant) -> BaselineScores {
    let lane = lane_points(entrant.lane);
    let competitor = competitor_points(entrant.win_rate, entrant.local_win_rate);
    let equipment = equipment_points(entrant.equipment_second_rate);
    let class = class_points(entrant.class_rank);
    BaselineScores {
        lane,
        competitor,
        equipment,
        class,
        total: lane + competitor + equipment + class,
    }
}
