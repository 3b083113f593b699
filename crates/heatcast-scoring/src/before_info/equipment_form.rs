use heatcast_domain::Channel;

use super::{BeforeInfoStage, StageInput, StageOutcome};

/// Motor-form coefficient by course, inner courses lean on the motor most.
pub const COURSE_COEFFICIENT: [f64; 6] = [1.30, 1.10, 1.00, 0.90, 0.80, 0.80];

#[must_use]
pub fn course_coefficient(course: u8) -> f64 {
    usize::from(course)
        .checked_sub(1)
        .and_then(|index| COURSE_COEFFICIENT.get(index))
        .copied()
        .unwrap_or(1.0)
}

/// Current motor form from its second-place rate band.
pub struct EquipmentFormStage;

impl BeforeInfoStage for EquipmentFormStage {
    fn channel(&self) -> Channel {
        Channel::EquipmentForm
    }

    fn evaluate(&self, input: &StageInput<'_>) -> StageOutcome {
        input
            .entrant
            .equipment_second_rate
            .and_then(|rate| input.tables.motor_form_points(rate))
            .map_or_else(StageOutcome::unavailable, |points| {
                StageOutcome::scored(points * course_coefficient(input.course()))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::before_info::test_support::entrant;
    use crate::before_info::HeatContext;
    use heatcast_domain::BeforeInfoSnapshot;
    use heatcast_tables::{EmptyTables, StaticTables};

    #[test]
    fn hot_motor_on_lane_one_scales_by_course() {
        let snapshot = BeforeInfoSnapshot::default();
        let heat = HeatContext::new(24, &snapshot);
        let mut hot = entrant(1);
        hot.equipment_second_rate = Some(50.0);
        let tables = StaticTables::builtin_v1();
        let input = crate::before_info::StageInput {
            entrant: &hot,
            entry: None,
            heat: &heat,
            tables: &tables,
        };
        let outcome = EquipmentFormStage.evaluate(&input);
        assert!(outcome.available);
        assert!((outcome.score - 3.9).abs() < 1e-9);
    }

    #[test]
    fn missing_table_is_unavailable() {
        let snapshot = BeforeInfoSnapshot::default();
        let heat = HeatContext::new(24, &snapshot);
        let input = crate::before_info::StageInput {
            entrant: &entrant(2),
            entry: None,
            heat: &heat,
            tables: &EmptyTables,
        };
        assert!(!EquipmentFormStage.evaluate(&input).available);
    }
}
