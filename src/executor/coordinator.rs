// Model-space → screen mapping for every gesture kind.
use crate::executor::dispatcher::CalibratedAction;
use crate::perception::types::CalibrationTransform;
use crate::protocol::{Action, ActionKind};

/// Fraction of the surface covered by a swipe.
const SWIPE_FRACTION: f64 = 0.3;

pub fn calibrate(action: &Action, transform: &CalibrationTransform) -> CalibratedAction {
    let mapped = action.point().map(|(x, y)| transform.to_screen(x, y));
    let (point, end_point) = match action.kind {
        ActionKind::Click | ActionKind::LongPress => (mapped, None),
        ActionKind::Drag => (mapped, action.end_point().map(|(x, y)| transform.to_screen(x, y))),
        ActionKind::Scroll => (Some(mapped.unwrap_or_else(|| transform.center())), None),
        ActionKind::Swipe => {
            let start = mapped.unwrap_or_else(|| transform.center());
            let end = action
                .text("direction")
                .map(|dir| swipe_end(start, dir, transform));
            (Some(start), end)
        }
        ActionKind::Type
        | ActionKind::Hotkey
        | ActionKind::Wait
        | ActionKind::Finished
        | ActionKind::Failed
        | ActionKind::CallUser => (None, None),
    };
    CalibratedAction {
        action: action.clone(),
        point,
        end_point,
    }
}

/// Finger travel for a swipe; "up" moves the finger towards the top of the surface.
fn swipe_end(start: (f64, f64), direction: &str, t: &CalibrationTransform) -> (f64, f64) {
    let dx = t.width * SWIPE_FRACTION;
    let dy = t.height * SWIPE_FRACTION;
    let (x, y) = match direction {
        "up" => (start.0, start.1 - dy),
        "down" => (start.0, start.1 + dy),
        "left" => (start.0 - dx, start.1),
        _ => (start.0 + dx, start.1),
    };
    (
        x.clamp(t.origin_x, t.origin_x + t.width),
        y.clamp(t.origin_y, t.origin_y + t.height),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinateSpace;

    fn transform() -> CalibrationTransform {
        CalibrationTransform {
            origin_x: 0.0,
            origin_y: 0.0,
            width: 400.0,
            height: 1000.0,
            scale_factor: 1.0,
            space: CoordinateSpace::Auto,
            coord_factor: 1000.0,
        }
    }

    #[test]
    fn click_is_mapped_through_the_transform() {
        let action = Action::new(ActionKind::Click).with_number("x", 0.5).with_number("y", 0.3);
        let c = calibrate(&action, &transform());
        assert_eq!(c.point, Some((200.0, 300.0)));
        assert_eq!(c.end_point, None);
    }

    #[test]
    fn drag_maps_both_ends() {
        let action = Action::new(ActionKind::Drag)
            .with_number("x", 100.0)
            .with_number("y", 100.0)
            .with_number("x2", 900.0)
            .with_number("y2", 500.0);
        let c = calibrate(&action, &transform());
        assert_eq!(c.point, Some((40.0, 100.0)));
        assert_eq!(c.end_point, Some((360.0, 500.0)));
    }

    #[test]
    fn swipe_without_point_starts_at_centre() {
        let action = Action::new(ActionKind::Swipe).with_text("direction", "up");
        let c = calibrate(&action, &transform());
        assert_eq!(c.point, Some((200.0, 500.0)));
        assert_eq!(c.end_point, Some((200.0, 200.0)));
    }

    #[test]
    fn capitalised_swipe_direction_moves_up() {
        let action = crate::protocol::parser::parse_action("swipe(direction='Up')").unwrap();
        let c = calibrate(&action, &transform());
        assert_eq!(c.end_point, Some((200.0, 200.0)));
    }

    #[test]
    fn keyboard_actions_carry_no_points() {
        let action = Action::new(ActionKind::Type).with_text("content", "hi");
        let c = calibrate(&action, &transform());
        assert!(c.point.is_none() && c.end_point.is_none());
    }
}
