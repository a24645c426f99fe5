//! Human interaction primitives.
//!
//! Every automated click and keystroke against the platform goes through
//! these helpers. Behavioral detection looks at trajectory shape and timing
//! variance, so the trajectory/delay math is kept pure (and unit-testable)
//! and only the thin dispatch layer touches CDP.

use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::input::{
    DispatchMouseEventParams, DispatchMouseEventType,
};
use chromiumoxide::{Element, Page};
use rand::Rng;
use tokio::time::sleep;

use crate::error::{EngineError, Result};

/// A 2D point in viewport coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Trajectory shape for mouse movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    /// Straight interpolation with small per-point jitter
    Linear,
    /// Quadratic Bezier with a randomly offset control point
    Bezier,
}

/// Typing behavior knobs.
#[derive(Debug, Clone)]
pub struct TypingStyle {
    /// Probability of typing an adjacent wrong key first, then correcting
    pub error_rate: f64,
    /// Base inter-character delay in milliseconds
    pub base_delay_ms: u64,
    /// Random spread applied around the base delay, in milliseconds
    pub speed_variance_ms: u64,
}

impl Default for TypingStyle {
    fn default() -> Self {
        Self {
            error_rate: 0.03,
            base_delay_ms: 90,
            speed_variance_ms: 60,
        }
    }
}

/// Generate the intermediate points of a mouse path. The current position
/// is unknown to CDP, so paths start from the viewport center.
pub fn plan_mouse_path(start: Point, target: Point, steps: usize, curve: Curve) -> Vec<Point> {
    if steps == 0 {
        return vec![start, target];
    }

    let mut rng = rand::thread_rng();
    let mut points = Vec::with_capacity(steps + 2);
    points.push(start);

    match curve {
        Curve::Linear => {
            for i in 1..=steps {
                let t = i as f64 / (steps + 1) as f64;
                points.push(Point::new(
                    start.x + (target.x - start.x) * t + rng.gen_range(-2.0..2.0),
                    start.y + (target.y - start.y) * t + rng.gen_range(-2.0..2.0),
                ));
            }
        }
        Curve::Bezier => {
            let mid = Point::new(
                (start.x + target.x) / 2.0 + rng.gen_range(-80.0..80.0),
                (start.y + target.y) / 2.0 + rng.gen_range(-80.0..80.0),
            );
            for i in 1..=steps {
                let t = i as f64 / (steps + 1) as f64;
                points.push(quadratic_bezier(t, start, mid, target));
            }
        }
    }

    points.push(target);
    points
}

fn quadratic_bezier(t: f64, p0: Point, p1: Point, p2: Point) -> Point {
    let mt = 1.0 - t;
    Point::new(
        mt * mt * p0.x + 2.0 * mt * t * p1.x + t * t * p2.x,
        mt * mt * p0.y + 2.0 * mt * t * p1.y + t * t * p2.y,
    )
}

/// Per-step sleep for a mouse path: randomized 8-50 ms.
pub fn step_delay() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(8..=50))
}

/// QWERTY neighbor for plausible typos. Unknown keys fall back to themselves.
pub fn adjacent_key(c: char) -> char {
    const ROWS: &[&str] = &["qwertyuiop", "asdfghjkl", "zxcvbnm", "1234567890"];

    let lower = c.to_ascii_lowercase();
    for row in ROWS {
        if let Some(idx) = row.find(lower) {
            let neighbor = if idx + 1 < row.len() {
                row.as_bytes()[idx + 1] as char
            } else {
                row.as_bytes()[idx - 1] as char
            };
            return if c.is_ascii_uppercase() {
                neighbor.to_ascii_uppercase()
            } else {
                neighbor
            };
        }
    }
    c
}

/// Delay before the next character: randomized around the base, longer
/// after a space (word boundary pause).
pub fn keystroke_delay(style: &TypingStyle, previous: Option<char>) -> Duration {
    let mut rng = rand::thread_rng();
    let spread = style.speed_variance_ms.max(1);
    let mut ms = style.base_delay_ms + rng.gen_range(0..spread);
    if previous == Some(' ') {
        ms += rng.gen_range(40..120);
    }
    Duration::from_millis(ms)
}

/// Center of the configured viewport. CDP exposes no cursor position, so
/// this is the assumed rest point paths start from.
pub fn viewport_center(width: u32, height: u32) -> Point {
    Point::new(width as f64 / 2.0, height as f64 / 2.0)
}

/// Move the mouse along a planned path, sleeping between steps.
pub async fn move_mouse(
    page: &Page,
    start: Point,
    target: Point,
    steps: usize,
    curve: Curve,
) -> Result<()> {
    let path = plan_mouse_path(start, target, steps, curve);

    for point in path {
        let params = DispatchMouseEventParams::builder()
            .r#type(DispatchMouseEventType::MouseMoved)
            .x(point.x)
            .y(point.y)
            .build()
            .map_err(EngineError::Cdp)?;
        page.execute(params)
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))?;
        sleep(step_delay()).await;
    }

    Ok(())
}

/// Type text into an already-focused element with humanized timing and
/// occasional corrected typos.
pub async fn type_text(element: &Element, text: &str, style: &TypingStyle) -> Result<()> {
    let rng_roll = || rand::thread_rng().gen::<f64>();
    let mut previous = None;

    for c in text.chars() {
        if rng_roll() < style.error_rate && c.is_ascii_alphanumeric() {
            let wrong = adjacent_key(c);
            element
                .type_str(wrong.to_string())
                .await
                .map_err(|e| EngineError::Cdp(e.to_string()))?;
            sleep(keystroke_delay(style, previous)).await;
            element
                .press_key("Backspace")
                .await
                .map_err(|e| EngineError::Cdp(e.to_string()))?;
            sleep(keystroke_delay(style, previous)).await;
        }

        element
            .type_str(c.to_string())
            .await
            .map_err(|e| EngineError::Cdp(e.to_string()))?;
        sleep(keystroke_delay(style, previous)).await;

        // Occasional thinking pause mid-field
        if rng_roll() < 0.05 {
            let variance = style.speed_variance_ms.max(1);
            let pause = 500 + rand::thread_rng().gen_range(0..variance);
            sleep(Duration::from_millis(pause)).await;
        }

        previous = Some(c);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_starts_and_ends_exactly() {
        let start = Point::new(100.0, 100.0);
        let target = Point::new(500.0, 300.0);

        for curve in [Curve::Linear, Curve::Bezier] {
            let path = plan_mouse_path(start, target, 10, curve);
            assert_eq!(path.len(), 12);
            assert_eq!(path[0], start);
            assert_eq!(path[11], target);
        }
    }

    #[test]
    fn zero_steps_degrades_to_endpoints() {
        let path = plan_mouse_path(Point::new(0.0, 0.0), Point::new(10.0, 10.0), 0, Curve::Linear);
        assert_eq!(path.len(), 2);
    }

    #[test]
    fn bezier_midpoints_stay_in_a_sane_envelope() {
        let start = Point::new(0.0, 0.0);
        let target = Point::new(400.0, 0.0);
        let path = plan_mouse_path(start, target, 20, Curve::Bezier);

        for p in &path {
            assert!(p.x >= -100.0 && p.x <= 500.0);
            assert!(p.y.abs() <= 200.0);
        }
    }

    #[test]
    fn step_delay_is_within_bounds() {
        for _ in 0..100 {
            let d = step_delay().as_millis();
            assert!((8..=50).contains(&d));
        }
    }

    #[test]
    fn viewport_center_halves_the_window() {
        assert_eq!(viewport_center(1920, 1080), Point::new(960.0, 540.0));
        assert_eq!(viewport_center(1366, 768), Point::new(683.0, 384.0));
    }

    #[test]
    fn adjacent_key_stays_on_the_keyboard() {
        assert_eq!(adjacent_key('q'), 'w');
        assert_eq!(adjacent_key('p'), 'o');
        assert_eq!(adjacent_key('A'), 'S');
        // Non-keyboard characters fall through unchanged
        assert_eq!(adjacent_key('@'), '@');
    }

    #[test]
    fn space_lengthens_the_next_keystroke() {
        let style = TypingStyle {
            error_rate: 0.0,
            base_delay_ms: 50,
            speed_variance_ms: 1,
        };

        let after_space = keystroke_delay(&style, Some(' '));
        let after_letter = keystroke_delay(&style, Some('a'));
        assert!(after_space > after_letter);
    }
}
