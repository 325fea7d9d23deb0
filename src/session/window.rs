//! Pure window math for sliding-window generation sessions.
//!
//! Units are 1-based page indices. The window is the contiguous range
//! around the reader's position that should have cache coverage.

use std::collections::BTreeSet;

/// Units kept warm behind the reading position.
pub const WINDOW_BEFORE: i32 = 2;
/// Units kept warm ahead of the reading position.
pub const WINDOW_AFTER: i32 = 5;
/// Navigation distance beyond which the window is rebuilt instead of slid.
pub const JUMP_THRESHOLD: i32 = 10;

/// Offsets from the current unit in generation priority order: the current
/// unit first, then forward-biased neighbors. Covers the full
/// `[-WINDOW_BEFORE, +WINDOW_AFTER]` span.
pub const PRIORITY_OFFSETS: [i32; 8] = [0, 1, -1, 2, 3, -2, 4, 5];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: i32,
    pub end: i32,
}

impl Window {
    pub fn contains(&self, unit: i32) -> bool {
        unit >= self.start && unit <= self.end
    }

    pub fn len(&self) -> i32 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationAction {
    Extend,
    Jump,
}

/// Window centered on `current_unit`, clamped to `[1, total_units]`.
pub fn calculate_window(current_unit: i32, total_units: i32) -> Window {
    let total = total_units.max(1);
    let current = current_unit.clamp(1, total);
    Window {
        start: (current - WINDOW_BEFORE).max(1),
        end: (current + WINDOW_AFTER).min(total),
    }
}

pub fn is_jump(from_unit: i32, to_unit: i32) -> bool {
    (from_unit - to_unit).abs() > JUMP_THRESHOLD
}

pub fn classify_navigation(from_unit: i32, to_unit: i32) -> NavigationAction {
    if is_jump(from_unit, to_unit) {
        NavigationAction::Jump
    } else {
        NavigationAction::Extend
    }
}

/// Units needing generation, in priority order: candidates are taken from
/// [`PRIORITY_OFFSETS`] around `center_unit`, kept only when inside the
/// window and not already completed or in progress.
pub fn pages_to_generate(
    window: Window,
    completed: &BTreeSet<i32>,
    in_progress: &BTreeSet<i32>,
    center_unit: i32,
) -> Vec<i32> {
    PRIORITY_OFFSETS
        .iter()
        .map(|offset| center_unit + offset)
        .filter(|unit| window.contains(*unit))
        .filter(|unit| !completed.contains(unit) && !in_progress.contains(unit))
        .collect()
}

/// In-progress units that fell outside the new window bounds; all of them
/// are canceled, order carries no meaning.
pub fn pages_to_cancel(new_window: Window, in_progress: &BTreeSet<i32>) -> Vec<i32> {
    in_progress
        .iter()
        .copied()
        .filter(|unit| !new_window.contains(*unit))
        .collect()
}
