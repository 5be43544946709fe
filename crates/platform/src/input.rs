//! Input handling for keyboard and mouse.

use std::collections::HashSet;

pub use winit::keyboard::KeyCode;

/// Mouse button identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    /// Back, forward and vendor buttons.
    Other,
}

impl From<winit::event::MouseButton> for MouseButton {
    fn from(button: winit::event::MouseButton) -> Self {
        match button {
            winit::event::MouseButton::Left => MouseButton::Left,
            winit::event::MouseButton::Right => MouseButton::Right,
            winit::event::MouseButton::Middle => MouseButton::Middle,
            _ => MouseButton::Other,
        }
    }
}

/// Tracks the current state of keyboard and mouse input.
#[derive(Debug, Default)]
pub struct InputState {
    /// Currently pressed keys
    pressed_keys: HashSet<KeyCode>,
    /// Keys that were just pressed this frame
    just_pressed_keys: HashSet<KeyCode>,
    /// Keys that were just released this frame
    just_released_keys: HashSet<KeyCode>,

    /// Currently pressed mouse buttons
    pressed_buttons: HashSet<MouseButton>,
    /// Mouse buttons that were just pressed this frame
    just_pressed_buttons: HashSet<MouseButton>,
    /// Mouse buttons that were just released this frame
    just_released_buttons: HashSet<MouseButton>,

    /// Current mouse position
    mouse_position: (f32, f32),
    /// Mouse movement delta since last frame
    mouse_delta: (f32, f32),
    /// Mouse scroll delta since last frame
    scroll_delta: (f32, f32),
    /// A cursor position has been seen
    has_position: bool,
}

impl InputState {
    /// Create a new input state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Call at the beginning of each frame to clear per-frame state.
    pub fn begin_frame(&mut self) {
        self.just_pressed_keys.clear();
        self.just_released_keys.clear();
        self.just_pressed_buttons.clear();
        self.just_released_buttons.clear();
        self.mouse_delta = (0.0, 0.0);
        self.scroll_delta = (0.0, 0.0);
    }

    /// Handle a key press event.
    pub fn on_key_pressed(&mut self, key: KeyCode) {
        if self.pressed_keys.insert(key) {
            self.just_pressed_keys.insert(key);
        }
    }

    /// Handle a key release event.
    pub fn on_key_released(&mut self, key: KeyCode) {
        if self.pressed_keys.remove(&key) {
            self.just_released_keys.insert(key);
        }
    }

    /// Handle a mouse button press event.
    pub fn on_mouse_pressed(&mut self, button: MouseButton) {
        if self.pressed_buttons.insert(button) {
            self.just_pressed_buttons.insert(button);
        }
    }

    /// Handle a mouse button release event.
    pub fn on_mouse_released(&mut self, button: MouseButton) {
        if self.pressed_buttons.remove(&button) {
            self.just_released_buttons.insert(button);
        }
    }

    /// Handle cursor movement. Deltas accumulate until the next
    /// [`begin_frame`](Self::begin_frame); the first event only records the
    /// position.
    pub fn on_mouse_moved(&mut self, x: f32, y: f32) {
        if self.has_position {
            let old = self.mouse_position;
            self.mouse_delta.0 += x - old.0;
            self.mouse_delta.1 += y - old.1;
        }
        self.mouse_position = (x, y);
        self.has_position = true;
    }

    /// Handle mouse scroll, in lines. Accumulates until the next frame.
    pub fn on_scroll(&mut self, delta_x: f32, delta_y: f32) {
        self.scroll_delta.0 += delta_x;
        self.scroll_delta.1 += delta_y;
    }

    /// Check if a key is currently pressed.
    pub fn is_key_pressed(&self, key: KeyCode) -> bool {
        self.pressed_keys.contains(&key)
    }

    /// Check if a key was just pressed this frame.
    pub fn is_key_just_pressed(&self, key: KeyCode) -> bool {
        self.just_pressed_keys.contains(&key)
    }

    /// Check if a key was just released this frame.
    pub fn is_key_just_released(&self, key: KeyCode) -> bool {
        self.just_released_keys.contains(&key)
    }

    /// Check if a mouse button is currently pressed.
    pub fn is_mouse_pressed(&self, button: MouseButton) -> bool {
        self.pressed_buttons.contains(&button)
    }

    /// Check if a mouse button was just released this frame.
    pub fn is_mouse_just_released(&self, button: MouseButton) -> bool {
        self.just_released_buttons.contains(&button)
    }

    /// Check if a mouse button was just pressed this frame.
    pub fn is_mouse_just_pressed(&self, button: MouseButton) -> bool {
        self.just_pressed_buttons.contains(&button)
    }

    /// Get the current mouse position.
    pub fn mouse_position(&self) -> (f32, f32) {
        self.mouse_position
    }

    /// Get the mouse movement delta since last frame.
    pub fn mouse_delta(&self) -> (f32, f32) {
        self.mouse_delta
    }

    /// Get the scroll delta since last frame.
    pub fn scroll_delta(&self) -> (f32, f32) {
        self.scroll_delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_edges_last_one_frame() {
        let mut input = InputState::new();
        input.on_key_pressed(KeyCode::Space);
        assert!(input.is_key_just_pressed(KeyCode::Space));
        input.on_key_pressed(KeyCode::Space);
        input.begin_frame();
        assert!(input.is_key_pressed(KeyCode::Space));
        assert!(!input.is_key_just_pressed(KeyCode::Space));
        input.on_key_released(KeyCode::Space);
        assert!(input.is_key_just_released(KeyCode::Space));
        assert!(!input.is_key_pressed(KeyCode::Space));
    }

    #[test]
    fn test_mouse_delta_accumulates_within_frame() {
        let mut input = InputState::new();
        input.on_mouse_moved(10.0, 10.0);
        assert_eq!(input.mouse_delta(), (0.0, 0.0));
        input.on_mouse_moved(12.0, 15.0);
        input.on_mouse_moved(20.0, 14.0);
        assert_eq!(input.mouse_delta(), (10.0, 4.0));
        input.begin_frame();
        assert_eq!(input.mouse_delta(), (0.0, 0.0));
        assert_eq!(input.mouse_position(), (20.0, 14.0));
    }

    #[test]
    fn test_scroll_accumulates_within_frame() {
        let mut input = InputState::new();
        input.on_scroll(0.0, 1.0);
        input.on_scroll(0.0, 2.0);
        assert_eq!(input.scroll_delta(), (0.0, 3.0));
        input.begin_frame();
        assert_eq!(input.scroll_delta(), (0.0, 0.0));
    }

    #[test]
    fn test_mouse_buttons() {
        let mut input = InputState::new();
        input.on_mouse_pressed(MouseButton::Left);
        assert!(input.is_mouse_pressed(MouseButton::Left));
        assert!(input.is_mouse_just_pressed(MouseButton::Left));
        input.begin_frame();
        input.on_mouse_released(MouseButton::Left);
        assert!(!input.is_mouse_pressed(MouseButton::Left));
        assert!(input.is_mouse_just_released(MouseButton::Left));
    }
}
