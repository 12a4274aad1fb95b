// Input state
//
// Window-system independent keyboard and mouse state. The window loop feeds
// events in; participants read it during update. Presses are edge-triggered
// and cleared by `end_frame`.

use std::collections::HashSet;

use crate::error::LogicError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Key {
    W,
    A,
    S,
    D,
    Q,
    E,
    Space,
    Shift,
    Control,
    Escape,
    Tab,
    Enter,
    Up,
    Down,
    Left,
    Right,
    PageUp,
    PageDown,
    F(u8),
}

impl Key {
    /// Parse a key name as written in config.toml ("Escape", "F1", "W", ...).
    pub fn from_name(name: &str) -> Result<Key, LogicError> {
        let key = match name.to_ascii_lowercase().as_str() {
            "w" => Key::W,
            "a" => Key::A,
            "s" => Key::S,
            "d" => Key::D,
            "q" => Key::Q,
            "e" => Key::E,
            "space" => Key::Space,
            "shift" => Key::Shift,
            "control" | "ctrl" => Key::Control,
            "escape" | "esc" => Key::Escape,
            "tab" => Key::Tab,
            "enter" | "return" => Key::Enter,
            "up" => Key::Up,
            "down" => Key::Down,
            "left" => Key::Left,
            "right" => Key::Right,
            "pageup" => Key::PageUp,
            "pagedown" => Key::PageDown,
            other => match other.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
                Some(n @ 1..=12) => Key::F(n),
                _ => return Err(LogicError::InvalidConfig(format!("unknown key '{}'", name))),
            },
        };
        Ok(key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

#[derive(Debug, Default)]
pub struct InputState {
    held: HashSet<Key>,
    pressed: HashSet<Key>,
    buttons: HashSet<MouseButton>,
    mouse_delta: (f32, f32),
    scroll_delta: f32,
    close_requested: bool,
}

impl InputState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_down(&mut self, key: Key) {
        // Auto-repeat doesn't count as a new press
        if self.held.insert(key) {
            self.pressed.insert(key);
        }
    }

    pub fn key_up(&mut self, key: Key) {
        self.held.remove(&key);
    }

    pub fn button_down(&mut self, button: MouseButton) {
        self.buttons.insert(button);
    }

    pub fn button_up(&mut self, button: MouseButton) {
        self.buttons.remove(&button);
    }

    pub fn mouse_moved(&mut self, dx: f32, dy: f32) {
        self.mouse_delta.0 += dx;
        self.mouse_delta.1 += dy;
    }

    pub fn scrolled(&mut self, delta: f32) {
        self.scroll_delta += delta;
    }

    pub fn request_close(&mut self) {
        self.close_requested = true;
    }

    /// Went down since the last frame.
    pub fn pressed(&self, key: Key) -> bool {
        self.pressed.contains(&key)
    }

    pub fn held(&self, key: Key) -> bool {
        self.held.contains(&key)
    }

    pub fn button_held(&self, button: MouseButton) -> bool {
        self.buttons.contains(&button)
    }

    /// Mouse movement accumulated this frame, in pixels.
    pub fn mouse_delta(&self) -> (f32, f32) {
        self.mouse_delta
    }

    pub fn scroll_delta(&self) -> f32 {
        self.scroll_delta
    }

    pub fn close_requested(&self) -> bool {
        self.close_requested
    }

    /// Consume a press so later readers in the same frame don't see it.
    pub fn consume_press(&mut self, key: Key) -> bool {
        self.pressed.remove(&key)
    }

    pub fn end_frame(&mut self) {
        self.pressed.clear();
        self.mouse_delta = (0.0, 0.0);
        self.scroll_delta = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presses_are_edge_triggered() {
        let mut input = InputState::new();
        input.key_down(Key::Escape);
        assert!(input.pressed(Key::Escape));
        input.end_frame();

        // Still held, repeat events don't re-trigger
        input.key_down(Key::Escape);
        assert!(!input.pressed(Key::Escape));
        assert!(input.held(Key::Escape));

        input.key_up(Key::Escape);
        input.key_down(Key::Escape);
        assert!(input.pressed(Key::Escape));
    }

    #[test]
    fn mouse_motion_accumulates_per_frame() {
        let mut input = InputState::new();
        input.mouse_moved(2.0, 1.0);
        input.mouse_moved(3.0, -4.0);
        assert_eq!(input.mouse_delta(), (5.0, -3.0));
        input.end_frame();
        assert_eq!(input.mouse_delta(), (0.0, 0.0));
    }

    #[test]
    fn key_names() {
        assert_eq!(Key::from_name("Escape"), Ok(Key::Escape));
        assert_eq!(Key::from_name("F11"), Ok(Key::F(11)));
        assert_eq!(Key::from_name("pageup"), Ok(Key::PageUp));
        assert!(Key::from_name("F13").is_err());
        assert!(Key::from_name("Hyper").is_err());
    }
}
