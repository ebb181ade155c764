//! Line listeners and touch callbacks.
//!
//! Callbacks run on the notification path and must return quickly.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Script that makes the device print a marker line on every touch.
pub const TOUCH_CALLBACK_COMMAND: &str = "
import touch
touch.callback(touch.A, lambda x: print(\"[EVENT:touch-A]\"))
touch.callback(touch.B, lambda x: print(\"[EVENT:touch-B]\"))
";

/// One of the two capacitive touch pads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TouchPad {
    A,
    B,
}

impl TouchPad {
    /// Marker printed by the device when this pad is touched.
    #[must_use]
    pub const fn marker(self) -> &'static str {
        match self {
            Self::A => "[EVENT:touch-A]",
            Self::B => "[EVENT:touch-B]",
        }
    }

    /// Returns every pad whose marker appears in `line`.
    pub fn detect(line: &str) -> impl Iterator<Item = Self> + '_ {
        [Self::A, Self::B]
            .into_iter()
            .filter(move |pad| line.contains(pad.marker()))
    }
}

/// Token returned by [`Listeners::add_line_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Callback for complete lines.
pub type LineCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Callback for touch events.
pub type TouchCallback = Arc<dyn Fn() + Send + Sync>;

/// Registered line listeners and touch callbacks.
#[derive(Default)]
pub struct Listeners {
    next_id: u64,
    lines: BTreeMap<ListenerId, LineCallback>,
    touch_enabled: bool,
    touch_a: Option<TouchCallback>,
    touch_b: Option<TouchCallback>,
}

impl Listeners {
    /// Adds a line listener, returning the token that removes it.
    pub fn add_line_listener(&mut self, listener: LineCallback) -> ListenerId {
        self.next_id += 1;
        let id = ListenerId(self.next_id);
        tracing::info!("installing line listener id {}", id);
        self.lines.insert(id, listener);
        id
    }

    /// Removes a line listener. Returns false for an unknown token.
    pub fn remove_line_listener(&mut self, id: ListenerId) -> bool {
        tracing::info!("removing line listener id {}", id);
        self.lines.remove(&id).is_some()
    }

    /// Line listeners in registration order.
    #[must_use]
    pub fn line_listeners(&self) -> Vec<LineCallback> {
        self.lines.values().cloned().collect()
    }

    /// Turns on touch marker detection.
    ///
    /// Returns false if it was already on.
    pub fn enable_touch(&mut self) -> bool {
        !std::mem::replace(&mut self.touch_enabled, true)
    }

    /// Returns true once touch detection has been enabled.
    #[must_use]
    pub const fn touch_enabled(&self) -> bool {
        self.touch_enabled
    }

    /// Sets or clears the callback for a pad.
    pub fn set_touch_callback(&mut self, pad: TouchPad, callback: Option<TouchCallback>) {
        match pad {
            TouchPad::A => self.touch_a = callback,
            TouchPad::B => self.touch_b = callback,
        }
    }

    /// Returns the callback for a pad.
    #[must_use]
    pub fn touch_callback(&self, pad: TouchPad) -> Option<TouchCallback> {
        match pad {
            TouchPad::A => self.touch_a.clone(),
            TouchPad::B => self.touch_b.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_markers() {
        assert_eq!(TouchPad::detect("[EVENT:touch-A]").collect::<Vec<_>>(), vec![TouchPad::A]);
        assert_eq!(TouchPad::detect(">>> [EVENT:touch-B]").collect::<Vec<_>>(), vec![TouchPad::B]);
        assert_eq!(TouchPad::detect("touch").count(), 0);
    }

    #[test]
    fn test_listener_ids_are_unique() {
        let mut listeners = Listeners::default();
        let first = listeners.add_line_listener(Arc::new(|_: &str| {}));
        let second = listeners.add_line_listener(Arc::new(|_: &str| {}));
        assert_ne!(first, second);
        assert_eq!(listeners.line_listeners().len(), 2);

        assert!(listeners.remove_line_listener(first));
        assert!(!listeners.remove_line_listener(first));
        assert_eq!(listeners.line_listeners().len(), 1);
    }

    #[test]
    fn test_enable_touch_once() {
        let mut listeners = Listeners::default();
        assert!(!listeners.touch_enabled());
        assert!(listeners.enable_touch());
        assert!(!listeners.enable_touch());
        assert!(listeners.touch_enabled());
    }

    #[test]
    fn test_touch_callbacks() {
        let mut listeners = Listeners::default();
        listeners.set_touch_callback(TouchPad::A, Some(Arc::new(|| {})));
        assert!(listeners.touch_callback(TouchPad::A).is_some());
        assert!(listeners.touch_callback(TouchPad::B).is_none());

        listeners.set_touch_callback(TouchPad::A, None);
        assert!(listeners.touch_callback(TouchPad::A).is_none());
    }
}
