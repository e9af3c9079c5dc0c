use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    #[default]
    Primary,
    Secondary,
}

impl Channel {
    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::Primary => Self::Secondary,
            Self::Secondary => Self::Primary,
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Primary => "CH1",
            Self::Secondary => "CH2",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerPreferences {
    pub muted: bool,
    pub active_channel: Channel,
}

/// Cloneable handle to the one preference value all sessions share.
#[derive(Debug, Clone)]
pub struct SharedPreferences {
    tx: Arc<watch::Sender<ViewerPreferences>>,
}

impl SharedPreferences {
    #[must_use]
    pub fn new(initial: ViewerPreferences) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    #[must_use]
    pub fn get(&self) -> ViewerPreferences {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ViewerPreferences> {
        self.tx.subscribe()
    }

    /// Flips the mute flag and returns the new value.
    pub fn toggle_muted(&self) -> bool {
        let mut muted = false;
        self.tx.send_modify(|prefs| {
            prefs.muted = !prefs.muted;
            muted = prefs.muted;
        });
        muted
    }

    pub fn set_channel(&self, channel: Channel) {
        self.tx.send_if_modified(|prefs| {
            if prefs.active_channel == channel {
                return false;
            }
            prefs.active_channel = channel;
            true
        });
    }
}

impl Default for SharedPreferences {
    fn default() -> Self {
        Self::new(ViewerPreferences::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toggles_are_visible_to_every_handle() {
        let prefs = SharedPreferences::default();
        let other = prefs.clone();
        assert!(prefs.toggle_muted());
        assert!(other.get().muted);
        other.set_channel(Channel::Secondary);
        assert_eq!(prefs.get().active_channel, Channel::Secondary);
    }

    #[test]
    fn subscribers_are_notified_only_on_real_change() {
        let prefs = SharedPreferences::default();
        let mut rx = prefs.subscribe();
        prefs.set_channel(Channel::Primary);
        assert!(!rx.has_changed().unwrap());
        prefs.toggle_muted();
        assert!(rx.has_changed().unwrap());
        assert!(rx.borrow_and_update().muted);
    }

    #[test]
    fn preferences_round_trip_through_json() {
        let prefs = ViewerPreferences {
            muted: true,
            active_channel: Channel::Secondary,
        };
        let json = serde_json::to_string(&prefs).unwrap();
        assert_eq!(json, r#"{"muted":true,"active_channel":"secondary"}"#);
        let empty: ViewerPreferences = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ViewerPreferences::default());
    }
}
