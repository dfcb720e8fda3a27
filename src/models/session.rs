use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{BrowserContext, FocusContext};

/// Persisted record of one focus target. A session is open-ended (active)
/// until it is finalized exactly once by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub app_name: String,
    pub bundle_id: Option<String>,
    pub window_title: String,
    pub browser: Option<BrowserContext>,
    pub document_path: Option<String>,
    pub is_full_screen: bool,
    pub is_minimized: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Zero while active. Finalization writes `end_time - start_time`, which
    /// may be negative under clock skew; stored as-is, clamped only for
    /// display.
    pub duration_ms: i64,
}

impl Session {
    /// Open a new active session from a focus snapshot at `at`.
    pub fn open(context: &FocusContext, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            app_name: context.app.app_name.clone(),
            bundle_id: context.app.bundle_id.clone(),
            window_title: context.window_title.clone(),
            browser: context.browser.clone(),
            document_path: context.document_path.clone(),
            is_full_screen: context.is_full_screen,
            is_minimized: context.is_minimized,
            start_time: at,
            end_time: at,
            duration_ms: 0,
        }
    }

    /// Active means open-ended: no duration yet and end pinned to start.
    pub fn is_active(&self) -> bool {
        self.duration_ms == 0 && self.start_time == self.end_time
    }

    /// Close the session at `at`. Called exactly once per session.
    ///
    /// A close landing in the same millisecond as the open would encode as
    /// `duration == 0`, which is the active marker; such sessions are
    /// nudged to 1 ms so finalized rows stay distinguishable.
    pub fn finalize(&mut self, at: DateTime<Utc>) {
        let mut duration_ms = (at - self.start_time).num_milliseconds();
        if duration_ms == 0 {
            duration_ms = 1;
        }
        self.end_time = self.start_time + chrono::Duration::milliseconds(duration_ms);
        self.duration_ms = duration_ms;
    }

    /// Duration suitable for rendering; negative skew shows as zero.
    pub fn display_duration_ms(&self) -> i64 {
        self.duration_ms.max(0)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::models::AppIdentity;

    fn ctx(app: &str) -> FocusContext {
        FocusContext::bare(AppIdentity::new(app, Some(format!("com.test.{app}"))))
    }

    #[test]
    fn new_session_is_active() {
        let now = Utc::now();
        let session = Session::open(&ctx("editor"), now);
        assert!(session.is_active());
        assert_eq!(session.start_time, session.end_time);
        assert_eq!(session.duration_ms, 0);
    }

    #[test]
    fn finalize_sets_end_and_duration() {
        // App A opens at t=1000s, user switches away at t=1045s.
        let start = Utc.timestamp_opt(1000, 0).unwrap();
        let end = Utc.timestamp_opt(1045, 0).unwrap();
        let mut session = Session::open(&ctx("a"), start);
        session.finalize(end);

        assert!(!session.is_active());
        assert_eq!(session.duration_ms, 45_000);
        assert_eq!(
            session.end_time,
            session.start_time + chrono::Duration::milliseconds(45_000)
        );
    }

    #[test]
    fn finalize_preserves_negative_duration_from_clock_skew() {
        let start = Utc.timestamp_opt(2000, 0).unwrap();
        let skewed = Utc.timestamp_opt(1990, 0).unwrap();
        let mut session = Session::open(&ctx("a"), start);
        session.finalize(skewed);

        assert_eq!(session.duration_ms, -10_000);
        assert_eq!(session.display_duration_ms(), 0);
        assert!(!session.is_active());
    }

    #[test]
    fn zero_length_finalize_is_nudged_off_the_active_marker() {
        let start = Utc.timestamp_opt(1000, 0).unwrap();
        let mut session = Session::open(&ctx("a"), start);
        session.finalize(start);

        assert_eq!(session.duration_ms, 1);
        assert!(!session.is_active());
        assert_eq!(
            session.end_time,
            session.start_time + chrono::Duration::milliseconds(1)
        );
    }

    #[test]
    fn same_app_falls_back_to_name_without_bundle() {
        let named = AppIdentity::new("Terminal", None);
        let bundled = AppIdentity::new("Terminal", Some("com.apple.Terminal".into()));
        assert!(named.same_app(&AppIdentity::new("Terminal", None)));
        assert!(named.same_app(&bundled));
        assert!(!bundled.same_app(&AppIdentity::new(
            "Terminal",
            Some("org.alacritty".into())
        )));
    }
}
