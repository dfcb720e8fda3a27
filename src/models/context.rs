use serde::{Deserialize, Serialize};

/// Identity of a desktop application as reported by the OS activation
/// notification. `bundle_id` is absent for processes without a bundle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AppIdentity {
    pub app_name: String,
    pub bundle_id: Option<String>,
}

impl AppIdentity {
    pub fn new(app_name: impl Into<String>, bundle_id: Option<String>) -> Self {
        Self {
            app_name: app_name.into(),
            bundle_id,
        }
    }

    /// Two identities match when the bundle id matches, falling back to the
    /// display name when either side has no bundle.
    pub fn same_app(&self, other: &AppIdentity) -> bool {
        match (&self.bundle_id, &other.bundle_id) {
            (Some(a), Some(b)) => a == b,
            _ => self.app_name == other.app_name,
        }
    }
}

/// Browser-specific fields, present only when the focused target is a
/// browser with an extractable tab. Grouped so url/tabTitle/tabCount are
/// either all meaningful or all absent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BrowserContext {
    pub url: String,
    pub tab_title: Option<String>,
    pub tab_count: Option<u32>,
}

/// Transient snapshot of the focused target. Produced fresh by the
/// `ContextReader` on every observation; never persisted directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FocusContext {
    pub app: AppIdentity,
    pub window_title: String,
    pub browser: Option<BrowserContext>,
    pub document_path: Option<String>,
    pub is_full_screen: bool,
    pub is_minimized: bool,
}

impl FocusContext {
    /// Minimal context for a target the reader could extract nothing from.
    pub fn bare(app: AppIdentity) -> Self {
        Self {
            app,
            window_title: String::new(),
            browser: None,
            document_path: None,
            is_full_screen: false,
            is_minimized: false,
        }
    }

    pub fn url(&self) -> Option<&str> {
        self.browser.as_ref().map(|b| b.url.as_str())
    }
}
