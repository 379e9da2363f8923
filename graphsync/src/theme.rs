//! Color theme classes of the host.
//!
//! The graph only cares whether the host is dark or light: the component
//! re-renders its lane colors on a class change, so only that triggers a full
//! state refresh. Switching between two dark themes does not.

use log::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThemeKind {
    Dark,
    Light,
    HighContrastDark,
    HighContrastLight,
}

impl ThemeKind {
    pub fn is_dark(self) -> bool {
        matches!(self, ThemeKind::Dark | ThemeKind::HighContrastDark)
    }

    pub fn is_light(self) -> bool {
        !self.is_dark()
    }

    /// Whether both themes render the graph the same way.
    pub fn same_class(self, other: ThemeKind) -> bool {
        self.is_dark() == other.is_dark()
    }

    /// Resolves a theme name reported by the host.
    ///
    /// Unknown names fall back to `Dark` so a typo never blocks a refresh. The
    /// fallback is logged, not an error.
    pub fn from_name(name: &str) -> Self {
        match name {
            "dark" => ThemeKind::Dark,
            "light" => ThemeKind::Light,
            "high-contrast" | "high-contrast-dark" => ThemeKind::HighContrastDark,
            "high-contrast-light" => ThemeKind::HighContrastLight,
            other => {
                warn!("unknown theme '{other}', falling back to 'dark'");
                ThemeKind::Dark
            }
        }
    }
}
