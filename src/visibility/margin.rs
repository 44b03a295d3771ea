//! Responsive intersection margins.

use serde::{Deserialize, Serialize};

/// One row of the margin table: viewports up to `max_width` pixels wide use
/// `margin_px`. `u32::MAX` stands for an unbounded width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarginBreakpoint {
    pub max_width: u32,
    pub margin_px: u32,
}

impl MarginBreakpoint {
    pub const fn new(max_width: u32, margin_px: u32) -> Self {
        Self {
            max_width,
            margin_px,
        }
    }

    /// A breakpoint matching every width.
    pub const fn unbounded(margin_px: u32) -> Self {
        Self::new(u32::MAX, margin_px)
    }

    pub fn matches(&self, width: u32) -> bool {
        width <= self.max_width
    }

    /// Default table: phones through wide desktops.
    pub fn default_table() -> Vec<MarginBreakpoint> {
        vec![
            MarginBreakpoint::new(480, 200),
            MarginBreakpoint::new(768, 300),
            MarginBreakpoint::new(1024, 400),
            MarginBreakpoint::new(1440, 500),
            MarginBreakpoint::unbounded(600),
        ]
    }
}

/// Margin for a viewport `width`: the first breakpoint whose `max_width`
/// covers it, else `default_px`.
pub fn resolve_margin(breakpoints: &[MarginBreakpoint], width: u32, default_px: u32) -> u32 {
    breakpoints
        .iter()
        .find(|bp| bp.matches(width))
        .map_or(default_px, |bp| bp.margin_px)
}

/// CSS-style root margin string, e.g. `"300px"`.
pub fn margin_css(margin_px: u32) -> String {
    format!("{}px", margin_px)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_lookup() {
        let table = MarginBreakpoint::default_table();
        assert_eq!(resolve_margin(&table, 320, 500), 200);
        assert_eq!(resolve_margin(&table, 480, 500), 200);
        assert_eq!(resolve_margin(&table, 481, 500), 300);
        assert_eq!(resolve_margin(&table, 1024, 500), 400);
        assert_eq!(resolve_margin(&table, 1440, 500), 500);
        assert_eq!(resolve_margin(&table, 3840, 500), 600);
    }

    #[test]
    fn test_fallback_when_nothing_matches() {
        let table = [MarginBreakpoint::new(480, 200)];
        assert_eq!(resolve_margin(&table, 1920, 500), 500);
        assert_eq!(resolve_margin(&[], 100, 500), 500);
    }

    #[test]
    fn test_margin_css() {
        assert_eq!(margin_css(300), "300px");
    }
}
