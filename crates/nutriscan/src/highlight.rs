//! In-page highlighting of the nodes that produced each field.
//!
//! A [`HighlightPlan`] is built from a detached [`ProvenanceSummary`] and
//! rendered to a self-contained script for the page's JavaScript context.
//! The script resolves each node by its CSS path at run time, so nodes that
//! vanished or were detached since extraction are skipped instead of
//! raising. The script evaluates to the number of nodes highlighted.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{Field, ProvenanceSummary};

pub const HIGHLIGHT_CLASS: &str = "nutriscan-highlight";
pub const LABEL_CLASS: &str = "nutriscan-label";
pub const STYLE_ELEMENT_ID: &str = "nutriscan-highlight-styles";

/// How long field labels stay on the page.
pub const DEFAULT_LABEL_DURATION: Duration = Duration::from_millis(7000);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightTarget {
    pub field: Field,
    pub label: String,
    pub selector: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HighlightPlan {
    pub targets: Vec<HighlightTarget>,
    pub label_duration_ms: u64,
}

impl HighlightPlan {
    pub fn from_summary(summary: &ProvenanceSummary, label_duration: Duration) -> Self {
        let targets = summary
            .iter()
            .map(|(field, info)| HighlightTarget {
                field: *field,
                label: field.label().to_string(),
                selector: info.selector_path.clone(),
            })
            .collect();
        Self {
            targets,
            label_duration_ms: label_duration.as_millis() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn render_script(&self) -> String {
        let targets = serde_json::to_string(&self.targets).unwrap_or_else(|_| "[]".to_string());
        format!(
            r#"(() => {{
  const targets = {targets};
  const duration = {duration};
  if (!document.getElementById('{style_id}')) {{
    const style = document.createElement('style');
    style.id = '{style_id}';
    style.textContent = `
      .{hl} {{
        background-color: rgba(255, 255, 0, 0.5) !important;
        border: 1px solid #ff9900 !important;
        box-shadow: 0 0 5px #ff9900 !important;
      }}
      .{label} {{
        position: absolute;
        background: #ff9900;
        color: white;
        padding: 2px 5px;
        border-radius: 3px;
        font-size: 12px;
        z-index: 10000;
        pointer-events: none;
      }}`;
    (document.head || document.documentElement).appendChild(style);
  }}
  let count = 0;
  for (const target of targets) {{
    try {{
      const el = document.querySelector(target.selector);
      if (!el || !el.isConnected) continue;
      el.classList.add('{hl}');
      if (el.style) {{
        el.style.setProperty('background-color', 'rgba(255, 255, 0, 0.5)', 'important');
      }}
      const tag = document.createElement('span');
      tag.className = '{label}';
      tag.textContent = target.label;
      const rect = el.getBoundingClientRect();
      tag.style.top = (window.scrollY + rect.top - 20) + 'px';
      tag.style.left = (window.scrollX + rect.left) + 'px';
      (document.body || document.documentElement).appendChild(tag);
      setTimeout(() => tag.remove(), duration);
      count += 1;
    }} catch (e) {{
      // Node became unusable between lookup and styling.
    }}
  }}
  return count;
}})()"#,
            targets = targets,
            duration = self.label_duration_ms,
            style_id = STYLE_ELEMENT_ID,
            hl = HIGHLIGHT_CLASS,
            label = LABEL_CLASS,
        )
    }
}
