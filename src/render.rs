use std::fmt::Write as _;

use crossterm::style::{Color, Stylize};

use crate::config::DisplayConfig;
use crate::session::TodayTotals;
use crate::util::{context_percent, format_context_tokens, format_elapsed, truncate};

const GRAY: Color = rgb(64, 64, 64);
const GREEN: Color = rgb(152, 195, 121);
const CTX_GREEN: Color = rgb(108, 167, 108);
const CTX_GOLD: Color = rgb(188, 155, 83);
const CTX_RED: Color = rgb(185, 102, 82);

const BAR_WIDTH: u64 = 10;

const MODEL_STYLES: [(&str, Color, &str); 3] = [
    ("Opus", rgb(195, 158, 83), "💛"),
    ("Sonnet", rgb(118, 170, 185), "💠"),
    ("Haiku", rgb(255, 182, 193), "🌸"),
];

const fn rgb(r: u8, g: u8, b: u8) -> Color {
    Color::Rgb { r, g, b }
}

/// Everything one status line is built from. `None` hides a segment.
#[derive(Debug, Clone, Default)]
pub struct StatusLine {
    pub model: String,
    pub project: String,
    pub branch: Option<String>,
    pub context_tokens: Option<u64>,
    pub today: Option<TodayTotals>,
    pub excerpt: Option<String>,
}

pub struct Renderer<'a> {
    display: &'a DisplayConfig,
    budget_tokens: u64,
    color: bool,
}

impl<'a> Renderer<'a> {
    pub fn new(display: &'a DisplayConfig, budget_tokens: u64, color: bool) -> Self {
        Self {
            display,
            budget_tokens,
            color,
        }
    }

    /// Main line plus the optional excerpt block, newline-terminated.
    pub fn render(&self, line: &StatusLine) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "[{}] 📂 {}",
            self.model_tag(&line.model),
            line.project
        );
        if let Some(branch) = &line.branch {
            let _ = write!(out, " ⚡ {branch}");
        }
        if let Some(tokens) = line.context_tokens {
            let _ = write!(out, " | {}", self.context_segment(tokens));
        }
        if let Some(today) = line.today {
            let _ = write!(out, " | {}", elapsed_segment(today));
        }
        out.push('\n');

        if let Some(excerpt) = &line.excerpt {
            out.push_str(&self.excerpt_block(excerpt));
        }
        out
    }

    fn paint(&self, text: &str, color: Color) -> String {
        if self.color {
            text.with(color).to_string()
        } else {
            text.to_string()
        }
    }

    fn model_tag(&self, model: &str) -> String {
        match MODEL_STYLES
            .iter()
            .find(|(family, _, _)| model.contains(family))
        {
            Some((_, color, icon)) => self.paint(&format!("{icon} {model}"), *color),
            None => model.to_string(),
        }
    }

    fn context_segment(&self, tokens: u64) -> String {
        let percent = context_percent(tokens, self.budget_tokens);
        let band = context_color(percent);
        let filled = (percent * BAR_WIDTH / 100).min(BAR_WIDTH);
        let empty = BAR_WIDTH - filled;

        let mut bar = String::new();
        if filled > 0 {
            bar.push_str(&self.paint(&"█".repeat(filled as usize), band));
        }
        if empty > 0 {
            bar.push_str(&self.paint(&"░".repeat(empty as usize), GRAY));
        }

        format!(
            "{bar} {}",
            self.paint(
                &format!("{percent}% {}", format_context_tokens(tokens)),
                band
            )
        )
    }

    fn excerpt_block(&self, message: &str) -> String {
        let max_lines = self.display.excerpt_max_lines;
        let width = self.display.excerpt_line_width;
        let lines: Vec<&str> = message.split('\n').collect();

        let mut block = String::new();
        for line in lines.iter().take(max_lines) {
            let text = truncate(line.trim(), width);
            let _ = writeln!(block, "｜{}", self.paint(&text, GREEN));
        }
        if lines.len() > max_lines {
            let _ = writeln!(block, "｜... ({} more lines)", lines.len() - max_lines);
        }
        block
    }
}

fn context_color(percent: u64) -> Color {
    if percent < 60 {
        CTX_GREEN
    } else if percent < 80 {
        CTX_GOLD
    } else {
        CTX_RED
    }
}

fn elapsed_segment(today: TodayTotals) -> String {
    let elapsed = format_elapsed(today.total_seconds);
    if today.active_sessions > 1 {
        format!("{elapsed} [{} sessions]", today.active_sessions)
    } else {
        elapsed
    }
}
