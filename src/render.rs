//! Terminal rendering for the CLI.

use colored::*;

use crate::orchestrator::ArenaView;
use crate::plans::{Plan, PlanBody, Step};
use crate::session::{ChatEntry, Sender, SystemKind};

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

/// A settled piece of a plan, printed once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanLine {
    Title(String),
    Mindset(String),
    Reply(String),
    Step(Step),
}

#[derive(Debug, Default, Clone, Copy)]
struct Printed {
    title: bool,
    mindset: bool,
    items: usize,
}

/// Turns successive plan lists into append-only terminal output.
///
/// A field is emitted only once it can no longer grow: the mindset once the
/// first item starts, an item once the next one starts or the block closes.
#[derive(Debug, Default)]
pub struct PlanPrinter {
    printed: Vec<Printed>,
}

impl PlanPrinter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, plans: &[Plan]) -> Vec<PlanLine> {
        let mut out = Vec::new();
        for (idx, plan) in plans.iter().enumerate() {
            if self.printed.len() <= idx {
                self.printed.push(Printed::default());
            }
            let printed = &mut self.printed[idx];
            if !printed.title {
                out.push(PlanLine::Title(plan.title.clone()));
                printed.title = true;
            }

            let items = match &plan.body {
                PlanBody::Replies(lines) => lines.len(),
                PlanBody::Steps(steps) => steps.len(),
            };
            if !printed.mindset && (items > 0 || plan.complete) {
                out.push(PlanLine::Mindset(plan.display_mindset().to_string()));
                printed.mindset = true;
            }

            let settled = if plan.complete { items } else { items.saturating_sub(1) };
            while printed.items < settled {
                let line = match &plan.body {
                    PlanBody::Replies(lines) => PlanLine::Reply(lines[printed.items].clone()),
                    PlanBody::Steps(steps) => PlanLine::Step(steps[printed.items].clone()),
                };
                out.push(line);
                printed.items += 1;
            }
        }
        out
    }
}

pub fn paint_plan_line(line: &PlanLine) -> String {
    match line {
        PlanLine::Title(title) => format!("\n{}", title.bright_cyan().bold()),
        PlanLine::Mindset(text) => format!("  {} {}", "心法".bright_yellow(), text.dimmed()),
        PlanLine::Reply(text) => format!("  {} {}", "›".bright_green(), text),
        PlanLine::Step(step) => format!(
            "  [{}] {} - {}",
            step.icon,
            step.keyword.bright_white().bold(),
            step.description
        ),
    }
}

// ---------------------------------------------------------------------------
// Arena
// ---------------------------------------------------------------------------

pub fn paint_entry(entry: &ChatEntry, opponent: &str) -> Option<String> {
    if entry.text.trim().is_empty() {
        return None;
    }
    let line = match (entry.sender, entry.system_kind()) {
        (Sender::Ai, _) => {
            format!("{} {}", format!("{opponent}:").bright_blue().bold(), entry.text)
        }
        (Sender::User, _) => format!("{} {}", "你:".bright_green().bold(), entry.text),
        (Sender::System, Some(SystemKind::MissionBrief)) => {
            format!("{} {}", "任务".bright_magenta(), entry.body())
        }
        (Sender::System, Some(SystemKind::Notification)) => {
            format!("{} {}", "通知".bright_red(), entry.body())
        }
        (Sender::System, Some(SystemKind::ReviewCard)) => {
            let card = entry.review_card()?;
            let verdict = if card.is_win {
                "大获全胜".bright_green().bold()
            } else {
                "惨遭败北".bright_red().bold()
            };
            let mut text = format!(
                "{}\n  {} {}\n  {} {}",
                format!("== 复盘: {verdict} ==").bright_white(),
                "好感度".bright_yellow(),
                card.mood.clamp(0, 100),
                "师爷点评".bright_yellow(),
                card.analysis
            );
            if !card.inner_monologue.is_empty() {
                text.push_str(&format!(
                    "\n  {} {}",
                    "对方内心".bright_yellow(),
                    card.inner_monologue.dimmed()
                ));
            }
            text
        }
        (Sender::System, None) => entry.text.dimmed().to_string(),
    };
    Some(line)
}

pub fn paint_status(view: &ArenaView) -> String {
    let mood = view.display_mood;
    let bar_len = (mood / 10) as usize;
    let bar = format!("{}{}", "█".repeat(bar_len), "░".repeat(10 - bar_len));
    let bar = match mood {
        0..=29 => bar.bright_red(),
        30..=69 => bar.bright_yellow(),
        _ => bar.bright_green(),
    };
    format!(
        "{} {} {}  {}",
        "好感度".bright_white(),
        bar,
        mood,
        view.state.inner_monologue.dimmed()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plans::{parse_plans, PlanMode};

    const BLOCK: &str = "===PLAN_START===\n【标题】Plan A: 太极\n【心法】稳\n【回复】一\n【回复】二\n===PLAN_END===";

    #[test]
    fn test_printer_emits_each_line_once() {
        let mut printer = PlanPrinter::new();
        let mut all = Vec::new();
        for (cut, _) in BLOCK.char_indices().skip(1) {
            all.extend(printer.update(&parse_plans(&BLOCK[..cut], PlanMode::Online)));
        }
        all.extend(printer.update(&parse_plans(BLOCK, PlanMode::Online)));
        assert_eq!(
            all,
            vec![
                PlanLine::Title("Plan A: 太极".into()),
                PlanLine::Mindset("稳".into()),
                PlanLine::Reply("一".into()),
                PlanLine::Reply("二".into()),
            ]
        );
    }

    #[test]
    fn test_printer_holds_growing_item() {
        let mut printer = PlanPrinter::new();
        let partial = "===PLAN_START===\n【标题】T\n【心法】m\n【回复】正在";
        let lines = printer.update(&parse_plans(partial, PlanMode::Online));
        assert!(!lines.iter().any(|l| matches!(l, PlanLine::Reply(_))));
    }

    #[test]
    fn test_blank_entry_not_painted() {
        assert!(paint_entry(&ChatEntry::ai(""), "大刘").is_none());
        assert!(paint_entry(&ChatEntry::ai("在吗"), "大刘").is_some());
    }
}
