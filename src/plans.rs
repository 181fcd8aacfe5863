//! Plan-block parser.
//!
//! The model writes plans as marker-delimited blocks:
//!
//! ```text
//! ===PLAN_START===
//! 【标题】Plan A: 太极推手
//! 【心法】rationale, possibly several lines
//! 【回复】first bubble            (online mode, repeated)
//! 【步骤】[👀] 观察 - description  (offline mode, repeated)
//! ===PLAN_END===
//! ```
//!
//! [`parse_plans`] is a pure function of the accumulated buffer. It is called
//! on every chunk, so it must give the same answer however the buffer was
//! chunked and must never let a half-received marker leak into a field.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const PLAN_START: &str = "===PLAN_START===";
pub const PLAN_END: &str = "===PLAN_END===";
pub const TITLE_MARK: &str = "【标题】";
pub const MINDSET_MARK: &str = "【心法】";
pub const REPLY_MARK: &str = "【回复】";
pub const STEP_MARK: &str = "【步骤】";

const MARKERS: [&str; 6] = [PLAN_START, PLAN_END, TITLE_MARK, MINDSET_MARK, REPLY_MARK, STEP_MARK];

static REPLY_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"【回复】([^\n]*)").expect("reply pattern is valid"));
static STEP_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"【步骤】([^\n]*)").expect("step pattern is valid"));
// [icon] keyword - description; icon brackets may be ASCII or full-width and
// the separator may be '-', ':' or '：'.
static STEP_PARTS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[\[【]\s*(.*?)\s*[\]】]\s*(.*?)\s*[-:：]\s*(.*)$")
        .expect("step parts pattern is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanMode {
    /// Chat replies: each plan carries reply bubbles.
    Online,
    /// In-person scripts: each plan carries action steps.
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub icon: String,
    pub keyword: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "items")]
pub enum PlanBody {
    Replies(Vec<String>),
    Steps(Vec<Step>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    /// `plan-{ordinal}`; stable across re-parses of a growing buffer.
    pub id: String,
    pub title: String,
    /// Empty until the rationale field starts arriving.
    pub mindset: String,
    pub body: PlanBody,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_text: Option<String>,
    /// True once the block's end marker has been received.
    pub complete: bool,
}

impl Plan {
    pub const MINDSET_PENDING: &'static str = "正在推敲...";
    pub const REPLY_PENDING: &'static str = "师爷正在提笔...";

    pub fn reply_lines(&self) -> &[String] {
        match &self.body {
            PlanBody::Replies(lines) => lines,
            PlanBody::Steps(_) => &[],
        }
    }

    pub fn steps(&self) -> &[Step] {
        match &self.body {
            PlanBody::Steps(steps) => steps,
            PlanBody::Replies(_) => &[],
        }
    }

    pub fn display_mindset(&self) -> &str {
        if self.mindset.is_empty() {
            Self::MINDSET_PENDING
        } else {
            &self.mindset
        }
    }

    /// Reply bubbles for rendering; a single placeholder while none arrived.
    pub fn display_replies(&self) -> Vec<&str> {
        let lines = self.reply_lines();
        if lines.is_empty() {
            vec![Self::REPLY_PENDING]
        } else {
            lines.iter().map(String::as_str).collect()
        }
    }

    /// Attach an excerpt of the message being answered (first 20 characters).
    pub fn with_original_text(mut self, source: &str) -> Self {
        let excerpt: String = source.chars().take(20).collect();
        let suffix = if source.chars().count() > 20 { "..." } else { "" };
        self.original_text = Some(format!("{excerpt}{suffix}"));
        self
    }

    /// Plain-text rendering used for clipboard copies.
    pub fn to_plain_text(&self) -> String {
        let mut out = format!("{}\n{}\n", self.title, self.display_mindset());
        match &self.body {
            PlanBody::Replies(lines) => {
                for line in lines {
                    out.push_str(line);
                    out.push('\n');
                }
            }
            PlanBody::Steps(steps) => {
                for step in steps {
                    out.push_str(&format!(
                        "[{}] {} - {}\n",
                        step.icon, step.keyword, step.description
                    ));
                }
            }
        }
        out
    }
}

/// Re-derive every plan visible in `buffer`.
pub fn parse_plans(buffer: &str, mode: PlanMode) -> Vec<Plan> {
    let mut plans = Vec::new();
    for segment in buffer.split(PLAN_START).skip(1) {
        if let Some(plan) = parse_segment(segment, plans.len(), mode) {
            plans.push(plan);
        }
    }
    plans
}

fn parse_segment(segment: &str, ordinal: usize, mode: PlanMode) -> Option<Plan> {
    let (body, complete) = match segment.find(PLAN_END) {
        Some(end) => (&segment[..end], true),
        None => (segment, false),
    };

    let title = parse_title(body, complete)?;
    let mindset = parse_mindset(body, complete);
    let plan_body = match mode {
        PlanMode::Online => PlanBody::Replies(parse_replies(body, complete)),
        PlanMode::Offline => PlanBody::Steps(parse_steps(body, complete)),
    };

    Some(Plan {
        id: format!("plan-{ordinal}"),
        title,
        mindset,
        body: plan_body,
        original_text: None,
        complete,
    })
}

/// The title is only released once its line has ended; a title still being
/// typed would otherwise flicker through every prefix.
fn parse_title(body: &str, complete: bool) -> Option<String> {
    let start = body.find(TITLE_MARK)? + TITLE_MARK.len();
    let rest = &body[start..];
    let line_end = rest.find('\n');
    let end = match line_end.into_iter().chain(first_marker(rest)).min() {
        Some(end) => end,
        None if complete => rest.len(),
        None => return None,
    };
    let title = clean_field(&rest[..end], false);
    (!title.is_empty()).then_some(title)
}

fn parse_mindset(body: &str, complete: bool) -> String {
    let Some(pos) = body.find(MINDSET_MARK) else {
        return String::new();
    };
    let rest = &body[pos + MINDSET_MARK.len()..];
    let next = [REPLY_MARK, STEP_MARK, TITLE_MARK]
        .iter()
        .filter_map(|m| rest.find(m))
        .min();
    match next {
        Some(end) => clean_field(&rest[..end], false),
        None => clean_field(rest, !complete),
    }
}

fn parse_replies(body: &str, complete: bool) -> Vec<String> {
    REPLY_LINE
        .captures_iter(body)
        .filter_map(|caps| {
            let m = caps.get(1)?;
            let open = !complete && m.end() == body.len();
            let line = clean_field(m.as_str(), open);
            (!line.is_empty()).then_some(line)
        })
        .collect()
}

fn parse_steps(body: &str, complete: bool) -> Vec<Step> {
    STEP_LINE
        .captures_iter(body)
        .filter_map(|caps| {
            let m = caps.get(1)?;
            let line = if !complete && m.end() == body.len() {
                strip_partial_marker(m.as_str())
            } else {
                m.as_str()
            };
            parse_step(line)
        })
        .collect()
}

/// Split one step line into icon, keyword and description. Lines that do
/// not have the bracketed-icon shape yet (or at all) yield `None`.
pub fn parse_step(line: &str) -> Option<Step> {
    let caps = STEP_PARTS.captures(line.trim())?;
    let field = |i: usize| caps.get(i).map(|m| m.as_str().trim().to_string()).unwrap_or_default();
    Some(Step {
        icon: field(1),
        keyword: field(2),
        description: field(3),
    })
}

fn first_marker(text: &str) -> Option<usize> {
    MARKERS.iter().filter_map(|m| text.find(m)).min()
}

/// Trim a field. For a field that runs to the end of the buffer (`open`), also
/// drop a trailing fragment that could be the start of a marker.
fn clean_field(raw: &str, open: bool) -> String {
    let mut text = raw.trim();
    if open {
        text = strip_partial_marker(text).trim_end();
    }
    strip_quotes(text).to_string()
}

fn strip_partial_marker(text: &str) -> &str {
    let mut cut = text.len();
    for marker in MARKERS {
        for (idx, _) in marker.char_indices().skip(1) {
            let prefix = &marker[..idx];
            if text.ends_with(prefix) {
                cut = cut.min(text.len() - prefix.len());
            }
        }
    }
    &text[..cut]
}

fn strip_quotes(text: &str) -> &str {
    let text = text
        .strip_prefix('"')
        .or_else(|| text.strip_prefix('“'))
        .unwrap_or(text);
    text.strip_suffix('"')
        .or_else(|| text.strip_suffix('”'))
        .unwrap_or(text)
}

/// Owns the accumulated buffer of one plan-generation call.
#[derive(Debug, Clone)]
pub struct PlanStream {
    mode: PlanMode,
    buffer: String,
    source_excerpt: Option<String>,
}

impl PlanStream {
    pub fn new(mode: PlanMode) -> Self {
        PlanStream { mode, buffer: String::new(), source_excerpt: None }
    }

    /// Online plans quote the message being answered.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source_excerpt = Some(source.into());
        self
    }

    /// Append a chunk and return the full, re-derived plan list.
    pub fn push(&mut self, chunk: &str) -> Vec<Plan> {
        self.buffer.push_str(chunk);
        self.plans()
    }

    pub fn plans(&self) -> Vec<Plan> {
        let plans = parse_plans(&self.buffer, self.mode);
        match &self.source_excerpt {
            Some(src) => plans.into_iter().map(|p| p.with_original_text(src)).collect(),
            None => plans,
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}
