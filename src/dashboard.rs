//! Dashboard rendering: run state in, message body and buttons out.
//!
//! Rendering is a pure function. Identical input yields byte-identical output,
//! which is what lets the reconciliation loop skip pushes when nothing changed.

use crate::channel::{ActionButton, CommandKind};
use crate::files::FileDescriptor;
use crate::log_buffer::LogBuffer;
use crate::reconcile::RunStatus;
use crate::sampler::ResourceSnapshot;
use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;
use teloxide::utils::html::escape;

/// Hard cap on a Telegram message body, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

const TRUNCATION_MARKER: &str = "\n...[truncated]...\n";
const FILE_LABEL_CHARS: usize = 20;
const HOST_CHARS: usize = 64;
const COMMAND_CHARS: usize = 200;
const NOTICE_CHARS: usize = 200;
const MAX_ACCELERATOR_LINES: usize = 16;

/// Matches ANSI escape sequences (colors, cursor movement).
static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").unwrap());

/// Everything the dashboard shows, borrowed from the loop's state.
#[derive(Debug)]
pub struct DashboardState<'a> {
    pub host: &'a str,
    pub pid: Option<u32>,
    pub command: &'a str,
    pub status: RunStatus,
    pub elapsed: Duration,
    pub resources: &'a ResourceSnapshot,
    pub logs: &'a LogBuffer,
    pub files: &'a [FileDescriptor],
    pub notice: Option<&'a str>,
}

/// A rendered dashboard: HTML body plus button rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDashboard {
    pub body: String,
    pub buttons: Vec<Vec<ActionButton>>,
}

pub fn render(state: &DashboardState<'_>) -> RenderedDashboard {
    let mut header = String::new();
    let pid = state
        .pid
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    // Every variable-length header field is bounded so the header alone
    // always leaves room for the log block.
    header.push_str(&format!(
        "🖥 <b>{}</b> (PID: {pid})\n",
        escape(&shorten(state.host, HOST_CHARS))
    ));
    header.push_str(&format!(
        "⚙️ <code>{}</code>\n\n",
        escape(&shorten(state.command, COMMAND_CHARS))
    ));
    header.push_str(&format!("Status: {}\n", status_line(state.status)));
    header.push_str(&format!("Time: {}\n", format_elapsed(state.elapsed)));
    header.push_str(&format!(
        "CPU: {:.1}% | RAM: {:.1}%\n",
        state.resources.cpu_percent, state.resources.ram_percent
    ));

    if !state.resources.accelerators.is_empty() {
        let accelerators = &state.resources.accelerators;
        let mut gpus: Vec<String> = accelerators
            .iter()
            .take(MAX_ACCELERATOR_LINES)
            .map(|gpu| {
                format!(
                    "GPU {}: {:.0}% | VRAM: {:.1}/{:.1}GB ({:.0}%)",
                    gpu.index,
                    gpu.utilization_percent,
                    gpu.memory_used_mib as f64 / 1024.0,
                    gpu.memory_total_mib as f64 / 1024.0,
                    gpu.memory_percent()
                )
            })
            .collect();
        if accelerators.len() > MAX_ACCELERATOR_LINES {
            gpus.push(format!("+{} more", accelerators.len() - MAX_ACCELERATOR_LINES));
        }
        header.push_str(&format!("<code>{}</code>\n", escape(&gpus.join("\n"))));
    }

    if let Some(notice) = state.notice {
        header.push_str(&format!("⚠️ {}\n", escape(&shorten(notice, NOTICE_CHARS))));
    }

    header.push_str(&format!(
        "\n📜 <b>Recent Log (Last {}):</b>\n",
        state.logs.capacity()
    ));

    let available = MAX_MESSAGE_CHARS
        .saturating_sub(header.chars().count())
        .saturating_sub("<pre></pre>".len());
    let logs = render_logs(state.logs, available);
    let mut body = format!("{header}<pre>{logs}</pre>");
    if body.chars().count() > MAX_MESSAGE_CHARS {
        body = format!("{header}<pre></pre>");
    }

    RenderedDashboard {
        body,
        buttons: buttons_for(state.status, state.files),
    }
}

/// Body for a run whose command never started. No buttons.
pub fn render_spawn_failure(host: &str, command: &str, reason: &str) -> RenderedDashboard {
    RenderedDashboard {
        body: format!(
            "🖥 <b>{}</b>\n⚙️ <code>{}</code>\n\nStatus: ❌ Failed to start\n⚠️ {}",
            escape(&shorten(host, HOST_CHARS)),
            escape(&shorten(command, COMMAND_CHARS)),
            escape(reason)
        ),
        buttons: Vec::new(),
    }
}

/// Final body once the wrapper has been closed. No buttons.
pub fn render_closed(host: &str) -> RenderedDashboard {
    RenderedDashboard {
        body: format!("🛑 Wrapper on {} closed.", escape(host)),
        buttons: Vec::new(),
    }
}

/// Message posted (then edited with a resource sample) by the connectivity check.
pub fn render_connectivity_check(
    host: &str,
    sample: Option<(&ResourceSnapshot, &str)>,
) -> RenderedDashboard {
    let mut body = format!("🧪 telewrap test from <b>{}</b>", escape(host));
    if let Some((resources, checked_at)) = sample {
        body.push_str(&format!(
            "\n✅ Connection OK ({})\nCPU: {:.1}% | RAM: {:.1}%",
            escape(checked_at),
            resources.cpu_percent,
            resources.ram_percent
        ));
        if !resources.accelerators.is_empty() {
            body.push_str(&format!("\nGPUs: {}", resources.accelerators.len()));
        }
    }
    RenderedDashboard {
        body,
        buttons: Vec::new(),
    }
}

pub fn status_line(status: RunStatus) -> String {
    match status {
        RunStatus::Running => "🟢 Running".to_string(),
        RunStatus::Completed { exit_code: 0 } => "✅ Done (Exit: 0)".to_string(),
        RunStatus::Completed { exit_code } => format!("❌ Error (Exit: {exit_code})"),
        RunStatus::Terminated => "🛑 Terminated".to_string(),
    }
}

/// `H:MM:SS`, whole seconds.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

pub fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

fn buttons_for(status: RunStatus, files: &[FileDescriptor]) -> Vec<Vec<ActionButton>> {
    let mut rows = vec![vec![ActionButton::new("🔄 Refresh", CommandKind::Refresh)]];

    if status.is_finished() {
        rows.push(vec![ActionButton::new("❌ Close Wrapper", CommandKind::Close)]);
        for file in files {
            rows.push(vec![ActionButton::new(
                format!("⬇️ {}", file_label(&file.name)),
                CommandKind::Download(file.id.clone()),
            )]);
        }
    } else {
        rows.push(vec![ActionButton::new(
            "🛑 Terminate Process",
            CommandKind::Terminate,
        )]);
    }

    rows
}

fn file_label(name: &str) -> String {
    shorten(name, FILE_LABEL_CHARS)
}

/// First `max` characters of `text`, with `..` appended when cut.
fn shorten(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let short: String = text.chars().take(max).collect();
        format!("{short}..")
    } else {
        text.to_string()
    }
}

/// Escaped log text that fits in `available` characters, newest lines kept.
fn render_logs(logs: &LogBuffer, available: usize) -> String {
    if logs.is_empty() {
        return "Starting...".to_string();
    }
    let lines: Vec<String> = logs
        .view()
        .map(|line| escape(&strip_ansi(line)))
        .collect();

    let full = lines.join("\n");
    if full.chars().count() <= available {
        return full;
    }

    let marker = TRUNCATION_MARKER.chars().count();
    if available <= marker {
        return String::new();
    }
    let budget = available - marker;
    let mut kept: Vec<&str> = Vec::new();
    let mut used = 0;
    for line in lines.iter().rev() {
        let cost = line.chars().count() + usize::from(!kept.is_empty());
        if used + cost > budget {
            break;
        }
        used += cost;
        kept.push(line);
    }

    if kept.is_empty() {
        // The newest line alone is too long: keep its tail. Escaping can grow
        // text at most five-fold ("&amp;"), so cut the raw text accordingly.
        let raw = logs.view().last().map(strip_ansi).unwrap_or_default();
        let keep = budget / 5;
        let tail: String = {
            let count = raw.chars().count();
            raw.chars().skip(count.saturating_sub(keep)).collect()
        };
        return format!("{TRUNCATION_MARKER}{}", escape(&tail));
    }

    kept.reverse();
    format!("{TRUNCATION_MARKER}{}", kept.join("\n"))
}
