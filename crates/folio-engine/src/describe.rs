//! User-facing descriptions of tool calls for `tool_call` events.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

static HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<h[12][^>]*>(.*?)</h[12]>").expect("valid regex"));
static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<li[^>]*>(.*?)</li>").expect("valid regex"));
static PARAGRAPH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<p[^>]*>(.*?)</p>").expect("valid regex"));
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));
static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script[^>]*>.*?</script>|<style[^>]*>.*?</style>").expect("valid regex")
});

const TITLE_MAX: usize = 60;
const DETAILS_MAX: usize = 500;

/// Friendly one-liner and optional details for a tool call.
pub fn describe(tool_name: &str, args: &Value) -> (Option<String>, Option<String>) {
    let index = |key: &str| args.get(key).and_then(Value::as_i64).unwrap_or(0) + 1;
    let content = args.get("content").and_then(Value::as_str).unwrap_or_default();

    match tool_name {
        "create_document" => {
            let title = args.get("title").and_then(Value::as_str).unwrap_or("Untitled");
            (Some(format!("Creating document: {title}")), None)
        }
        "add_unit" => {
            let friendly = match unit_title(content) {
                Some(title) => format!("Adding unit: {title}"),
                None => "Adding a new unit...".to_string(),
            };
            (Some(friendly), unit_details(content))
        }
        "update_unit" => {
            let n = index("unit_index");
            let friendly = match unit_title(content) {
                Some(title) => format!("Updating unit {n}: {title}"),
                None => format!("Updating unit {n}"),
            };
            (Some(friendly), unit_details(content))
        }
        "delete_unit" => (Some(format!("Deleting unit {}", index("unit_index"))), None),
        "reorder_units" => (
            Some(format!(
                "Moving unit {} to position {}",
                index("from_index"),
                index("to_index")
            )),
            None,
        ),
        "set_theme" => (Some("Setting document theme...".to_string()), None),
        "list_units" => (Some("Listing all units...".to_string()), None),
        "get_unit" => (
            Some(format!("Getting unit {} details...", index("unit_index"))),
            None,
        ),
        "get_pending_edits" => (Some("Reviewing pending edits...".to_string()), None),
        "commit_edits" => (Some("Saving changes...".to_string()), None),
        _ => (None, None),
    }
}

/// First h1/h2 heading, or else the first words of the text.
pub fn unit_title(content: &str) -> Option<String> {
    if let Some(caps) = HEADING.captures(content) {
        let title = collapse(&TAG.replace_all(&caps[1], " "));
        if !title.is_empty() {
            return Some(truncate(&title, TITLE_MAX));
        }
    }
    let text = plain_text(content);
    if text.is_empty() {
        return None;
    }
    if text.chars().count() <= TITLE_MAX {
        return Some(text);
    }
    let cut: String = text.chars().take(TITLE_MAX).collect();
    let cut = match cut.rsplit_once(' ') {
        Some((head, _)) if !head.is_empty() => head.to_string(),
        _ => cut,
    };
    Some(format!("{cut}..."))
}

/// Readable body of a unit: list items, else paragraphs, else text lines.
pub fn unit_details(content: &str) -> Option<String> {
    let items: Vec<String> = LIST_ITEM
        .captures_iter(content)
        .map(|c| collapse(&TAG.replace_all(&c[1], " ")))
        .filter(|s| !s.is_empty())
        .map(|s| format!("• {s}"))
        .collect();

    let parts = if !items.is_empty() {
        items
    } else {
        let paragraphs: Vec<String> = PARAGRAPH
            .captures_iter(content)
            .map(|c| collapse(&TAG.replace_all(&c[1], " ")))
            .filter(|s| !s.is_empty())
            .collect();
        if !paragraphs.is_empty() {
            paragraphs
        } else {
            let body = HEADING.replace_all(content, "");
            let text = plain_text(&body);
            if text.is_empty() {
                Vec::new()
            } else {
                vec![text]
            }
        }
    };

    if parts.is_empty() {
        return None;
    }
    Some(truncate(&parts.join("\n"), DETAILS_MAX))
}

fn plain_text(content: &str) -> String {
    let without_code = SCRIPT_OR_STYLE.replace_all(content, " ");
    collapse(&TAG.replace_all(&without_code, " "))
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{cut}...")
}
