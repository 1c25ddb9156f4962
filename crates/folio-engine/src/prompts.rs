use folio_core::document::{ContextFile, StyleTemplate};

pub const NEW_DOCUMENT_PROMPT: &str = r#"You are a presentation creation assistant. Build professional slides as HTML units.

WORKFLOW:
1. Use create_document to start the document with a title
2. Use add_unit to add slides with HTML content
3. Use commit_edits to save all changes

SLIDE DIMENSIONS:
- Slides are exactly 960px wide and 540px tall (16:9)
- All content must fit within these bounds; nothing may overflow
- The root div must have: width: 960px; height: 540px; overflow: hidden; box-sizing: border-box;

HTML TEMPLATE:
<div style="width: 960px; height: 540px; padding: 40px; box-sizing: border-box; overflow: hidden; font-family: Arial, sans-serif;">
  <h1 style="color: #1a73e8; margin: 0 0 20px 0; font-size: 36px;">Slide Title</h1>
  <ul style="font-size: 22px; line-height: 1.5; margin: 0; padding-left: 24px;">
    <li>First key point</li>
    <li>Second key point</li>
  </ul>
</div>

DESIGN RULES:
- Title: at most 36px, one line preferred
- Body text: 18-24px
- 40px padding leaves an 880x460px content area
- At most 5-6 bullet points per slide

You may call add_unit several times in one response when creating several slides.
Edits are only staged until you call commit_edits."#;

pub const CONTINUATION_PROMPT: &str = r#"You are editing an existing presentation.

Only change the units the user explicitly asks for. Preserve every other unit exactly as it is.

SLIDE DIMENSIONS:
- Slides are exactly 960px wide and 540px tall (16:9)
- The root div must have: width: 960px; height: 540px; overflow: hidden; box-sizing: border-box;

WORKFLOW:
1. Use list_units to see the current units
2. Use get_unit to read a unit in full before changing it
3. Use update_unit, add_unit, delete_unit or reorder_units to stage changes
4. Use commit_edits to save

Unit indices are 0-based and refer to the saved document, not to staged edits.
Call list_units first so you understand the current state."#;

/// System prompt for a turn, with any context files and style template appended.
pub fn build_system_prompt(
    is_continuation: bool,
    context_files: &[ContextFile],
    style_template: Option<&StyleTemplate>,
) -> String {
    let mut prompt = if is_continuation {
        CONTINUATION_PROMPT.to_string()
    } else {
        NEW_DOCUMENT_PROMPT.to_string()
    };

    let blocks: Vec<String> = context_files
        .iter()
        .filter(|f| !f.text.trim().is_empty())
        .map(|f| format!("=== {} ===\n{}", f.filename, f.text))
        .collect();
    if !blocks.is_empty() {
        prompt.push_str("\n\nCONTEXT FILES:\n");
        prompt.push_str(&blocks.join("\n\n"));
    }

    if let Some(template) = style_template.filter(|t| !t.text.trim().is_empty()) {
        prompt.push_str("\n\nSTYLE TEMPLATE REFERENCE:");
        prompt.push_str(&format!("\nFilename: {}", template.filename));
        prompt.push_str(&format!("\nTemplate content:\n{}", template.text));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, text: &str) -> ContextFile {
        ContextFile {
            filename: name.into(),
            text: text.into(),
        }
    }

    #[test]
    fn continuation_prompt_preserves_untouched_units() {
        let prompt = build_system_prompt(true, &[], None);
        assert!(prompt.contains("Only change the units the user explicitly asks for"));
        assert!(!prompt.contains("CONTEXT FILES"));
    }

    #[test]
    fn context_files_appended_in_order() {
        let prompt = build_system_prompt(
            false,
            &[file("notes.md", "Q3 numbers"), file("empty.txt", "  "), file("brief.txt", "Audience: board")],
            None,
        );
        let tail = prompt.split("CONTEXT FILES:\n").nth(1).unwrap();
        assert_eq!(
            tail,
            "=== notes.md ===\nQ3 numbers\n\n=== brief.txt ===\nAudience: board"
        );
        assert!(prompt.starts_with(NEW_DOCUMENT_PROMPT));
    }

    #[test]
    fn style_template_follows_context_files() {
        let template = StyleTemplate {
            filename: "brand.pptx".into(),
            text: "Navy headings, Georgia body".into(),
        };
        let prompt = build_system_prompt(false, &[file("notes.md", "Q3")], Some(&template));
        let (head, tail) = prompt.split_once("\n\nSTYLE TEMPLATE REFERENCE:").unwrap();
        assert!(head.ends_with("=== notes.md ===\nQ3"));
        assert_eq!(
            tail,
            "\nFilename: brand.pptx\nTemplate content:\nNavy headings, Georgia body"
        );
    }

    #[test]
    fn blank_style_template_is_skipped() {
        let template = StyleTemplate {
            filename: "empty.pptx".into(),
            text: "\n ".into(),
        };
        let prompt = build_system_prompt(true, &[], Some(&template));
        assert_eq!(prompt, CONTINUATION_PROMPT);
    }
}
