//! Instruction text sent alongside page images.

use crate::schema::{fields, output_template};

/// What the prompt may say about the document being processed.
#[derive(Debug, Clone, Copy)]
pub struct DocumentContext<'a> {
    pub document_id: &'a str,
    pub title: Option<&'a str>,
    /// 1-based page numbers of the images attached to this request.
    pub page_numbers: &'a [usize],
}

/// System and user instructions for one inference request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptPair {
    pub system: String,
    pub user: String,
}

/// Build the instruction pair for a request. Pure: the same context always
/// produces the same text.
pub fn build(context: &DocumentContext<'_>) -> PromptPair {
    PromptPair {
        system: system_instructions(),
        user: user_instructions(context),
    }
}

fn system_instructions() -> String {
    format!(
        "You are an expert materials scientist who extracts synthesis protocols from \
scientific papers. You are given rendered pages of a paper as images.

CRITICAL: Prioritize information found in TABLES and FIGURES (tables of reagents, \
heating profiles, flowcharts, reaction schemes) over the narrative text. Synthesis \
conditions are most often tabulated; use the prose only to fill gaps.

Return ONLY a JSON object with the following structure:
{template}

Rules:
- \"{target}\" and \"{method}\" are required. If the pages describe no synthesis, \
return {{\"{target}\": \"\", \"{method}\": \"\"}}.
- Use empty arrays when no {precursors} or {conditions} are given.
- Copy values exactly as printed, keeping their units.
- Output the JSON object alone: no prose before or after it and no markdown code fences.",
        template = output_template(),
        target = fields::TARGET_MATERIAL,
        method = fields::METHOD_TYPE,
        precursors = fields::PRECURSORS,
        conditions = fields::CONDITIONS,
    )
}

fn user_instructions(context: &DocumentContext<'_>) -> String {
    let mut lines = vec![format!("Document: {}", context.document_id)];
    if let Some(title) = context.title.map(str::trim).filter(|t| !t.is_empty()) {
        lines.push(format!("Title: {}", title));
    }

    let pages = context
        .page_numbers
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    let noun = if context.page_numbers.len() == 1 {
        "page"
    } else {
        "pages"
    };
    lines.push(format!("Attached: {} {}", noun, pages));

    lines.push(
        "Extract the synthesis protocol of the primary target material shown on the attached \
pages and answer with the JSON object only."
            .to_string(),
    );

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(pages: &'a [usize]) -> DocumentContext<'a> {
        DocumentContext {
            document_id: "arXiv:1234.5678",
            title: Some("Room-temperature synthesis of MOF-5"),
            page_numbers: pages,
        }
    }

    #[test]
    fn build_is_deterministic() {
        let pages = [2];
        assert_eq!(build(&context(&pages)), build(&context(&pages)));
    }

    #[test]
    fn system_prompt_demands_bare_json_and_tables_first() {
        let prompt = build(&context(&[1]));
        assert!(prompt.system.contains("materials scientist"));
        assert!(prompt.system.contains("Return ONLY a JSON object"));
        assert!(prompt.system.contains("no markdown code fences"));
        assert!(prompt.system.contains("TABLES and FIGURES"));
        assert!(prompt.system.contains(&output_template()));
    }

    #[test]
    fn user_prompt_names_document_and_pages() {
        let prompt = build(&context(&[1, 2, 3]));
        assert!(prompt.user.contains("Document: arXiv:1234.5678"));
        assert!(prompt.user.contains("Title: Room-temperature synthesis of MOF-5"));
        assert!(prompt.user.contains("Attached: pages 1, 2, 3"));
    }

    #[test]
    fn blank_title_is_omitted() {
        let pages = [4];
        let ctx = DocumentContext {
            document_id: "file://paper.pdf",
            title: Some("   "),
            page_numbers: &pages,
        };
        let prompt = build(&ctx);
        assert!(!prompt.user.contains("Title:"));
        assert!(prompt.user.contains("Attached: page 4"));
    }
}
