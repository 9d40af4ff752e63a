use std::io::Write;
use std::path::Path;

use owo_colors::OwoColorize;
use synthex_core::ExtractionEvent;
use synthex_core::source::DocumentMeta;
use synthex_store::StoreCounts;

use crate::pipeline::{BatchSummary, DocumentOutcome};

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

fn page_list(pages: &[usize]) -> String {
    let label = if pages.len() == 1 { "page" } else { "pages" };
    let numbers: Vec<String> = pages.iter().map(|p| p.to_string()).collect();
    format!("{} {}", label, numbers.join(", "))
}

/// One-line description of an in-flight extraction event, for the spinner.
pub fn describe_event(event: &ExtractionEvent) -> String {
    match event {
        ExtractionEvent::Attempt { pages } => format!("reading {}", page_list(pages)),
        ExtractionEvent::Retrying {
            pages,
            attempt,
            error,
        } => format!("{}: retry {} ({})", page_list(pages), attempt, error),
        ExtractionEvent::Rejected { pages, failure } => {
            format!("{}: {}", page_list(pages), failure)
        }
        ExtractionEvent::Accepted { pages } => format!("{}: accepted", page_list(pages)),
        ExtractionEvent::Merged { pages, added } => {
            format!("{}: merged {} entries", page_list(pages), added)
        }
        ExtractionEvent::Exhausted { pages_tried } => {
            format!("no structured data in {} page(s)", pages_tried)
        }
    }
}

/// Print the result for one document.
pub fn print_outcome(
    w: &mut dyn Write,
    index: usize,
    total: usize,
    outcome: &DocumentOutcome,
    color: ColorMode,
) -> std::io::Result<()> {
    let prefix = format!("[{}/{}]", index + 1, total);
    let id = outcome.document_id();

    match outcome {
        DocumentOutcome::Stored {
            target_material,
            precursors,
            conditions,
            source_pages,
            replaced,
            ..
        } => {
            let label = if *replaced { "REPLACED" } else { "STORED" };
            let detail = format!(
                "{} ({} precursors, {} conditions, {})",
                target_material,
                precursors,
                conditions,
                page_list(source_pages)
            );
            if color.enabled() {
                writeln!(w, "{} {} {} -> {}", prefix, label.green().bold(), id, detail)?;
            } else {
                writeln!(w, "{} {} {} -> {}", prefix, label, id, detail)?;
            }
        }
        DocumentOutcome::AlreadyPresent { .. } => {
            if color.enabled() {
                writeln!(w, "{} {} {}", prefix, "SKIPPED".dimmed(), id)?;
                writeln!(w, "      {}", "already in database (use --force to re-extract)".dimmed())?;
            } else {
                writeln!(w, "{} SKIPPED {}", prefix, id)?;
                writeln!(w, "      already in database (use --force to re-extract)")?;
            }
        }
        DocumentOutcome::NoStructuredData { pages_tried, .. } => {
            if color.enabled() {
                writeln!(
                    w,
                    "{} {} {} ({} pages tried)",
                    prefix,
                    "NO DATA".yellow(),
                    id,
                    pages_tried
                )?;
            } else {
                writeln!(w, "{} NO DATA {} ({} pages tried)", prefix, id, pages_tried)?;
            }
        }
        DocumentOutcome::Failed { reason, .. } => {
            if color.enabled() {
                writeln!(w, "{} {} {}", prefix, "FAILED".red().bold(), id)?;
                writeln!(w, "      {}", reason.red())?;
            } else {
                writeln!(w, "{} FAILED {}", prefix, id)?;
                writeln!(w, "      {}", reason)?;
            }
        }
        DocumentOutcome::Cancelled { .. } => {
            if color.enabled() {
                writeln!(w, "{} {} {}", prefix, "CANCELLED".yellow(), id)?;
            } else {
                writeln!(w, "{} CANCELLED {}", prefix, id)?;
            }
        }
    }
    Ok(())
}

/// Print the final batch summary.
pub fn print_summary(
    w: &mut dyn Write,
    summary: &BatchSummary,
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w)?;
    if color.enabled() {
        writeln!(w, "{}", "SUMMARY".bold())?;
    } else {
        writeln!(w, "SUMMARY")?;
    }
    writeln!(w, "  Documents:        {}", summary.total())?;

    let rows = [
        ("Stored", summary.stored),
        ("Already present", summary.already_present),
        ("No data found", summary.no_data),
        ("Failed", summary.failed),
        ("Cancelled", summary.cancelled),
    ];
    for (label, count) in rows {
        if count == 0 && label == "Cancelled" {
            continue;
        }
        let line = format!("  {:<17} {}", format!("{}:", label), count);
        if !color.enabled() || count == 0 {
            writeln!(w, "{}", line)?;
            continue;
        }
        match label {
            "Stored" => writeln!(w, "{}", line.green())?,
            "Failed" => writeln!(w, "{}", line.red())?,
            "No data found" | "Cancelled" => writeln!(w, "{}", line.yellow())?,
            _ => writeln!(w, "{}", line)?,
        }
    }
    Ok(())
}

/// Print database row counts.
pub fn print_stats(
    w: &mut dyn Write,
    db_path: &Path,
    counts: &StoreCounts,
    color: ColorMode,
) -> std::io::Result<()> {
    if color.enabled() {
        writeln!(w, "{} {}", "Database:".bold(), db_path.display())?;
    } else {
        writeln!(w, "Database: {}", db_path.display())?;
    }
    writeln!(w, "  Papers:      {}", counts.papers)?;
    writeln!(w, "  Syntheses:   {}", counts.syntheses)?;
    writeln!(w, "  Precursors:  {}", counts.precursors)?;
    writeln!(w, "  Conditions:  {}", counts.conditions)?;
    Ok(())
}

/// Print the documents found by a search.
pub fn print_search_results(
    w: &mut dyn Write,
    query: &str,
    results: &[DocumentMeta],
    color: ColorMode,
) -> std::io::Result<()> {
    writeln!(w, "Found {} result(s) for \"{}\"", results.len(), query)?;
    for meta in results {
        let authors = match meta.authors.len() {
            0 => String::new(),
            1 => meta.authors[0].clone(),
            _ => format!("{} et al.", meta.authors[0]),
        };
        if color.enabled() {
            writeln!(w, "  {} {}", meta.stable_identifier.cyan(), meta.title)?;
            if !authors.is_empty() {
                writeln!(w, "      {}", authors.dimmed())?;
            }
        } else {
            writeln!(w, "  {} {}", meta.stable_identifier, meta.title)?;
            if !authors.is_empty() {
                writeln!(w, "      {}", authors)?;
            }
        }
    }
    writeln!(w)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(outcome: &DocumentOutcome) -> String {
        let mut buf = Vec::new();
        print_outcome(&mut buf, 0, 2, outcome, ColorMode(false)).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn stored_outcome_lists_counts_and_pages() {
        let text = render(&DocumentOutcome::Stored {
            document_id: "arXiv:1234.5678".into(),
            target_material: "MOF-5".into(),
            precursors: 2,
            conditions: 1,
            source_pages: vec![2],
            replaced: false,
        });
        assert_eq!(
            text,
            "[1/2] STORED arXiv:1234.5678 -> MOF-5 (2 precursors, 1 conditions, page 2)\n"
        );
    }

    #[test]
    fn failed_outcome_shows_reason() {
        let text = render(&DocumentOutcome::Failed {
            document_id: "file://a.pdf".into(),
            reason: "inference unavailable: timed out".into(),
        });
        assert!(text.starts_with("[1/2] FAILED file://a.pdf\n"));
        assert!(text.contains("inference unavailable"));
    }

    #[test]
    fn summary_hides_zero_cancelled() {
        let summary = BatchSummary {
            stored: 2,
            no_data: 1,
            ..Default::default()
        };
        let mut buf = Vec::new();
        print_summary(&mut buf, &summary, ColorMode(false)).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Documents:        3"));
        assert!(text.contains("Stored:           2"));
        assert!(!text.contains("Cancelled"));
    }

    #[test]
    fn event_descriptions_name_pages() {
        assert_eq!(
            describe_event(&ExtractionEvent::Attempt { pages: vec![1, 2] }),
            "reading pages 1, 2"
        );
        assert_eq!(
            describe_event(&ExtractionEvent::Exhausted { pages_tried: 5 }),
            "no structured data in 5 page(s)"
        );
    }
}
