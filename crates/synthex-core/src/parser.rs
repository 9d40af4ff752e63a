//! Tolerant parsing of raw model output into a [`SynthesisExtraction`].
//!
//! The backend offers no grammar guarantees, so the text is treated as
//! untrusted: wrapping is stripped, every JSON object found is parsed into a
//! generic tree, and the first one that validates against the schema wins.
//! Anything that can be defaulted is defaulted; only the two required fields
//! can fail a payload.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::schema::{Condition, Precursor, SynthesisExtraction, fields};

/// Why a payload could not be turned into an extraction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("model returned an empty response")]
    EmptyPayload,
    #[error("no JSON object found in model response")]
    NotJson,
    #[error("required field '{0}' is missing or empty")]
    MissingRequiredField(&'static str),
}

static THINK_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<think>.*?</think>").unwrap());

/// Values models use to say "I don't know"; treated as absent for required fields.
const PLACEHOLDERS: &[&str] = &["unknown", "n/a", "na", "none", "null", "not specified"];

/// Parse raw model text into a validated extraction.
///
/// Every JSON object the text carries is a candidate: the whole text, the
/// fenced body, each balanced `{...}` fragment, and each object element of an
/// array root. The first candidate that validates wins. When none does, the
/// first validation failure is reported, or `NotJson` if no candidate parsed.
pub fn parse(raw: &str) -> Result<SynthesisExtraction, ParseFailure> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ParseFailure::EmptyPayload);
    }

    let mut failure = None;

    // Untouched text first, so reasoning tags inside string values survive.
    let direct = std::iter::once(raw).chain(strip_code_fence(raw));
    if let Some(extraction) = first_valid(direct, &mut failure) {
        return Ok(extraction);
    }

    let cleaned = THINK_BLOCK.replace_all(raw, "");
    let text = cleaned.trim();
    if text.is_empty() {
        return Err(failure.unwrap_or(ParseFailure::EmptyPayload));
    }

    let candidates = std::iter::once(text)
        .chain(strip_code_fence(text))
        .chain(fragments(text));
    if let Some(extraction) = first_valid(candidates, &mut failure) {
        return Ok(extraction);
    }

    Err(failure.unwrap_or(ParseFailure::NotJson))
}

/// Validate the objects of each candidate in order, keeping the first failure.
fn first_valid<'a>(
    candidates: impl Iterator<Item = &'a str>,
    failure: &mut Option<ParseFailure>,
) -> Option<SynthesisExtraction> {
    for object in candidates.flat_map(objects) {
        match validate(&object) {
            Ok(extraction) => return Some(extraction),
            Err(err) => {
                failure.get_or_insert(err);
            }
        }
    }
    None
}

/// JSON objects carried by `candidate`: the root object, or the object
/// elements of a root array. Scalars and invalid JSON carry none.
fn objects(candidate: &str) -> Vec<Map<String, Value>> {
    match serde_json::from_str::<Value>(candidate) {
        Ok(Value::Object(map)) => vec![map],
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Every balanced `{...}` fragment of `text`, one per opening brace. An
/// opening brace that is never closed is skipped.
fn fragments(text: &str) -> impl Iterator<Item = &str> {
    text.match_indices('{').filter_map(move |(start, _)| {
        balanced_len(&text[start..]).map(|len| &text[start..start + len])
    })
}

/// Body of the first ``` fenced block, with the language tag line removed.
fn strip_code_fence(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let body_start = after_open.find('\n')? + 1;
    let body = &after_open[body_start..];
    let close = body.find("```").unwrap_or(body.len());
    Some(body[..close].trim())
}

/// Length of the balanced object opening at the start of `text`, ignoring
/// braces inside JSON string literals.
fn balanced_len(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in text.char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(idx + 1);
                }
            }
            _ => {}
        }
    }

    None
}

fn validate(object: &Map<String, Value>) -> Result<SynthesisExtraction, ParseFailure> {
    let [target_key, method_key] = fields::REQUIRED;
    let target_material = required_text(object, target_key)?;
    let method_type = required_text(object, method_key)?;

    let precursors = entries(object, fields::PRECURSORS, precursor_from);
    let conditions = entries(object, fields::CONDITIONS, condition_from);

    Ok(SynthesisExtraction {
        target_material,
        method_type,
        precursors,
        conditions,
        notes: first_text(object, &fields::NOTES_ALIASES),
        visual_evidence: object.get(fields::VISUAL_EVIDENCE).and_then(text_of),
    })
}

fn required_text(object: &Map<String, Value>, key: &'static str) -> Result<String, ParseFailure> {
    object
        .get(key)
        .and_then(text_of)
        .filter(|v| !is_placeholder(v))
        .ok_or(ParseFailure::MissingRequiredField(key))
}

/// Parse every element of an optional array field, dropping the ones that
/// don't fit. A missing or non-array field is an empty list.
fn entries<T>(
    object: &Map<String, Value>,
    key: &str,
    convert: impl Fn(&Value) -> Option<T>,
) -> Vec<T> {
    let Some(Value::Array(items)) = object.get(key) else {
        return Vec::new();
    };

    let parsed: Vec<T> = items.iter().filter_map(convert).collect();
    let dropped = items.len() - parsed.len();
    if dropped > 0 {
        tracing::debug!(field = key, dropped, kept = parsed.len(), "dropped malformed entries");
    }
    parsed
}

fn precursor_from(value: &Value) -> Option<Precursor> {
    match value {
        Value::String(_) => text_of(value).map(Precursor::named),
        Value::Object(entry) => {
            let name = first_text(entry, &fields::PRECURSOR_NAME_ALIASES)?;
            let amount = entry.get(fields::PRECURSOR_AMOUNT).and_then(text_of);
            let unit = entry.get(fields::UNIT).and_then(text_of);
            Some(Precursor {
                name,
                role: entry.get(fields::PRECURSOR_ROLE).and_then(text_of),
                amount: join_amount(amount, unit),
            })
        }
        _ => None,
    }
}

fn condition_from(value: &Value) -> Option<Condition> {
    let entry = value.as_object()?;
    Some(Condition {
        parameter_name: first_text(entry, &fields::PARAMETER_NAME_ALIASES)?,
        value: entry.get(fields::VALUE).and_then(text_of)?,
        unit: entry.get(fields::UNIT).and_then(text_of),
    })
}

/// Amount and unit are stored together; a unit with no amount says nothing.
fn join_amount(amount: Option<String>, unit: Option<String>) -> Option<String> {
    match (amount, unit) {
        (Some(amount), Some(unit)) if !amount.ends_with(unit.as_str()) => {
            Some(format!("{} {}", amount, unit))
        }
        (amount, _) => amount,
    }
}

fn first_text(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| object.get(*key).and_then(text_of))
}

/// Non-empty trimmed text of a string or number value.
fn text_of(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn is_placeholder(value: &str) -> bool {
    PLACEHOLDERS.iter().any(|p| value.eq_ignore_ascii_case(p))
}
