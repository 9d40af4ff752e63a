//! Canonical shape of a structured synthesis extraction.
//!
//! This module is the single source of truth for field names: the prompt
//! builder renders [`output_template`] into its instructions and the response
//! parser looks keys up through [`fields`]. Nothing else should spell a field
//! name out by hand.

use serde::{Deserialize, Serialize};

/// JSON keys of a [`SynthesisExtraction`] and its nested entries.
pub mod fields {
    pub const TARGET_MATERIAL: &str = "target_material";
    pub const METHOD_TYPE: &str = "method_type";
    pub const PRECURSORS: &str = "precursors";
    pub const CONDITIONS: &str = "conditions";
    pub const NOTES: &str = "notes";
    pub const VISUAL_EVIDENCE: &str = "visual_evidence";

    pub const PRECURSOR_NAME: &str = "name";
    pub const PRECURSOR_ROLE: &str = "role";
    pub const PRECURSOR_AMOUNT: &str = "amount";

    pub const PARAMETER_NAME: &str = "parameter_name";
    pub const VALUE: &str = "value";
    pub const UNIT: &str = "unit";

    /// Fields whose absence makes a payload unrecoverable, in check order.
    pub const REQUIRED: [&str; 2] = [TARGET_MATERIAL, METHOD_TYPE];

    /// Keys accepted for a condition's parameter name. Models frequently
    /// shorten it to `parameter`.
    pub const PARAMETER_NAME_ALIASES: [&str; 2] = [PARAMETER_NAME, "parameter"];

    /// Keys accepted for free-text notes.
    pub const NOTES_ALIASES: [&str; 2] = [NOTES, "description"];

    /// Keys accepted for a precursor's name.
    pub const PRECURSOR_NAME_ALIASES: [&str; 3] = [PRECURSOR_NAME, "precursor", "compound"];
}

/// A reagent used in a synthesis, in document reading order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precursor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Amount as printed, unit included (e.g. "2.0 g").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
}

impl Precursor {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: None,
            amount: None,
        }
    }
}

/// A process parameter. Values stay textual because source documents mix
/// units and notations freely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub parameter_name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Condition {
    pub fn new(parameter_name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            parameter_name: parameter_name.into(),
            value: value.into(),
            unit: None,
        }
    }
}

/// A validated synthesis protocol as returned by the response parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisExtraction {
    pub target_material: String,
    pub method_type: String,
    #[serde(default)]
    pub precursors: Vec<Precursor>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Tables or figures the model says it read the data from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visual_evidence: Option<String>,
}

impl SynthesisExtraction {
    pub fn new(target_material: impl Into<String>, method_type: impl Into<String>) -> Self {
        Self {
            target_material: target_material.into(),
            method_type: method_type.into(),
            precursors: Vec::new(),
            conditions: Vec::new(),
            notes: None,
            visual_evidence: None,
        }
    }

    /// Canonical JSON form. Feeding it back through the parser yields an
    /// identical value.
    pub fn to_canonical_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// True if `other` describes the same target material.
    pub fn same_target(&self, other: &SynthesisExtraction) -> bool {
        self.target_material
            .trim()
            .eq_ignore_ascii_case(other.target_material.trim())
    }

    /// Fold entries from a later extraction of the same protocol into this one.
    ///
    /// Precursors are matched by name and conditions by (parameter, value),
    /// case-insensitively; only unseen entries are appended. Returns the
    /// number of entries added.
    pub fn absorb(&mut self, other: SynthesisExtraction) -> usize {
        let mut added = 0;

        for precursor in other.precursors {
            let known = self
                .precursors
                .iter()
                .any(|p| p.name.eq_ignore_ascii_case(&precursor.name));
            if !known {
                self.precursors.push(precursor);
                added += 1;
            }
        }

        for condition in other.conditions {
            let known = self.conditions.iter().any(|c| {
                c.parameter_name
                    .eq_ignore_ascii_case(&condition.parameter_name)
                    && c.value.eq_ignore_ascii_case(&condition.value)
            });
            if !known {
                self.conditions.push(condition);
                added += 1;
            }
        }

        if self.notes.is_none() {
            self.notes = other.notes;
        }
        if self.visual_evidence.is_none() {
            self.visual_evidence = other.visual_evidence;
        }

        added
    }
}

/// JSON skeleton shown to the model, with a short hint per field.
pub fn output_template() -> String {
    use fields::*;

    format!(
        r#"{{
    "{TARGET_MATERIAL}": "Name of the material synthesized",
    "{METHOD_TYPE}": "e.g. Sol-gel, Hydrothermal, Solvothermal, Solid-state",
    "{PRECURSORS}": [
        {{"{PRECURSOR_NAME}": "Precursor name", "{PRECURSOR_ROLE}": "e.g. metal source, linker, solvent", "{PRECURSOR_AMOUNT}": "Amount with unit"}}
    ],
    "{CONDITIONS}": [
        {{"{PARAMETER_NAME}": "temperature", "{VALUE}": "120", "{UNIT}": "C"}},
        {{"{PARAMETER_NAME}": "time", "{VALUE}": "24", "{UNIT}": "h"}}
    ],
    "{NOTES}": "Brief summary of the procedure",
    "{VISUAL_EVIDENCE}": "Tables or figures used, e.g. 'Table 1 lists reactants'"
}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_is_valid_json_with_every_field() {
        let value: serde_json::Value = serde_json::from_str(&output_template()).unwrap();
        let obj = value.as_object().unwrap();
        for key in [
            fields::TARGET_MATERIAL,
            fields::METHOD_TYPE,
            fields::PRECURSORS,
            fields::CONDITIONS,
            fields::NOTES,
            fields::VISUAL_EVIDENCE,
        ] {
            assert!(obj.contains_key(key), "template missing {key}");
        }
        let condition = &obj[fields::CONDITIONS][0];
        assert!(condition.get(fields::PARAMETER_NAME).is_some());
        assert!(condition.get(fields::VALUE).is_some());
    }

    #[test]
    fn canonical_json_uses_schema_keys() {
        let mut extraction = SynthesisExtraction::new("MOF-5", "solvothermal");
        extraction.precursors.push(Precursor::named("H2BDC"));
        extraction
            .conditions
            .push(Condition::new("temperature", "120C"));

        let value: serde_json::Value =
            serde_json::from_str(&extraction.to_canonical_json()).unwrap();
        assert_eq!(value[fields::TARGET_MATERIAL], "MOF-5");
        assert_eq!(value[fields::METHOD_TYPE], "solvothermal");
        assert_eq!(value[fields::PRECURSORS][0][fields::PRECURSOR_NAME], "H2BDC");
        assert_eq!(
            value[fields::CONDITIONS][0][fields::PARAMETER_NAME],
            "temperature"
        );
        // Absent optionals are omitted rather than serialized as null
        assert!(value.get(fields::NOTES).is_none());
    }

    #[test]
    fn absorb_appends_only_unseen_entries() {
        let mut base = SynthesisExtraction::new("ZIF-8", "solvothermal");
        base.precursors.push(Precursor::named("Zinc nitrate"));
        base.conditions.push(Condition::new("temperature", "120"));

        let mut later = SynthesisExtraction::new("zif-8", "solvothermal");
        later.precursors.push(Precursor::named("zinc nitrate"));
        later.precursors.push(Precursor::named("2-methylimidazole"));
        later.conditions.push(Condition::new("Temperature", "120"));
        later.conditions.push(Condition::new("time", "24 h"));
        later.notes = Some("Stirred then aged.".into());

        assert!(base.same_target(&later));
        assert_eq!(base.absorb(later), 2);
        assert_eq!(base.precursors.len(), 2);
        assert_eq!(base.conditions.len(), 2);
        assert_eq!(base.notes.as_deref(), Some("Stirred then aged."));
    }
}
