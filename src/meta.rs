//! Variable metadata and medication tables.
//!
//! Loaded once into immutable, `Arc`-shared tables passed into the
//! compiler's constructor. Nothing here is mutated after load; every
//! patient compilation reads the same tables.
//!
//! A built-in clinical table covers the declared variable set; external
//! tables load from JSON rows with the same fields.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tdf::EventClass;

/// Interned variable identifier, index into the table's descriptor list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(u16);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Data kind of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VarKind {
    Int,
    Float,
    Bool,
    /// Bounded category; stored as an integer within [min, max].
    Category,
    /// Free-form string list (diagnosis text collections).
    StringList,
}

/// Daily carry-forward behavior at a day transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetRule {
    /// Carried into the next day unchanged (the default).
    #[default]
    Carry,
    /// Reset to zero at the start of each day (per-day counters).
    ZeroEachDay,
    /// Reset to unset at the start of each day (daily dose totals).
    UnsetEachDay,
    /// Removed entirely at the start of each day (day-transition flags).
    RemoveEachDay,
}

/// Staged progression tracked by the milestone sub-pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgressionId {
    Kidney,
    Liver,
}

/// What a future-event variable points at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FutureTarget {
    /// Nearest future occurrence of an event class.
    Event(EventClass),
    /// First day a staged progression reached (and held) the given stage.
    Milestone { progression: ProgressionId, stage: u8 },
    /// Death inside the admission containing the entry.
    DeathDuringAdmission,
}

/// Future-event spec: only present on future-event variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FutureSpec {
    pub target: FutureTarget,
    /// Lookahead the label needs to be trustworthy; used by the query
    /// layer to clip extraction bounds.
    pub horizon_days: i64,
}

/// One variable's metadata. Immutable after table construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableDescriptor {
    pub name: String,
    pub kind: VarKind,
    #[serde(default = "neg_unbounded")]
    pub min: f64,
    #[serde(default = "pos_unbounded")]
    pub max: f64,
    /// Recomputed by the compiler from `depends_on` after raw updates.
    #[serde(default)]
    pub computed: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub future: Option<FutureSpec>,
    #[serde(default)]
    pub reset: ResetRule,
}

fn neg_unbounded() -> f64 {
    f64::NEG_INFINITY
}

fn pos_unbounded() -> f64 {
    f64::INFINITY
}

impl VariableDescriptor {
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

/// The variable metadata table: name lookup plus interned ids.
#[derive(Debug)]
pub struct MetadataTable {
    vars: Vec<VariableDescriptor>,
    by_name: HashMap<String, VarId>,
}

impl MetadataTable {
    pub fn new() -> Self {
        Self {
            vars: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// The built-in clinical table, `Arc`-shared across workers.
    pub fn clinical_default() -> Arc<Self> {
        let mut table = Self::new();
        for var in default_variables() {
            table.insert(var);
        }
        Arc::new(table)
    }

    /// Load descriptors from a JSON array of rows.
    pub fn from_json(text: &str) -> Result<Self> {
        let rows: Vec<VariableDescriptor> = serde_json::from_str(text)
            .map_err(|_| Error::MalformedHead("unparseable variable table"))?;
        let mut table = Self::new();
        for row in rows {
            table.insert(row);
        }
        Ok(table)
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Insert a descriptor; a duplicate name replaces the prior entry's
    /// metadata but keeps its id.
    pub fn insert(&mut self, var: VariableDescriptor) -> VarId {
        if let Some(&id) = self.by_name.get(&var.name) {
            self.vars[id.index()] = var;
            return id;
        }
        let id = VarId(self.vars.len() as u16);
        self.by_name.insert(var.name.clone(), id);
        self.vars.push(var);
        id
    }

    pub fn id(&self, name: &str) -> Option<VarId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, name: &str) -> Option<&VariableDescriptor> {
        self.id(name).map(|id| &self.vars[id.index()])
    }

    pub fn descriptor(&self, id: VarId) -> &VariableDescriptor {
        &self.vars[id.index()]
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, &VariableDescriptor)> {
        self.vars
            .iter()
            .enumerate()
            .map(|(i, v)| (VarId(i as u16), v))
    }

    /// Variables carrying a future-event spec, in table order.
    pub fn future_vars(&self) -> impl Iterator<Item = (VarId, &VariableDescriptor, &FutureSpec)> {
        self.iter()
            .filter_map(|(id, v)| v.future.as_ref().map(|f| (id, v, f)))
    }

    /// Variables with a non-carry daily reset rule.
    pub fn daily_reset_vars(&self) -> impl Iterator<Item = (VarId, &VariableDescriptor)> {
        self.iter().filter(|(_, v)| v.reset != ResetRule::Carry)
    }
}

impl Default for MetadataTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Medication table: drug name (case-insensitive) to the variable that
/// accumulates its daily dose total.
#[derive(Debug)]
pub struct MedicationTable {
    by_drug: HashMap<String, String>,
}

impl MedicationTable {
    pub fn clinical_default() -> Arc<Self> {
        let mut by_drug = HashMap::new();
        for (drug, var) in [
            ("vancomycin", names::DOSE_VANCOMYCIN),
            ("furosemide", names::DOSE_FUROSEMIDE),
            ("insulin", names::DOSE_INSULIN),
            ("norepinephrine", names::DOSE_NOREPINEPHRINE),
        ] {
            by_drug.insert(drug.to_string(), var.to_string());
        }
        Arc::new(Self { by_drug })
    }

    pub fn dose_variable(&self, drug: &str) -> Option<&str> {
        self.by_drug
            .get(drug.to_ascii_lowercase().as_str())
            .map(String::as_str)
    }
}

/// Names the compiler itself reads or writes.
pub mod names {
    pub const AGE_YEARS: &str = "AgeYears";
    pub const IS_MALE: &str = "IsMale";
    pub const IS_BLACK: &str = "IsBlack";

    pub const CR: &str = "Cr";
    pub const NA: &str = "Na";
    pub const TBILI: &str = "TBili";
    pub const INR: &str = "INR";

    pub const INPATIENT: &str = "Inpatient";
    pub const IN_ICU: &str = "InICU";
    pub const INTUBATED: &str = "Intubated";
    pub const ON_DIALYSIS: &str = "OnDialysis";
    pub const ADMITTED_TODAY: &str = "AdmittedToday";
    pub const DISCHARGED_TODAY: &str = "DischargedToday";
    pub const SURGERIES_TODAY: &str = "SurgeriesToday";
    pub const PROCEDURES_TODAY: &str = "ProceduresToday";

    pub const DIAGNOSES: &str = "Diagnoses";

    pub const DOSE_VANCOMYCIN: &str = "DoseVancomycin";
    pub const DOSE_FUROSEMIDE: &str = "DoseFurosemide";
    pub const DOSE_INSULIN: &str = "DoseInsulin";
    pub const DOSE_NOREPINEPHRINE: &str = "DoseNorepinephrine";

    pub const GFR: &str = "GFR";
    pub const BASELINE_CR: &str = "BaselineCr";
    pub const IN_AKI: &str = "InAKI";
    pub const MELD: &str = "MELD";
    pub const KIDNEY_STAGE: &str = "KidneyStage";
    pub const LIVER_STAGE: &str = "LiverStage";

    pub const FUTURE_DEATH: &str = "FutureDeath";
    pub const FUTURE_INTUBATION: &str = "FutureIntubation";
    pub const FUTURE_DIALYSIS: &str = "FutureDialysis";
    pub const FUTURE_KIDNEY_STAGE4: &str = "FutureKidneyStage4";
    pub const FUTURE_LIVER_STAGE3: &str = "FutureLiverStage3";
    pub const WILL_DIE_THIS_ADMISSION: &str = "WillDieThisAdmission";
}

fn var(name: &str, kind: VarKind, min: f64, max: f64) -> VariableDescriptor {
    VariableDescriptor {
        name: name.to_string(),
        kind,
        min,
        max,
        computed: false,
        depends_on: Vec::new(),
        future: None,
        reset: ResetRule::Carry,
    }
}

fn lab(name: &str, min: f64, max: f64) -> VariableDescriptor {
    var(name, VarKind::Float, min, max)
}

fn flag(name: &str) -> VariableDescriptor {
    var(name, VarKind::Bool, 0.0, 1.0)
}

fn day_flag(name: &str) -> VariableDescriptor {
    VariableDescriptor {
        reset: ResetRule::RemoveEachDay,
        ..flag(name)
    }
}

fn counter(name: &str) -> VariableDescriptor {
    VariableDescriptor {
        reset: ResetRule::ZeroEachDay,
        ..var(name, VarKind::Int, 0.0, 99.0)
    }
}

fn dose(name: &str) -> VariableDescriptor {
    VariableDescriptor {
        reset: ResetRule::UnsetEachDay,
        ..var(name, VarKind::Float, 0.0, 100_000.0)
    }
}

fn computed(
    name: &str,
    kind: VarKind,
    min: f64,
    max: f64,
    deps: &[&str],
) -> VariableDescriptor {
    VariableDescriptor {
        computed: true,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        ..var(name, kind, min, max)
    }
}

fn future(name: &str, kind: VarKind, target: FutureTarget, horizon_days: i64) -> VariableDescriptor {
    VariableDescriptor {
        future: Some(FutureSpec {
            target,
            horizon_days,
        }),
        ..var(name, kind, 0.0, 13.0)
    }
}

fn default_variables() -> Vec<VariableDescriptor> {
    use names::*;
    vec![
        // Demographics, set once from the patient header.
        var(AGE_YEARS, VarKind::Int, 0.0, 120.0),
        flag(IS_MALE),
        flag(IS_BLACK),
        // Labs.
        lab(CR, 0.1, 25.0),
        lab("BUN", 1.0, 250.0),
        lab(NA, 100.0, 175.0),
        lab("K", 1.0, 10.0),
        lab("HCO3", 4.0, 60.0),
        lab("Glucose", 10.0, 1500.0),
        lab(TBILI, 0.1, 60.0),
        lab("Albumin", 0.5, 6.5),
        lab(INR, 0.5, 20.0),
        lab("WBC", 0.05, 300.0),
        lab("Hgb", 2.0, 25.0),
        lab("Plt", 1.0, 2000.0),
        lab("Lactate", 0.1, 35.0),
        lab("ALT", 1.0, 10_000.0),
        lab("AST", 1.0, 10_000.0),
        // Vitals.
        lab("HR", 20.0, 300.0),
        lab("SBP", 30.0, 320.0),
        lab("DBP", 10.0, 250.0),
        lab("RR", 2.0, 90.0),
        lab("TempC", 25.0, 45.0),
        lab("SpO2", 20.0, 100.0),
        lab("WeightKg", 0.5, 500.0),
        // Encounter state.
        flag(INPATIENT),
        flag(IN_ICU),
        flag(INTUBATED),
        flag(ON_DIALYSIS),
        day_flag(ADMITTED_TODAY),
        day_flag(DISCHARGED_TODAY),
        counter(SURGERIES_TODAY),
        counter(PROCEDURES_TODAY),
        // Daily dose totals, folded in at day close-out.
        dose(DOSE_VANCOMYCIN),
        dose(DOSE_FUROSEMIDE),
        dose(DOSE_INSULIN),
        dose(DOSE_NOREPINEPHRINE),
        // Diagnosis flags, plus the running list of every code seen.
        flag("Sepsis"),
        flag("Cirrhosis"),
        flag("DiabetesMellitus"),
        flag("HeartFailure"),
        var(
            DIAGNOSES,
            VarKind::StringList,
            f64::NEG_INFINITY,
            f64::INFINITY,
        ),
        // Admission outcome flags from <OC> elements.
        flag("DiedThisAdmission"),
        flag("ReadmittedWithin30"),
        // Server-calculated.
        computed(GFR, VarKind::Float, 0.0, 250.0, &[CR, AGE_YEARS, IS_MALE, IS_BLACK]),
        computed(BASELINE_CR, VarKind::Float, 0.1, 25.0, &[CR]),
        computed(IN_AKI, VarKind::Bool, 0.0, 1.0, &[CR, BASELINE_CR]),
        computed(MELD, VarKind::Float, 6.0, 40.0, &[CR, TBILI, INR, NA, ON_DIALYSIS]),
        computed(KIDNEY_STAGE, VarKind::Category, 0.0, 5.0, &[GFR]),
        computed(LIVER_STAGE, VarKind::Category, 0.0, 4.0, &[MELD]),
        // Future-event labels, written by the reverse pass.
        future(
            FUTURE_DEATH,
            VarKind::Category,
            FutureTarget::Event(EventClass::Death),
            3650,
        ),
        future(
            FUTURE_INTUBATION,
            VarKind::Category,
            FutureTarget::Event(EventClass::Intubation),
            30,
        ),
        future(
            FUTURE_DIALYSIS,
            VarKind::Category,
            FutureTarget::Event(EventClass::Dialysis),
            90,
        ),
        future(
            FUTURE_KIDNEY_STAGE4,
            VarKind::Category,
            FutureTarget::Milestone {
                progression: ProgressionId::Kidney,
                stage: 4,
            },
            365,
        ),
        future(
            FUTURE_LIVER_STAGE3,
            VarKind::Category,
            FutureTarget::Milestone {
                progression: ProgressionId::Liver,
                stage: 3,
            },
            365,
        ),
        future(
            WILL_DIE_THIS_ADMISSION,
            VarKind::Bool,
            FutureTarget::DeathDuringAdmission,
            365,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_resolves_core_names() {
        let table = MetadataTable::clinical_default();
        for name in [names::CR, names::GFR, names::MELD, names::FUTURE_DEATH] {
            assert!(table.get(name).is_some(), "missing {name}");
        }
        let gfr = table.get(names::GFR).unwrap();
        assert!(gfr.computed);
        assert_eq!(gfr.depends_on[0], names::CR);
    }

    #[test]
    fn ids_are_stable_and_dense() {
        let table = MetadataTable::clinical_default();
        let cr = table.id(names::CR).unwrap();
        assert_eq!(table.descriptor(cr).name, names::CR);
        assert!(table.len() > 40);
    }

    #[test]
    fn json_rows_load_with_defaults() {
        let rows = r#"[
            {"name": "Osm", "kind": "float", "min": 200.0, "max": 400.0},
            {"name": "OnEcmo", "kind": "bool", "reset": "remove_each_day"}
        ]"#;
        let table = MetadataTable::from_json(rows).unwrap();
        let osm = table.get("Osm").unwrap();
        assert_eq!(osm.kind, VarKind::Float);
        assert!(!osm.computed);
        assert_eq!(table.get("OnEcmo").unwrap().reset, ResetRule::RemoveEachDay);
    }

    #[test]
    fn medication_lookup_is_case_insensitive() {
        let meds = MedicationTable::clinical_default();
        assert_eq!(
            meds.dose_variable("Vancomycin"),
            Some(names::DOSE_VANCOMYCIN)
        );
        assert_eq!(meds.dose_variable("unknown-drug"), None);
    }
}
