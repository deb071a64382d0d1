//! Server-calculated variables.
//!
//! Each derived variable is a table entry pairing a name with a compute
//! function over the current accumulator; the forward pass iterates the
//! table generically after every raw update, so a new derived variable
//! is a new entry here, not a new branch in the compiler. Compute
//! functions read already-known past/current values only.

use crate::meta::names;
use crate::value::Value;

/// Read access to the current-state accumulator.
pub trait ValueView {
    fn number(&self, name: &str) -> Option<f64>;
    fn flag(&self, name: &str) -> Option<bool>;
}

pub struct DerivedVar {
    pub name: &'static str,
    pub compute: fn(&dyn ValueView) -> Option<Value>,
}

/// Evaluation order matters: stages read the scores computed above them.
/// `BaselineCr` is maintained by the compiler's rolling window and is
/// already in the accumulator when this table runs.
pub const DERIVED_TABLE: &[DerivedVar] = &[
    DerivedVar {
        name: names::GFR,
        compute: |view| {
            let cr = view.number(names::CR)?;
            let age = view.number(names::AGE_YEARS)?;
            let male = view.flag(names::IS_MALE)?;
            let black = view.flag(names::IS_BLACK).unwrap_or(false);
            Some(Value::Float(egfr(cr, age, male, black)?))
        },
    },
    DerivedVar {
        name: names::IN_AKI,
        compute: |view| {
            let cr = view.number(names::CR)?;
            let baseline = view.number(names::BASELINE_CR)?;
            Some(Value::Bool(in_aki(cr, baseline)))
        },
    },
    DerivedVar {
        name: names::MELD,
        compute: |view| {
            let cr = view.number(names::CR)?;
            let bili = view.number(names::TBILI)?;
            let inr = view.number(names::INR)?;
            let na = view.number(names::NA);
            let dialysis = view.flag(names::ON_DIALYSIS).unwrap_or(false);
            Some(Value::Float(meld_na(cr, bili, inr, na, dialysis)))
        },
    },
    DerivedVar {
        name: names::KIDNEY_STAGE,
        compute: |view| {
            let gfr = view.number(names::GFR)?;
            Some(Value::Int(kidney_stage(gfr) as i64))
        },
    },
    DerivedVar {
        name: names::LIVER_STAGE,
        compute: |view| {
            let meld = view.number(names::MELD)?;
            Some(Value::Int(liver_stage(meld) as i64))
        },
    },
];

/// MDRD estimated GFR in mL/min/1.73m².
pub fn egfr(cr: f64, age_years: f64, male: bool, black: bool) -> Option<f64> {
    if cr <= 0.0 || age_years <= 0.0 {
        return None;
    }
    let mut gfr = 175.0 * cr.powf(-1.154) * age_years.powf(-0.203);
    if !male {
        gfr *= 0.742;
    }
    if black {
        gfr *= 1.212;
    }
    Some(gfr)
}

/// MELD with the sodium adjustment. Labs below 1.0 read as 1.0;
/// creatinine caps at 4.0 and reads as 4.0 on dialysis; sodium clamps to
/// [125, 137]; the score clamps to [6, 40].
pub fn meld_na(cr: f64, bili: f64, inr: f64, na: Option<f64>, dialysis: bool) -> f64 {
    let cr = if dialysis { 4.0 } else { cr.clamp(1.0, 4.0) };
    let bili = bili.max(1.0);
    let inr = inr.max(1.0);
    let mut meld = 3.78 * bili.ln() + 11.2 * inr.ln() + 9.57 * cr.ln() + 6.43;
    if let Some(na) = na {
        let na = na.clamp(125.0, 137.0);
        meld = meld + 1.32 * (137.0 - na) - 0.033 * meld * (137.0 - na);
    }
    meld.clamp(6.0, 40.0)
}

/// Acute kidney injury: current creatinine at or above 1.5x the rolling
/// baseline.
pub fn in_aki(cr: f64, baseline: f64) -> bool {
    baseline > 0.0 && cr >= 1.5 * baseline
}

/// CKD stage from eGFR; higher is worse.
pub fn kidney_stage(gfr: f64) -> u8 {
    if gfr >= 90.0 {
        1
    } else if gfr >= 60.0 {
        2
    } else if gfr >= 30.0 {
        3
    } else if gfr >= 15.0 {
        4
    } else {
        5
    }
}

/// Liver-severity stage from the MELD score; higher is worse.
pub fn liver_stage(meld: f64) -> u8 {
    if meld < 10.0 {
        1
    } else if meld < 20.0 {
        2
    } else if meld < 30.0 {
        3
    } else {
        4
    }
}

pub const KIDNEY_MAX_STAGE: u8 = 5;
pub const LIVER_MAX_STAGE: u8 = 4;
