//! Stateful time-series transforms.
//!
//! A transform owns whatever rolling buffer it needs; buffers belong to
//! one (patient, variable, transform) instance and are never shared.
//! Every instance must be `reset()` before a new patient; stale history
//! leaking across patients is a correctness bug, not a performance one.

use std::collections::VecDeque;

use crate::error::{Error, Result};

/// Pluggable per-variable stateful transform.
pub trait TimeFunction: Send {
    /// Forget all history. Called once per patient before compilation.
    fn reset(&mut self);

    /// Observe a raw value at (day, minute-of-day). Returns `None` while
    /// insufficient history exists, e.g. a rate before two samples.
    fn compute_new_value(&mut self, raw: f64, day: i64, minute_of_day: u16) -> Option<f64>;
}

/// The transform vocabulary of the variable-reference mini-language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    Delta,
    Rate,
    Rate7,
    Rate14,
    Rate30,
    Rate60,
    Rate90,
    Rate180,
    Accel,
    /// 1.0 when the 7-day rate outruns the 60-day rate in magnitude.
    FastRate,
    RunningAvg,
    BollingerUp,
    BollingerLow,
    Range,
    RelativeRange,
}

impl TransformKind {
    pub fn parse(name: &str) -> Result<TransformKind> {
        match name {
            "delta" => Ok(TransformKind::Delta),
            "rate" => Ok(TransformKind::Rate),
            "rate7" => Ok(TransformKind::Rate7),
            "rate14" => Ok(TransformKind::Rate14),
            "rate30" => Ok(TransformKind::Rate30),
            "rate60" => Ok(TransformKind::Rate60),
            "rate90" => Ok(TransformKind::Rate90),
            "rate180" => Ok(TransformKind::Rate180),
            "accel" => Ok(TransformKind::Accel),
            "fastrate" => Ok(TransformKind::FastRate),
            "runavg" => Ok(TransformKind::RunningAvg),
            "bollup" => Ok(TransformKind::BollingerUp),
            "bolllow" => Ok(TransformKind::BollingerLow),
            "range" => Ok(TransformKind::Range),
            "relrange" => Ok(TransformKind::RelativeRange),
            _ => Err(Error::UnknownTransform(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransformKind::Delta => "delta",
            TransformKind::Rate => "rate",
            TransformKind::Rate7 => "rate7",
            TransformKind::Rate14 => "rate14",
            TransformKind::Rate30 => "rate30",
            TransformKind::Rate60 => "rate60",
            TransformKind::Rate90 => "rate90",
            TransformKind::Rate180 => "rate180",
            TransformKind::Accel => "accel",
            TransformKind::FastRate => "fastrate",
            TransformKind::RunningAvg => "runavg",
            TransformKind::BollingerUp => "bollup",
            TransformKind::BollingerLow => "bolllow",
            TransformKind::Range => "range",
            TransformKind::RelativeRange => "relrange",
        }
    }

    /// Instantiate a fresh transform with empty history.
    pub fn instantiate(&self) -> Box<dyn TimeFunction> {
        match self {
            TransformKind::Delta => Box::new(Delta::default()),
            TransformKind::Rate => Box::new(Rate::default()),
            TransformKind::Rate7 => Box::new(WindowRate::new(7.0)),
            TransformKind::Rate14 => Box::new(WindowRate::new(14.0)),
            TransformKind::Rate30 => Box::new(WindowRate::new(30.0)),
            TransformKind::Rate60 => Box::new(WindowRate::new(60.0)),
            TransformKind::Rate90 => Box::new(WindowRate::new(90.0)),
            TransformKind::Rate180 => Box::new(WindowRate::new(180.0)),
            TransformKind::Accel => Box::new(Accel::default()),
            TransformKind::FastRate => Box::new(FastRate::new(7.0, 60.0)),
            TransformKind::RunningAvg => Box::new(RunningAvg::default()),
            TransformKind::BollingerUp => Box::new(Bollinger::new(true)),
            TransformKind::BollingerLow => Box::new(Bollinger::new(false)),
            TransformKind::Range => Box::new(Range::default()),
            TransformKind::RelativeRange => Box::new(RelativeRange::default()),
        }
    }
}

fn fractional_day(day: i64, minute_of_day: u16) -> f64 {
    day as f64 + minute_of_day as f64 / 1440.0
}

/// Change since the previous sample.
#[derive(Default)]
struct Delta {
    prev: Option<f64>,
}

impl TimeFunction for Delta {
    fn reset(&mut self) {
        self.prev = None;
    }

    fn compute_new_value(&mut self, raw: f64, _day: i64, _minute_of_day: u16) -> Option<f64> {
        let out = self.prev.map(|p| raw - p);
        self.prev = Some(raw);
        out
    }
}

/// Rate of change per day between consecutive samples.
#[derive(Default)]
struct Rate {
    prev: Option<(f64, f64)>,
}

impl TimeFunction for Rate {
    fn reset(&mut self) {
        self.prev = None;
    }

    fn compute_new_value(&mut self, raw: f64, day: i64, minute_of_day: u16) -> Option<f64> {
        let t = fractional_day(day, minute_of_day);
        let out = match self.prev {
            Some((pt, pv)) if t > pt => Some((raw - pv) / (t - pt)),
            _ => None,
        };
        self.prev = Some((t, raw));
        out
    }
}

/// Rate per day across a fixed trailing window.
struct WindowRate {
    window_days: f64,
    samples: VecDeque<(f64, f64)>,
}

impl WindowRate {
    fn new(window_days: f64) -> Self {
        Self {
            window_days,
            samples: VecDeque::new(),
        }
    }

    fn push(&mut self, t: f64, raw: f64) {
        self.samples.push_back((t, raw));
        while let Some(&(front, _)) = self.samples.front() {
            if t - front > self.window_days {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn rate(&self) -> Option<f64> {
        let (t0, v0) = *self.samples.front()?;
        let (t1, v1) = *self.samples.back()?;
        if t1 > t0 {
            Some((v1 - v0) / (t1 - t0))
        } else {
            None
        }
    }
}

impl TimeFunction for WindowRate {
    fn reset(&mut self) {
        self.samples.clear();
    }

    fn compute_new_value(&mut self, raw: f64, day: i64, minute_of_day: u16) -> Option<f64> {
        self.push(fractional_day(day, minute_of_day), raw);
        self.rate()
    }
}

/// Change of the consecutive-sample rate, per day. Needs three samples.
#[derive(Default)]
struct Accel {
    prev: Option<(f64, f64)>,
    prev_rate: Option<(f64, f64)>,
}

impl TimeFunction for Accel {
    fn reset(&mut self) {
        self.prev = None;
        self.prev_rate = None;
    }

    fn compute_new_value(&mut self, raw: f64, day: i64, minute_of_day: u16) -> Option<f64> {
        let t = fractional_day(day, minute_of_day);
        let rate = match self.prev {
            Some((pt, pv)) if t > pt => Some((raw - pv) / (t - pt)),
            _ => None,
        };
        self.prev = Some((t, raw));
        let out = match (rate, self.prev_rate) {
            (Some(r), Some((rt, pr))) if t > rt => Some((r - pr) / (t - rt)),
            _ => None,
        };
        if let Some(r) = rate {
            self.prev_rate = Some((t, r));
        }
        out
    }
}

/// 1.0 when the short-window rate exceeds the long-window rate in
/// magnitude, 0.0 otherwise.
struct FastRate {
    short: WindowRate,
    long: WindowRate,
}

impl FastRate {
    fn new(short_days: f64, long_days: f64) -> Self {
        Self {
            short: WindowRate::new(short_days),
            long: WindowRate::new(long_days),
        }
    }
}

impl TimeFunction for FastRate {
    fn reset(&mut self) {
        self.short.reset();
        self.long.reset();
    }

    fn compute_new_value(&mut self, raw: f64, day: i64, minute_of_day: u16) -> Option<f64> {
        let short = self.short.compute_new_value(raw, day, minute_of_day);
        let long = self.long.compute_new_value(raw, day, minute_of_day);
        match (short, long) {
            (Some(s), Some(l)) => Some(if s.abs() > l.abs() { 1.0 } else { 0.0 }),
            _ => None,
        }
    }
}

/// Mean of every sample seen so far.
#[derive(Default)]
struct RunningAvg {
    count: u64,
    sum: f64,
}

impl TimeFunction for RunningAvg {
    fn reset(&mut self) {
        self.count = 0;
        self.sum = 0.0;
    }

    fn compute_new_value(&mut self, raw: f64, _day: i64, _minute_of_day: u16) -> Option<f64> {
        self.count += 1;
        self.sum += raw;
        Some(self.sum / self.count as f64)
    }
}

const BOLLINGER_PERIOD: usize = 20;
const BOLLINGER_MIN_SAMPLES: usize = 5;
const BOLLINGER_WIDTH: f64 = 2.0;

/// Band-breach flag: 1.0 when the new sample lands outside
/// mean ± 2σ of the trailing samples, 0.0 inside.
struct Bollinger {
    upper: bool,
    samples: VecDeque<f64>,
}

impl Bollinger {
    fn new(upper: bool) -> Self {
        Self {
            upper,
            samples: VecDeque::new(),
        }
    }
}

impl TimeFunction for Bollinger {
    fn reset(&mut self) {
        self.samples.clear();
    }

    fn compute_new_value(&mut self, raw: f64, _day: i64, _minute_of_day: u16) -> Option<f64> {
        // Bands come from history excluding the sample being judged.
        let out = if self.samples.len() >= BOLLINGER_MIN_SAMPLES {
            let n = self.samples.len() as f64;
            let mean = self.samples.iter().sum::<f64>() / n;
            let var = self.samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            let band = BOLLINGER_WIDTH * var.sqrt();
            let breached = if self.upper {
                raw > mean + band
            } else {
                raw < mean - band
            };
            Some(if breached { 1.0 } else { 0.0 })
        } else {
            None
        };
        self.samples.push_back(raw);
        if self.samples.len() > BOLLINGER_PERIOD {
            self.samples.pop_front();
        }
        out
    }
}

/// Spread between the highest and lowest sample seen so far.
#[derive(Default)]
struct Range {
    min: Option<f64>,
    max: Option<f64>,
    count: u64,
}

impl Range {
    fn observe(&mut self, raw: f64) {
        self.count += 1;
        self.min = Some(self.min.map_or(raw, |m| m.min(raw)));
        self.max = Some(self.max.map_or(raw, |m| m.max(raw)));
    }
}

impl TimeFunction for Range {
    fn reset(&mut self) {
        *self = Range::default();
    }

    fn compute_new_value(&mut self, raw: f64, _day: i64, _minute_of_day: u16) -> Option<f64> {
        self.observe(raw);
        if self.count < 2 {
            return None;
        }
        Some(self.max? - self.min?)
    }
}

/// Range relative to the running mean magnitude.
#[derive(Default)]
struct RelativeRange {
    range: Range,
    sum: f64,
}

impl TimeFunction for RelativeRange {
    fn reset(&mut self) {
        self.range.reset();
        self.sum = 0.0;
    }

    fn compute_new_value(&mut self, raw: f64, day: i64, minute_of_day: u16) -> Option<f64> {
        self.sum += raw;
        let spread = self.range.compute_new_value(raw, day, minute_of_day)?;
        let mean = self.sum / self.range.count as f64;
        if mean.abs() < f64::EPSILON {
            return None;
        }
        Some(spread / mean.abs())
    }
}
