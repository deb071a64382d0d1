//! TDF element grammar.
//!
//! The source format is line-oriented and XML-flavored: one element per
//! line inside a `<Patient>` block. Parsing is lenient by policy: a
//! malformed element is skipped with a warning and compilation of the
//! surrounding patient continues. Only a missing document or head is
//! fatal.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Decode raw bytes leniently: undecodable byte sequences are dropped
/// rather than failing the read.
pub fn decode_lenient(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.contains('\u{FFFD}') {
        text.chars().filter(|&c| c != '\u{FFFD}').collect()
    } else {
        text.into_owned()
    }
}

/// Event timestamp: `dd:hh:mm` or `dd:hh:mm:ss`, all fields at least two
/// digits. The day field counts age-in-days from a deidentified epoch,
/// never a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp {
    pub day: i64,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
}

impl Timestamp {
    pub fn new(day: i64, hour: u8, minute: u8) -> Self {
        Self {
            day,
            hour,
            minute,
            second: 0,
        }
    }

    /// Sub-day interval index used for entry identity.
    pub fn minute_of_day(&self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }

    pub fn parse(text: &str) -> Option<Timestamp> {
        let mut parts = text.split(':');
        let day = parse_ts_field(parts.next()?)?;
        let hour = parse_ts_field(parts.next()?)?;
        let minute = parse_ts_field(parts.next()?)?;
        let second = match parts.next() {
            Some(s) => parse_ts_field(s)?,
            None => 0,
        };
        if parts.next().is_some() || hour >= 24 || minute >= 60 || second >= 60 {
            return None;
        }
        Some(Timestamp {
            day,
            hour: hour as u8,
            minute: minute as u8,
            second: second as u8,
        })
    }
}

fn parse_ts_field(text: &str) -> Option<i64> {
    if text.len() < 2 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}:{:02}", self.day, self.hour, self.minute)?;
        if self.second != 0 {
            write!(f, ":{:02}", self.second)?;
        }
        Ok(())
    }
}

/// Class of an `<E>` event element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventClass {
    Admit,
    Discharge,
    Death,
    IcuIn,
    IcuOut,
    Intubation,
    Extubation,
    Dialysis,
    DialysisEnd,
    Surgery,
    Procedure,
    Med,
}

impl EventClass {
    pub fn parse(text: &str) -> Option<EventClass> {
        match text.to_ascii_lowercase().as_str() {
            "admit" => Some(EventClass::Admit),
            "discharge" => Some(EventClass::Discharge),
            "death" => Some(EventClass::Death),
            "icuin" => Some(EventClass::IcuIn),
            "icuout" => Some(EventClass::IcuOut),
            "intubation" => Some(EventClass::Intubation),
            "extubation" => Some(EventClass::Extubation),
            "dialysisstart" => Some(EventClass::Dialysis),
            "dialysisstop" => Some(EventClass::DialysisEnd),
            "surgery" => Some(EventClass::Surgery),
            "procedure" => Some(EventClass::Procedure),
            "med" => Some(EventClass::Med),
            _ => None,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            EventClass::Admit => "Admit",
            EventClass::Discharge => "Discharge",
            EventClass::Death => "Death",
            EventClass::IcuIn => "ICUIn",
            EventClass::IcuOut => "ICUOut",
            EventClass::Intubation => "Intubation",
            EventClass::Extubation => "Extubation",
            EventClass::Dialysis => "DialysisStart",
            EventClass::DialysisEnd => "DialysisStop",
            EventClass::Surgery => "Surgery",
            EventClass::Procedure => "Procedure",
            EventClass::Med => "Med",
        }
    }
}

/// Class of a `<D>` data-point element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataClass {
    Labs,
    Vitals,
    Diagnosis,
}

impl DataClass {
    pub fn parse(text: &str) -> Option<DataClass> {
        match text {
            "L" => Some(DataClass::Labs),
            "V" => Some(DataClass::Vitals),
            "Dx" => Some(DataClass::Diagnosis),
            _ => None,
        }
    }

    pub fn wire_name(&self) -> &'static str {
        match self {
            DataClass::Labs => "L",
            DataClass::Vitals => "V",
            DataClass::Diagnosis => "Dx",
        }
    }
}

/// One parsed unit from a patient block. Owned transiently by the
/// forward pass and discarded after use.
#[derive(Debug, Clone, PartialEq)]
pub struct RawElement {
    pub ts: Timestamp,
    pub kind: ElementKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    /// `<E C=class T=ts V=value D=detail />`
    Event {
        class: EventClass,
        value: Option<String>,
        detail: Option<String>,
    },
    /// `<D C=class T=ts>name=val,name=val</D>`
    Data {
        class: DataClass,
        assignments: Vec<(String, String)>,
    },
    /// `<OC scope=Admit>name=value;...</OC>`. No timestamp on the wire;
    /// stamped with the most recent element's timestamp during parse.
    Outcome {
        scope: String,
        flags: Vec<(String, String)>,
    },
    /// `<Text C=class T=ts>...</Text>`, carried but never parsed further.
    Text { class: String, body: String },
}

/// Attributes of a `<Patient id=.. gender=.. race=..>` open tag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatientHeader {
    pub id: String,
    pub gender: String,
    pub race: String,
}

/// One located patient's parsed contents.
#[derive(Debug, Clone)]
pub struct PatientRecord {
    pub header: PatientHeader,
    pub elements: Vec<RawElement>,
}

/// Escape attribute or body text for emission.
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape_text(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let (entity, len) = match rest {
            r if r.starts_with("&amp;") => ('&', 5),
            r if r.starts_with("&lt;") => ('<', 4),
            r if r.starts_with("&gt;") => ('>', 4),
            r if r.starts_with("&quot;") => ('"', 6),
            _ => ('&', 1),
        };
        out.push(entity);
        rest = &rest[len..];
    }
    out.push_str(rest);
    out
}

/// Scan `key=value` attribute pairs. Bare values end at whitespace;
/// quoted values may contain anything but an unescaped quote.
fn parse_attrs(text: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    let mut rest = text.trim();
    while !rest.is_empty() && !rest.starts_with('/') && !rest.starts_with('>') {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(tail) = rest.strip_prefix('"') {
            let end = tail.find('"').unwrap_or(tail.len());
            value = unescape_text(&tail[..end]);
            rest = tail.get(end + 1..).unwrap_or("");
        } else {
            let end = rest
                .find(|c: char| c.is_whitespace() || c == '>')
                .unwrap_or(rest.len());
            let mut raw = &rest[..end];
            if let Some(stripped) = raw.strip_suffix('/') {
                // Bare value abutting a self-closing tag.
                raw = stripped;
            }
            value = unescape_text(raw);
            rest = &rest[end..];
        }
        rest = rest.trim_start();
        if !key.is_empty() {
            attrs.push((key, value));
        }
    }
    attrs
}

fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

/// A structurally recognized line of a TDF document.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    TdfOpen,
    TdfClose,
    HeadOpen,
    HeadClose,
    PatientListOpen,
    PatientListClose,
    PatientOpen(PatientHeader),
    PatientClose,
    Element(RawElement),
    Blank,
    /// Free text (head metadata, stray content). Never an error.
    Other(String),
}

/// Classify one line. An element line that cannot be parsed is a
/// `MalformedRecord` error; the caller decides whether to skip it.
pub fn parse_line(line: &str) -> Result<Line> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(Line::Blank);
    }
    match trimmed {
        "<TDF>" => return Ok(Line::TdfOpen),
        "</TDF>" => return Ok(Line::TdfClose),
        "<Head>" => return Ok(Line::HeadOpen),
        "</Head>" => return Ok(Line::HeadClose),
        "<PatientList>" => return Ok(Line::PatientListOpen),
        "</PatientList>" => return Ok(Line::PatientListClose),
        "</Patient>" => return Ok(Line::PatientClose),
        _ => {}
    }
    if let Some(body) = trimmed.strip_prefix("<Patient") {
        let attrs = parse_attrs(body);
        return Ok(Line::PatientOpen(PatientHeader {
            id: attr(&attrs, "id").unwrap_or_default().to_string(),
            gender: attr(&attrs, "gender").unwrap_or_default().to_string(),
            race: attr(&attrs, "race").unwrap_or_default().to_string(),
        }));
    }
    if let Some(body) = trimmed.strip_prefix("<E ") {
        return parse_event(body).map(Line::Element);
    }
    if let Some(body) = trimmed.strip_prefix("<D ") {
        return parse_data(body, trimmed).map(Line::Element);
    }
    if let Some(body) = trimmed.strip_prefix("<OC") {
        return parse_outcome(body, trimmed).map(Line::Element);
    }
    if let Some(body) = trimmed.strip_prefix("<Text ") {
        return parse_text(body, trimmed).map(Line::Element);
    }
    Ok(Line::Other(trimmed.to_string()))
}

fn parse_event(body: &str) -> Result<RawElement> {
    let attrs = parse_attrs(body);
    let class = attr(&attrs, "C")
        .and_then(EventClass::parse)
        .ok_or_else(|| Error::MalformedRecord(format!("bad event class in <E {body}")))?;
    let ts = attr(&attrs, "T")
        .and_then(Timestamp::parse)
        .ok_or_else(|| Error::MalformedRecord(format!("bad event timestamp in <E {body}")))?;
    Ok(RawElement {
        ts,
        kind: ElementKind::Event {
            class,
            value: attr(&attrs, "V").map(str::to_string),
            detail: attr(&attrs, "D").map(str::to_string),
        },
    })
}

fn parse_data(body: &str, line: &str) -> Result<RawElement> {
    let (head, tail) = split_container(body, "</D>")
        .ok_or_else(|| Error::MalformedRecord(format!("unterminated data element: {line}")))?;
    let attrs = parse_attrs(head);
    let class = attr(&attrs, "C")
        .and_then(DataClass::parse)
        .ok_or_else(|| Error::MalformedRecord(format!("bad data class: {line}")))?;
    let ts = attr(&attrs, "T")
        .and_then(Timestamp::parse)
        .ok_or_else(|| Error::MalformedRecord(format!("bad data timestamp: {line}")))?;
    let assignments = parse_pairs(tail, ',');
    Ok(RawElement {
        ts,
        kind: ElementKind::Data { class, assignments },
    })
}

fn parse_outcome(body: &str, line: &str) -> Result<RawElement> {
    let (head, tail) = split_container(body, "</OC>")
        .ok_or_else(|| Error::MalformedRecord(format!("unterminated outcome element: {line}")))?;
    let attrs = parse_attrs(head);
    let scope = attr(&attrs, "scope").unwrap_or("Admit").to_string();
    let flags = parse_pairs(tail, ';');
    // Outcomes carry no timestamp; the record parser restamps this with
    // the most recent element's timestamp.
    Ok(RawElement {
        ts: Timestamp::new(0, 0, 0),
        kind: ElementKind::Outcome { scope, flags },
    })
}

fn parse_text(body: &str, line: &str) -> Result<RawElement> {
    let (head, tail) = split_container(body, "</Text>")
        .ok_or_else(|| Error::MalformedRecord(format!("unterminated text element: {line}")))?;
    let attrs = parse_attrs(head);
    let ts = attr(&attrs, "T")
        .and_then(Timestamp::parse)
        .ok_or_else(|| Error::MalformedRecord(format!("bad text timestamp: {line}")))?;
    Ok(RawElement {
        ts,
        kind: ElementKind::Text {
            class: attr(&attrs, "C").unwrap_or_default().to_string(),
            body: unescape_text(tail),
        },
    })
}

/// Split `attrs>inner</Close>` into (attrs, inner).
fn split_container<'a>(body: &'a str, close: &str) -> Option<(&'a str, &'a str)> {
    let gt = body.find('>')?;
    let inner = &body[gt + 1..];
    let end = inner.rfind(close)?;
    Some((&body[..gt], &inner[..end]))
}

fn parse_pairs(text: &str, sep: char) -> Vec<(String, String)> {
    text.split(sep)
        .filter_map(|piece| {
            let piece = piece.trim();
            if piece.is_empty() {
                return None;
            }
            let (name, value) = piece.split_once('=')?;
            Some((
                unescape_text(name.trim()),
                unescape_text(value.trim()),
            ))
        })
        .collect()
}

/// Parse one located patient block. Malformed element lines are skipped
/// with a warning; the block fails only when the open tag is missing.
pub fn parse_patient(text: &str) -> Result<PatientRecord> {
    let mut lines = text.lines();
    let mut header = None;
    for line in lines.by_ref() {
        match parse_line(line)? {
            Line::PatientOpen(h) => {
                header = Some(h);
                break;
            }
            Line::Blank | Line::Other(_) => continue,
            _ => {
                return Err(Error::MalformedRecord(
                    "patient block does not start with <Patient>".to_string(),
                ))
            }
        }
    }
    let header = header.ok_or_else(|| {
        Error::MalformedRecord("patient block does not start with <Patient>".to_string())
    })?;

    let mut elements = Vec::new();
    let mut last_ts = Timestamp::new(0, 0, 0);
    for line in lines {
        match parse_line(line) {
            Ok(Line::Element(mut element)) => {
                if matches!(element.kind, ElementKind::Outcome { .. }) {
                    element.ts = last_ts;
                } else {
                    last_ts = element.ts;
                }
                elements.push(element);
            }
            Ok(Line::PatientClose) => break,
            Ok(_) => {}
            Err(err) => {
                log::warn!("skipping malformed element: {err}");
            }
        }
    }
    Ok(PatientRecord { header, elements })
}
