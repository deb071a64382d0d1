//! TDF emission.
//!
//! Not a general serializer: it produces syntactically exact documents
//! for the declared element kinds, so values written here and read back
//! through the locator and compiler reproduce the same variable values.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::Result;
use crate::tdf::element::{
    escape_text, DataClass, ElementKind, EventClass, PatientHeader, RawElement, Timestamp,
};

pub struct TdfWriter<W: Write> {
    out: W,
    in_patient: bool,
}

impl TdfWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> TdfWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            in_patient: false,
        }
    }

    /// Emit the document preamble: `<TDF>`, the head block, and the
    /// patient list opener.
    pub fn begin(&mut self, head_lines: &[&str]) -> Result<()> {
        writeln!(self.out, "<TDF>")?;
        writeln!(self.out, "<Head>")?;
        for line in head_lines {
            writeln!(self.out, "{}", escape_text(line))?;
        }
        writeln!(self.out, "</Head>")?;
        writeln!(self.out, "<PatientList>")?;
        Ok(())
    }

    pub fn begin_patient(&mut self, header: &PatientHeader) -> Result<()> {
        writeln!(
            self.out,
            "<Patient id={} gender={} race={}>",
            attr_value(&header.id),
            attr_value(&header.gender),
            attr_value(&header.race)
        )?;
        self.in_patient = true;
        Ok(())
    }

    pub fn event(
        &mut self,
        ts: Timestamp,
        class: EventClass,
        value: Option<&str>,
        detail: Option<&str>,
    ) -> Result<()> {
        write!(self.out, "<E C={} T={ts}", class.wire_name())?;
        if let Some(value) = value {
            write!(self.out, " V={}", attr_value(value))?;
        }
        if let Some(detail) = detail {
            write!(self.out, " D={}", attr_value(detail))?;
        }
        writeln!(self.out, " />")?;
        Ok(())
    }

    pub fn data(&mut self, ts: Timestamp, class: DataClass, assignments: &[(&str, &str)]) -> Result<()> {
        write!(self.out, "<D C={} T={ts}>", class.wire_name())?;
        for (i, (name, value)) in assignments.iter().enumerate() {
            if i > 0 {
                write!(self.out, ",")?;
            }
            write!(self.out, "{}={}", escape_text(name), escape_text(value))?;
        }
        writeln!(self.out, "</D>")?;
        Ok(())
    }

    pub fn outcome(&mut self, scope: &str, flags: &[(&str, &str)]) -> Result<()> {
        write!(self.out, "<OC scope={}>", attr_value(scope))?;
        for (i, (name, value)) in flags.iter().enumerate() {
            if i > 0 {
                write!(self.out, ";")?;
            }
            write!(self.out, "{}={}", escape_text(name), escape_text(value))?;
        }
        writeln!(self.out, "</OC>")?;
        Ok(())
    }

    /// Free-text body. The format is line-oriented, so embedded newlines
    /// are flattened to spaces.
    pub fn text(&mut self, ts: Timestamp, class: &str, body: &str) -> Result<()> {
        let flat = body.replace(['\r', '\n'], " ");
        writeln!(
            self.out,
            "<Text C={} T={ts}>{}</Text>",
            attr_value(class),
            escape_text(&flat)
        )?;
        Ok(())
    }

    /// Emit an already-parsed element.
    pub fn element(&mut self, el: &RawElement) -> Result<()> {
        match &el.kind {
            ElementKind::Event {
                class,
                value,
                detail,
            } => self.event(el.ts, *class, value.as_deref(), detail.as_deref()),
            ElementKind::Data { class, assignments } => {
                let pairs: Vec<(&str, &str)> = assignments
                    .iter()
                    .map(|(n, v)| (n.as_str(), v.as_str()))
                    .collect();
                self.data(el.ts, *class, &pairs)
            }
            ElementKind::Outcome { scope, flags } => {
                let pairs: Vec<(&str, &str)> = flags
                    .iter()
                    .map(|(n, v)| (n.as_str(), v.as_str()))
                    .collect();
                self.outcome(scope, &pairs)
            }
            ElementKind::Text { class, body } => self.text(el.ts, class, body),
        }
    }

    pub fn end_patient(&mut self) -> Result<()> {
        writeln!(self.out, "</Patient>")?;
        self.in_patient = false;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        if self.in_patient {
            self.end_patient()?;
        }
        writeln!(self.out, "</PatientList>")?;
        writeln!(self.out, "</TDF>")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Attribute values are written bare when they contain no whitespace or
/// markup, quoted otherwise.
fn attr_value(value: &str) -> String {
    let needs_quotes = value.is_empty()
        || value
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '<' | '>' | '/'));
    if needs_quotes {
        format!("\"{}\"", escape_text(value))
    } else {
        escape_text(value)
    }
}
