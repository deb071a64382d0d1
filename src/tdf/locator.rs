//! Streaming record locator.
//!
//! Scans a byte range of a TDF file for `<Patient …> … </Patient>` spans
//! without loading the file wholesale. N workers can each own a disjoint
//! byte range of the same file: a record is considered by the partition
//! whose range contains the byte offset of its opening line, and is read
//! past `stop` until its closing marker. A record opening at or after
//! `stop` belongs to a neighboring partition.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{Error, Result};
use crate::tdf::element::{decode_lenient, parse_line, parse_patient, Line, PatientRecord};

/// A partition of the source file. `stop == 0` means "to end of file".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub stop: u64,
}

impl ByteRange {
    pub fn whole_file() -> Self {
        Self { start: 0, stop: 0 }
    }

    pub fn new(start: u64, stop: u64) -> Self {
        Self { start, stop }
    }
}

/// Byte offsets of one located patient record: `[start, stop)` covers
/// the opening line through the line after `</Patient>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordSpan {
    pub start: u64,
    pub stop: u64,
}

/// Cursor-based locator over one partition.
pub struct PatientLocator {
    reader: BufReader<File>,
    offset: u64,
    partition_stop: u64,
    line: Vec<u8>,
    done: bool,
}

impl PatientLocator {
    /// Open a locator over one byte range of `path`.
    ///
    /// A partition starting mid-file aligns itself to the next line
    /// boundary, so tiling `[0, len)` with contiguous ranges sees every
    /// line exactly once.
    pub fn open(path: impl AsRef<Path>, range: ByteRange) -> Result<Self> {
        if range.stop != 0 && range.stop < range.start {
            return Err(Error::InvalidPartition(format!(
                "stop {} before start {}",
                range.stop, range.start
            )));
        }
        let mut file = File::open(path)?;
        let mut offset = range.start;
        if range.start > 0 {
            // The byte before `start` decides whether `start` is already a
            // line boundary. If not, the opening line at the cut belongs to
            // the previous partition; skip to the next newline.
            file.seek(SeekFrom::Start(range.start - 1))?;
            let mut prev = [0u8; 1];
            let read = file.read(&mut prev)?;
            if read == 1 && prev[0] != b'\n' {
                let mut reader = BufReader::new(file);
                let mut skipped = Vec::new();
                let n = reader.read_until(b'\n', &mut skipped)?;
                offset = range.start + n as u64;
                return Ok(Self {
                    reader,
                    offset,
                    partition_stop: range.stop,
                    line: Vec::with_capacity(256),
                    done: false,
                });
            }
            file.seek(SeekFrom::Start(range.start))?;
        }
        Ok(Self {
            reader: BufReader::new(file),
            offset,
            partition_stop: range.stop,
            line: Vec::with_capacity(256),
            done: false,
        })
    }

    /// Locate the next record whose opening line starts inside this
    /// partition. `Err(IncompleteRecord)` reports an opening marker with
    /// no closing marker before end-of-file; the file's earlier records
    /// remain valid.
    pub fn next_patient(&mut self) -> Result<Option<RecordSpan>> {
        if self.done {
            return Ok(None);
        }
        loop {
            let line_start = self.offset;
            if self.partition_stop != 0 && line_start >= self.partition_stop {
                self.done = true;
                return Ok(None);
            }
            if !self.next_line()? {
                self.done = true;
                return Ok(None);
            }
            if !line_opens_patient(&self.line) {
                continue;
            }
            // Consume to the closing marker, past `stop` if need be.
            loop {
                if !self.next_line()? {
                    self.done = true;
                    return Err(Error::IncompleteRecord(line_start));
                }
                if line_trimmed(&self.line) == b"</Patient>" {
                    return Ok(Some(RecordSpan {
                        start: line_start,
                        stop: self.offset,
                    }));
                }
            }
        }
    }

    fn next_line(&mut self) -> Result<bool> {
        self.line.clear();
        let n = self.reader.read_until(b'\n', &mut self.line)?;
        self.offset += n as u64;
        Ok(n > 0)
    }
}

fn line_trimmed(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |p| p + 1);
    &line[start..end]
}

fn line_opens_patient(line: &[u8]) -> bool {
    let trimmed = line_trimmed(line);
    trimmed.starts_with(b"<Patient") && matches!(trimmed.get(8), Some(b' ') | Some(b'>'))
}

/// Locate every record in one partition. An unterminated trailing record
/// is reported with a warning and dropped; earlier records are kept.
pub fn find_patient_records(path: impl AsRef<Path>, range: ByteRange) -> Result<Vec<RecordSpan>> {
    let mut locator = PatientLocator::open(path, range)?;
    let mut spans = Vec::new();
    loop {
        match locator.next_patient() {
            Ok(Some(span)) => spans.push(span),
            Ok(None) => break,
            Err(Error::IncompleteRecord(start)) => {
                log::warn!("incomplete record at byte {start}, dropping tail");
                break;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(spans)
}

/// Random-access reader for located spans. Separate from the locator so
/// a worker can keep locating while records are read back.
pub struct PatientReader {
    file: File,
}

impl PatientReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: File::open(path)?,
        })
    }

    /// Read and parse one located record.
    pub fn read(&mut self, span: RecordSpan) -> Result<PatientRecord> {
        let len = usize::try_from(span.stop - span.start)
            .map_err(|_| Error::MalformedRecord("record span too large".to_string()))?;
        self.file.seek(SeekFrom::Start(span.start))?;
        let mut bytes = vec![0u8; len];
        self.file.read_exact(&mut bytes)?;
        parse_patient(&decode_lenient(&bytes))
    }
}

/// Document head metadata: descriptive strings only.
#[derive(Debug, Clone, Default)]
pub struct HeadInfo {
    pub lines: Vec<String>,
}

/// Parse the document head. A source without the `<TDF>` marker or a
/// head block is structurally broken and fatal, unlike any per-record
/// failure.
pub fn read_head(path: impl AsRef<Path>) -> Result<HeadInfo> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut line = Vec::new();
    let mut saw_tdf = false;
    let mut in_head = false;
    let mut head = HeadInfo::default();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Err(Error::MalformedHead("missing head block"));
        }
        let text = decode_lenient(&line);
        match parse_line(&text) {
            Ok(Line::TdfOpen) => saw_tdf = true,
            Ok(Line::HeadOpen) if saw_tdf => in_head = true,
            Ok(Line::HeadClose) if in_head => return Ok(head),
            Ok(Line::Blank) => {}
            Ok(Line::Other(content)) if in_head => head.lines.push(content),
            Ok(_) if in_head => {}
            Ok(_) | Err(_) => {
                return Err(Error::MalformedHead("document does not open with <TDF>/<Head>"))
            }
        }
    }
}
