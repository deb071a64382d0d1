//! Variable-reference mini-language.
//!
//! `stem ('[' signedInt ']')? ('.' transform)?`, e.g. `Cr[-3].rate7`.
//! `;`-separated lists form multi-variable requests and `/`-separated
//! rows form multi-vector batches. Resolving a computed variable pulls
//! its dependency stems into the caller's working set, so a client that
//! asks for `GFR` implicitly receives `Cr`, `AgeYears` and the rest of
//! its inputs.

use crate::error::{Error, Result};
use crate::meta::MetadataTable;
use crate::timefunc::TransformKind;

/// A resolved variable reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarRef {
    pub stem: String,
    /// Day offset relative to the queried entry; 0 reads the entry itself.
    pub offset: i64,
    pub transform: Option<TransformKind>,
}

impl VarRef {
    pub fn direct(stem: impl Into<String>) -> Self {
        Self {
            stem: stem.into(),
            offset: 0,
            transform: None,
        }
    }
}

/// Resolve one reference against the metadata table.
pub fn resolve(table: &MetadataTable, name: &str) -> Result<VarRef> {
    let (stem, offset, transform) = split_reference(name)?;
    if table.get(stem).is_none() {
        return Err(Error::UnknownVariable(stem.to_string()));
    }
    let transform = transform.map(TransformKind::parse).transpose()?;
    Ok(VarRef {
        stem: stem.to_string(),
        offset,
        transform,
    })
}

/// Resolve one reference and grow `needed` with it and the dependency
/// closure of its stem. A dependency is skipped when the set already
/// holds an entry with the same stem, whatever its offset or transform.
pub fn resolve_into(table: &MetadataTable, name: &str, needed: &mut Vec<VarRef>) -> Result<VarRef> {
    let var = resolve(table, name)?;
    if !needed.contains(&var) {
        needed.push(var.clone());
    }
    add_dependencies(table, &var.stem, needed);
    Ok(var)
}

fn add_dependencies(table: &MetadataTable, stem: &str, needed: &mut Vec<VarRef>) {
    let Some(descriptor) = table.get(stem) else {
        return;
    };
    for dep in descriptor.depends_on.clone() {
        if needed.iter().any(|v| v.stem == dep) {
            continue;
        }
        needed.push(VarRef::direct(dep.clone()));
        add_dependencies(table, &dep, needed);
    }
}

/// Parse a `;`-separated request list, growing the working set with
/// dependency closures. Empty pieces are ignored.
pub fn parse_request_list(table: &MetadataTable, text: &str) -> Result<Vec<VarRef>> {
    let mut needed = Vec::new();
    for piece in text.split(';') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        resolve_into(table, piece, &mut needed)?;
    }
    Ok(needed)
}

/// Parse a `/`-separated batch of request rows.
pub fn parse_request_rows(table: &MetadataTable, text: &str) -> Result<Vec<Vec<VarRef>>> {
    text.split('/')
        .map(|row| parse_request_list(table, row))
        .collect()
}

fn split_reference(name: &str) -> Result<(&str, i64, Option<&str>)> {
    let name = name.trim();
    let bad = || Error::MalformedRecord(format!("bad variable reference: {name}"));

    let (head, transform) = match name.rfind('.') {
        Some(dot) => {
            let t = &name[dot + 1..];
            if t.is_empty() {
                return Err(bad());
            }
            (&name[..dot], Some(t))
        }
        None => (name, None),
    };

    let (stem, offset) = match head.find('[') {
        Some(open) => {
            let close = head.rfind(']').filter(|&c| c > open).ok_or_else(bad)?;
            if close != head.len() - 1 {
                return Err(bad());
            }
            let offset = head[open + 1..close].parse::<i64>().map_err(|_| bad())?;
            (&head[..open], offset)
        }
        None => (head, 0),
    };
    if stem.is_empty() {
        return Err(bad());
    }
    Ok((stem, offset, transform))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{names, MetadataTable};

    #[test]
    fn reference_grammar() {
        let table = MetadataTable::clinical_default();
        let var = resolve(&table, "Cr").unwrap();
        assert_eq!(var, VarRef::direct("Cr"));

        let var = resolve(&table, "Cr[-3].rate7").unwrap();
        assert_eq!(var.stem, "Cr");
        assert_eq!(var.offset, -3);
        assert_eq!(var.transform, Some(TransformKind::Rate7));

        let var = resolve(&table, "Na[+2]").unwrap();
        assert_eq!(var.offset, 2);

        assert!(matches!(
            resolve(&table, "NotAVar"),
            Err(Error::UnknownVariable(_))
        ));
        assert!(matches!(
            resolve(&table, "Cr.sigmoid"),
            Err(Error::UnknownTransform(_))
        ));
        assert!(resolve(&table, "Cr[3").is_err());
        assert!(resolve(&table, "[3]").is_err());
    }

    #[test]
    fn computed_request_pulls_dependencies() {
        let table = MetadataTable::clinical_default();
        let needed = parse_request_list(&table, names::GFR).unwrap();
        let stems: Vec<&str> = needed.iter().map(|v| v.stem.as_str()).collect();
        assert_eq!(stems[0], names::GFR);
        for dep in [names::CR, names::AGE_YEARS, names::IS_MALE, names::IS_BLACK] {
            assert!(stems.contains(&dep), "missing {dep}");
        }
    }

    #[test]
    fn dependency_dedupe_ignores_offset_and_transform() {
        let table = MetadataTable::clinical_default();
        // Cr[-3].rate already covers the Cr stem; GFR's Cr dependency
        // must not add a second entry.
        let needed = parse_request_list(&table, "Cr[-3].rate;GFR").unwrap();
        let cr_entries = needed.iter().filter(|v| v.stem == names::CR).count();
        assert_eq!(cr_entries, 1);
        assert_eq!(needed[0].offset, -3);
    }

    #[test]
    fn rows_split_on_slash() {
        let table = MetadataTable::clinical_default();
        let rows = parse_request_rows(&table, "Cr;Na/MELD").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 2);
        // MELD's closure includes its lab inputs.
        assert!(rows[1].iter().any(|v| v.stem == names::TBILI));
    }
}
