//! The permission lookup table: which permissions each framework API requires.
//!
//! The table is read from a text file with one API per line:
//!
//! ```text
//! # method                                                                        permissions
//! Landroid/location/LocationManager;->getLastKnownLocation(Ljava/lang/String;)Landroid/location/Location;  android.permission.ACCESS_FINE_LOCATION,android.permission.ACCESS_COARSE_LOCATION
//! ```

use crate::error::RmPermError;
use crate::smali_ops::{parse_method_ref, MethodRef};
use log::info;
use nom::bytes::complete::take_while1;
use nom::character::complete::{char, space0, space1};
use nom::combinator::all_consuming;
use nom::multi::separated_list1;
use nom::sequence::{delimited, terminated};
use nom::IResult;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;

#[derive(Debug, Default, Clone)]
pub struct PermissionTable {
    apis: HashMap<MethodRef, BTreeSet<String>>,
}

fn parse_permission(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != ',' && c != '#')(input)
}

fn parse_table_line(input: &str) -> IResult<&str, (MethodRef, Vec<&str>)> {
    let (input, method) = parse_method_ref(input)?;
    let (input, _) = space1(input)?;
    let (input, permissions) =
        terminated(separated_list1(delimited(space0, char(','), space0), parse_permission), space0)(input)?;
    Ok((input, (method, permissions)))
}

impl PermissionTable {
    pub fn new() -> PermissionTable {
        PermissionTable::default()
    }

    /// Records that `method` requires `permissions`, merging with anything already known.
    /// An empty set is refused: every entry in the table must name at least one permission.
    pub fn insert(&mut self, method: MethodRef, permissions: BTreeSet<String>) -> Result<(), RmPermError> {
        if permissions.is_empty() {
            fail!("No permissions given for {}", method);
        }
        self.apis.entry(method).or_default().extend(permissions);
        Ok(())
    }

    pub fn get(&self, method: &MethodRef) -> Option<&BTreeSet<String>> {
        self.apis.get(method)
    }

    pub fn contains(&self, method: &MethodRef) -> bool {
        self.apis.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.apis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apis.is_empty()
    }

    /// Every permission mentioned anywhere in the table.
    pub fn permissions(&self) -> BTreeSet<&str> {
        self.apis.values().flatten().map(String::as_str).collect()
    }

    pub fn from_text(text: &str) -> Result<PermissionTable, RmPermError> {
        let mut table = PermissionTable::new();
        for (n, line) in text.lines().enumerate() {
            let line = match line.find('#') {
                Some(i) => &line[..i],
                None => line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            match all_consuming(parse_table_line)(line) {
                Ok((_, (method, permissions))) => {
                    let permissions = permissions.into_iter().map(str::to_string).collect();
                    table.insert(method, permissions)?;
                }
                Err(_) => fail!("Malformed permission table entry on line {}: `{}`", n + 1, line),
            }
        }
        Ok(table)
    }

    pub fn read_from_file(path: &Path) -> Result<PermissionTable, RmPermError> {
        let text = fs::read_to_string(path)
            .map_err(|e| err!("Error loading permission table {}: {}", path.display(), e))?;
        let table = PermissionTable::from_text(&text).map_err(|e| err!(e, context: "{}", path.display()))?;
        info!("Loaded {} permission-protected APIs from {}", table.len(), path.display());
        Ok(table)
    }
}
