//
// Copyright (c) The sysrepo2-rs Core Contributors
//
// SPDX-License-Identifier: MIT
//

//! Parsing of the XPath subset used to address data nodes.
//!
//! Only simple location paths are understood: a sequence of
//! `/prefix:name[key='value']...` steps. List instances are selected with
//! key predicates, leaf-list instances with a `[.='value']` predicate.
//! This matches the paths produced by the engine in change records.

use crate::error::{Error, Result};

/// One step of a location path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Segment {
    /// Module prefix, if the step is qualified (`prefix:name`).
    pub prefix: Option<String>,
    /// Node name.
    pub name: String,
    /// Key predicates in declaration order. The leaf-list value predicate
    /// `[.='x']` is stored with `.` as the key name.
    pub predicates: Vec<(String, String)>,
}

impl Segment {
    /// Render the predicates back into their bracketed form.
    pub fn predicate_string(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.predicates {
            out.push_str(&format!("[{}='{}']", key, value));
        }
        out
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, "{}:", prefix)?;
        }
        write!(f, "{}{}", self.name, self.predicate_string())
    }
}

/// Split an XPath into its segments.
///
/// Trailing `//.` (used when requesting full change subtrees) is ignored.
/// A lone `*` name is accepted and kept as-is (`/module:*` selects a whole
/// module).
pub fn split(xpath: &str) -> Result<Vec<Segment>> {
    let mut chars = xpath.chars().peekable();
    let mut segments = Vec::new();

    if chars.peek() != Some(&'/') {
        return Err(Error::inval_arg(format!(
            "xpath must be absolute: {:?}",
            xpath
        )));
    }

    while chars.peek().is_some() {
        match chars.next() {
            Some('/') => (),
            _ => {
                return Err(Error::inval_arg(format!(
                    "malformed xpath: {:?}",
                    xpath
                )))
            }
        }
        // Trailing "//." selects all descendants; it does not name a node.
        if chars.peek() == Some(&'/') {
            chars.next();
            if chars.next() == Some('.') && chars.peek().is_none() {
                break;
            }
            return Err(Error::inval_arg(format!(
                "malformed xpath: {:?}",
                xpath
            )));
        }

        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c == '/' || c == '[' {
                break;
            }
            name.push(c);
            chars.next();
        }
        if name.is_empty() {
            return Err(Error::inval_arg(format!(
                "empty step in xpath: {:?}",
                xpath
            )));
        }

        let (prefix, name) = match name.find(':') {
            Some(pos) => {
                let (p, n) = name.split_at(pos);
                (Some(p.to_owned()), n[1..].to_owned())
            }
            None => (None, name),
        };

        let mut predicates = Vec::new();
        while chars.peek() == Some(&'[') {
            chars.next();
            let mut key = String::new();
            while let Some(&c) = chars.peek() {
                if c == '=' {
                    break;
                }
                key.push(c);
                chars.next();
            }
            if chars.next() != Some('=') {
                return Err(Error::inval_arg(format!(
                    "malformed predicate in xpath: {:?}",
                    xpath
                )));
            }
            let quote = match chars.next() {
                Some(q @ '\'') | Some(q @ '"') => q,
                _ => {
                    return Err(Error::inval_arg(format!(
                        "unquoted predicate value in xpath: {:?}",
                        xpath
                    )))
                }
            };
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == quote => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(Error::inval_arg(format!(
                            "unterminated predicate in xpath: {:?}",
                            xpath
                        )))
                    }
                }
            }
            if chars.next() != Some(']') {
                return Err(Error::inval_arg(format!(
                    "unterminated predicate in xpath: {:?}",
                    xpath
                )));
            }
            predicates.push((key.trim().to_owned(), value));
        }

        segments.push(Segment {
            prefix,
            name,
            predicates,
        });
    }

    if segments.is_empty() {
        return Err(Error::inval_arg(format!("empty xpath: {:?}", xpath)));
    }

    Ok(segments)
}

/// First step of the path, used to find the module a path belongs to.
pub fn first_step(xpath: &str) -> Result<Segment> {
    let mut segments = split(xpath)?;
    Ok(segments.remove(0))
}
