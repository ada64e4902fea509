//! Port list parsing for firewall rules.

use std::collections::BTreeSet;

use crate::error::{Result, TemplateError};

/// A parsed port list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortSet {
    /// The `Any` keyword: every port.
    Any,
    /// An explicit set of ports.
    Ports(BTreeSet<u16>),
}

impl PortSet {
    /// Parses a list such as `80-81,443` or `Any`.
    ///
    /// # Errors
    ///
    /// Returns an error for a non-numeric entry, a reversed range or a port
    /// outside `1..=65535`.
    pub fn parse(spec: &str) -> Result<Self> {
        if spec.trim().eq_ignore_ascii_case("any") {
            return Ok(Self::Any);
        }

        let mut ports = BTreeSet::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once('-') {
                Some((start, end)) => {
                    let start = parse_port(spec, start)?;
                    let end = parse_port(spec, end)?;
                    if start > end {
                        return Err(invalid(spec, format!("range {entry} is reversed")));
                    }
                    ports.extend(start..=end);
                }
                None => {
                    ports.insert(parse_port(spec, entry)?);
                }
            }
        }
        Ok(Self::Ports(ports))
    }
}

/// Expands a port list into sorted unique ports.
///
/// `Any` expands to an empty list.
///
/// # Errors
///
/// Returns an error if the list cannot be parsed.
pub fn expand_port_ranges(spec: &str) -> Result<Vec<u16>> {
    match PortSet::parse(spec)? {
        PortSet::Any => Ok(Vec::new()),
        PortSet::Ports(ports) => Ok(ports.into_iter().collect()),
    }
}

fn parse_port(spec: &str, value: &str) -> Result<u16> {
    let port: u16 = value
        .trim()
        .parse()
        .map_err(|_| invalid(spec, format!("'{}' is not a port number", value.trim())))?;
    if port == 0 {
        return Err(invalid(spec, "port 0 is not valid"));
    }
    Ok(port)
}

fn invalid(spec: &str, reason: impl Into<String>) -> crate::error::ConvergentError {
    TemplateError::InvalidPortRange {
        spec: spec.to_string(),
        reason: reason.into(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_ranges() {
        assert_eq!(expand_port_ranges("80-81,443").expect("parse"), vec![80, 81, 443]);
        assert_eq!(expand_port_ranges(" 443 , 80-81 ,80").expect("parse"), vec![80, 81, 443]);
        assert!(expand_port_ranges("").expect("parse").is_empty());
    }

    #[test]
    fn test_any_keyword() {
        assert_eq!(PortSet::parse("Any").expect("parse"), PortSet::Any);
        assert_ne!(PortSet::parse("Any").expect("parse"), PortSet::parse("80").expect("parse"));
    }

    #[test]
    fn test_invalid_lists() {
        assert!(PortSet::parse("81-80").is_err());
        assert!(PortSet::parse("http").is_err());
        assert!(PortSet::parse("70000").is_err());
        assert!(PortSet::parse("0").is_err());
    }
}
