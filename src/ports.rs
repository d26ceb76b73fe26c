use anyhow::{bail, Context, Result};
use std::collections::HashSet;

/// Parse a port specification into a deduplicated list of TCP ports (1..=65535).
///
/// Supported forms, separated by commas or newlines:
/// - single port number: `80`
/// - inclusive range: `4000-4002`
/// - comments: everything after `#` on a line is ignored
/// - whitespace and empty items are ignored
///
/// Order of first appearance is preserved, so `3000,4000-4002` yields
/// `[3000, 4000, 4001, 4002]`.
pub fn parse_port_spec(s: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    let items = s
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|item| !item.is_empty());

    for item in items {
        if let Some((a, b)) = item.split_once('-') {
            let start = parse_port(a.trim())
                .with_context(|| format!("invalid start in range: {item}"))?;
            let end = parse_port(b.trim())
                .with_context(|| format!("invalid end in range: {item}"))?;
            if start > end {
                bail!("invalid range {start}-{end} (start > end)");
            }
            for p in start..=end {
                if seen.insert(p) {
                    out.push(p);
                }
            }
            continue;
        }

        let p = parse_port(item).with_context(|| format!("invalid port value: {item}"))?;
        if seen.insert(p) {
            out.push(p);
        }
    }

    if out.is_empty() {
        bail!("port specification is empty: {s:?}");
    }
    Ok(out)
}

fn parse_port(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_ports() {
        let ports = parse_port_spec("80,22, 443 ").unwrap();
        assert_eq!(ports, vec![80, 22, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_port_spec("3000,4000-4002,4001").unwrap();
        assert_eq!(ports, vec![3000, 4000, 4001, 4002]);
    }

    #[test]
    fn parse_lines_with_comments() {
        let input = r#"
            # sink ports
            80  # http
            443,8443 # https
            8000-8002
        "#;
        let ports = parse_port_spec(input).unwrap();
        assert_eq!(ports, vec![80, 443, 8443, 8000, 8001, 8002]);
    }

    #[test]
    fn invalid_values_error() {
        assert!(parse_port_spec("70000").is_err());
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("http").is_err());
        assert!(parse_port_spec("9000-8000").is_err());
        assert!(parse_port_spec(" , ").is_err());
    }
}
