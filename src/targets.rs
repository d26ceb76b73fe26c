use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use crate::types::{DomainJob, Job, PayloadJob};

/// Read target lines from `paths` in order, or from stdin when none are given.
///
/// Lines are trimmed; blank lines are dropped.
pub fn read_lines(paths: &[PathBuf]) -> Result<Vec<String>> {
    let mut text = String::new();
    if paths.is_empty() {
        io::stdin()
            .read_to_string(&mut text)
            .context("failed to read targets from stdin")?;
    } else {
        for path in paths {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read targets file: {}", path.display()))?;
            text.push_str(&content);
            text.push('\n');
        }
    }
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// One domain job per line.
pub fn domain_jobs(lines: &[String]) -> Result<Vec<Job>> {
    let jobs = lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            DomainJob::new(line.as_str())
                .map(Job::from)
                .with_context(|| format!("target {}", i + 1))
        })
        .collect::<Result<Vec<_>>>()?;
    if jobs.is_empty() {
        bail!("no domains to test");
    }
    Ok(jobs)
}

/// Every hex payload line crossed with every port, payload-major.
pub fn payload_jobs(lines: &[String], ports: &[u16]) -> Result<Vec<Job>> {
    let mut jobs = Vec::with_capacity(lines.len() * ports.len());
    for (i, line) in lines.iter().enumerate() {
        let payload = hex::decode(line)
            .with_context(|| format!("payload {}: not valid hex: {line}", i + 1))?;
        for &port in ports {
            let job = PayloadJob::new(payload.clone(), port)
                .with_context(|| format!("payload {}", i + 1))?;
            jobs.push(job.into());
        }
    }
    if jobs.is_empty() {
        bail!("no payloads to test");
    }
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reads_files_in_order_skipping_blanks() {
        let mut a = tempfile::NamedTempFile::new().unwrap();
        writeln!(a, "example.com\n\n  blocked.example  ").unwrap();
        let mut b = tempfile::NamedTempFile::new().unwrap();
        write!(b, "third.example").unwrap();
        let got = read_lines(&[a.path().to_path_buf(), b.path().to_path_buf()]).unwrap();
        assert_eq!(got, lines(&["example.com", "blocked.example", "third.example"]));
    }

    #[test]
    fn missing_file_is_error() {
        assert!(read_lines(&[PathBuf::from("/nonexistent/targets.txt")]).is_err());
    }

    #[test]
    fn domain_jobs_validate_each_line() {
        let jobs = domain_jobs(&lines(&["example.com", "blocked.example"])).unwrap();
        assert_eq!(jobs.len(), 2);
        let err = domain_jobs(&lines(&["ok.example", "bad..example"])).unwrap_err();
        assert!(format!("{err:#}").contains("target 2"));
        assert!(domain_jobs(&[]).is_err());
    }

    #[test]
    fn payload_jobs_are_payload_major() {
        let jobs = payload_jobs(&lines(&["0a0b", "ff"]), &[80, 443]).unwrap();
        let pairs: Vec<(Vec<u8>, u16)> = jobs
            .into_iter()
            .map(|j| match j {
                Job::Payload(p) => (p.payload().to_vec(), p.port()),
                Job::Domain(_) => unreachable!(),
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                (vec![0x0a, 0x0b], 80),
                (vec![0x0a, 0x0b], 443),
                (vec![0xff], 80),
                (vec![0xff], 443),
            ]
        );
    }

    #[test]
    fn payload_jobs_reject_bad_hex() {
        assert!(payload_jobs(&lines(&["zz"]), &[80]).is_err());
        assert!(payload_jobs(&lines(&["abc"]), &[80]).is_err());
    }
}
