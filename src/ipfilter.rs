use std::{fs, net::Ipv4Addr, path::Path};

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpRule {
    pub first: Ipv4Addr,
    pub last: Ipv4Addr,
    pub blocked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpFilter {
    rules: Vec<IpRule>,
}

impl IpFilter {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read ip filter {}", path.display()))?;
        Ok(Self::parse(&contents))
    }

    /// Parses `a.b.c.d - e.f.g.h access` lines. Access levels up to 127 block
    /// the range. Parsing stops at the first malformed line.
    pub fn parse(contents: &str) -> Self {
        let mut rules = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match parse_rule(line) {
                Some(rule) => rules.push(rule),
                None => break,
            }
        }
        Self { rules }
    }

    pub fn rules(&self) -> &[IpRule] {
        &self.rules
    }

    pub fn blocked_ranges(&self) -> usize {
        self.rules.iter().filter(|rule| rule.blocked).count()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn parse_rule(line: &str) -> Option<IpRule> {
    let (range, access) = line.rsplit_once(char::is_whitespace)?;
    let (first, last) = range.split_once('-')?;
    let first: Ipv4Addr = first.trim().parse().ok()?;
    let last: Ipv4Addr = last.trim().parse().ok()?;
    let access: u32 = access.trim().parse().ok()?;
    Some(IpRule {
        first,
        last,
        blocked: access <= 127,
    })
}
