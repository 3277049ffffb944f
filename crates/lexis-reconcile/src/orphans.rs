use std::collections::HashSet;

use lexis_core::{Section, Token};
use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrphanScan {
    pub null_section: Vec<String>,
    pub missing_section: Vec<String>,
}

impl OrphanScan {
    pub fn total(&self) -> usize {
        self.null_section.len() + self.missing_section.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.null_section
            .iter()
            .chain(&self.missing_section)
            .cloned()
            .collect()
    }
}

pub fn find_orphans(sections: &[Section], tokens: &[Token]) -> OrphanScan {
    let known = sections.iter().map(|s| s.id.as_str()).collect::<HashSet<_>>();
    let mut scan = OrphanScan::default();
    for token in tokens {
        match token.section_id.as_deref() {
            None => scan.null_section.push(token.id.clone()),
            Some(section_id) if !known.contains(section_id) => {
                scan.missing_section.push(token.id.clone())
            }
            Some(_) => {}
        }
    }
    scan
}
