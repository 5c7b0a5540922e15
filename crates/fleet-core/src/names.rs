//! VM name generation and public port allocation.

use std::collections::HashSet;
use std::ops::RangeInclusive;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

use crate::types::VmName;
use crate::{Error, Result};

const NAME_PREFIX: &str = "vm";
const NAME_RANDOM_LEN: usize = 12;

/// Length of every generated name.
pub const NAME_LEN: usize = NAME_PREFIX.len() + NAME_RANDOM_LEN;

/// Public ports handed to non-load-balanced NAT mappings.
pub const PUBLIC_PORT_RANGE: RangeInclusive<u16> = 4095..=65534;

/// Generate `count` distinct VM names.
///
/// Names are `vm` followed by 12 hex digits of a v4 UUID, so they are valid
/// inside host names, role names and blob paths. Uniqueness holds within one
/// call; a clash with an existing resource surfaces as a create failure.
pub fn generate_names(count: usize) -> Vec<VmName> {
    let mut seen = HashSet::with_capacity(count);
    let mut names = Vec::with_capacity(count);
    while names.len() < count {
        let id = Uuid::new_v4().simple().to_string();
        let candidate = format!("{NAME_PREFIX}{}", &id[..NAME_RANDOM_LEN]);
        if seen.insert(candidate.clone()) {
            names.push(VmName(candidate));
        }
    }
    names
}

/// Whether `name` has the shape [`generate_names`] produces.
pub fn is_valid_name(name: &str) -> bool {
    name.len() == NAME_LEN
        && name.starts_with(|c: char| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
}

/// Hands out distinct public ports for one plan.
pub struct PortAllocator {
    rng: StdRng,
    used: HashSet<u16>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_rng(&mut rand::rng()))
    }

    /// Reproducible allocator for tests.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            rng,
            used: HashSet::new(),
        }
    }

    /// Mark a port as taken, e.g. by a load-balanced mapping.
    pub fn reserve(&mut self, port: u16) {
        self.used.insert(port);
    }

    pub fn allocate(&mut self) -> Result<u16> {
        let capacity = PUBLIC_PORT_RANGE.len();
        let taken = self
            .used
            .iter()
            .filter(|p| PUBLIC_PORT_RANGE.contains(*p))
            .count();
        if taken >= capacity {
            return Err(Error::ConfigValidation(
                "no free public ports left for NAT mappings".into(),
            ));
        }
        loop {
            let port = self.rng.random_range(PUBLIC_PORT_RANGE);
            if self.used.insert(port) {
                return Ok(port);
            }
        }
    }
}
