use std::fmt;

use tokio_modbus::Address;

use crate::config::RegisterValue;

pub(crate) type Coil = bool;
pub(crate) type Word = u16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    Holding,
    Input,
    Coil,
    Discrete,
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TableKind::Holding => "holding",
            TableKind::Input => "input",
            TableKind::Coil => "coil",
            TableKind::Discrete => "discrete",
        })
    }
}

/// A validated initial value for one table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedEntry {
    Holding { addr: Address, value: Word },
    Input { addr: Address, value: Word },
    Coil { addr: Address, value: Coil },
    Discrete { addr: Address, value: Coil },
}

impl SeedEntry {
    pub fn addr(&self) -> Address {
        match *self {
            SeedEntry::Holding { addr, .. }
            | SeedEntry::Input { addr, .. }
            | SeedEntry::Coil { addr, .. }
            | SeedEntry::Discrete { addr, .. } => addr,
        }
    }

    pub fn kind(&self) -> TableKind {
        match self {
            SeedEntry::Holding { .. } => TableKind::Holding,
            SeedEntry::Input { .. } => TableKind::Input,
            SeedEntry::Coil { .. } => TableKind::Coil,
            SeedEntry::Discrete { .. } => TableKind::Discrete,
        }
    }
}

impl TryFrom<&RegisterValue> for SeedEntry {
    /// The unrecognised table name.
    type Error = String;

    fn try_from(raw: &RegisterValue) -> Result<Self, Self::Error> {
        let addr = raw.address;
        let bit = raw.value != 0;
        match raw.kind.as_str() {
            "holding" => Ok(SeedEntry::Holding {
                addr,
                value: raw.value,
            }),
            "input" => Ok(SeedEntry::Input {
                addr,
                value: raw.value,
            }),
            "coil" => Ok(SeedEntry::Coil { addr, value: bit }),
            "discrete" => Ok(SeedEntry::Discrete { addr, value: bit }),
            other => Err(other.to_string()),
        }
    }
}

/// The four data tables plus the live counter. All tables share one length
/// which is fixed at construction.
#[derive(Debug)]
pub(crate) struct Tables {
    pub holding: Vec<Word>,
    pub input: Vec<Word>,
    pub coils: Vec<Coil>,
    pub discrete: Vec<Coil>,
    pub counter: Word,
}

impl Tables {
    pub fn new(len: usize) -> Self {
        Self {
            holding: vec![0; len],
            input: vec![0; len],
            coils: vec![false; len],
            discrete: vec![false; len],
            counter: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.holding.len()
    }

    /// Applies a seed; returns false when the address is out of range.
    pub fn apply(&mut self, seed: SeedEntry) -> bool {
        let idx = usize::from(seed.addr());
        if idx >= self.len() {
            return false;
        }
        match seed {
            SeedEntry::Holding { value, .. } => self.holding[idx] = value,
            SeedEntry::Input { value, .. } => self.input[idx] = value,
            SeedEntry::Coil { value, .. } => self.coils[idx] = value,
            SeedEntry::Discrete { value, .. } => self.discrete[idx] = value,
        }
        true
    }
}
