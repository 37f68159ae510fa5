//! Static DDE parameter database
//!
//! Maps the stable, human-visible DDE numbers onto `(proc_nr, parm_nr, type)`
//! triples. The table is read-only and shared by every facade in the process.

use std::collections::HashMap;
use std::sync::OnceLock;

use super::types::{Parameter, ParameterType};
use crate::error::{FlowSrvError, Result};

/// Commonly used DDE numbers.
pub mod dde {
    pub const MEASURE: u16 = 8;
    pub const SETPOINT: u16 = 9;
    pub const CAPACITY: u16 = 21;
    pub const WINK: u16 = 23;
    pub const FLUID_INDEX: u16 = 24;
    pub const FLUID_NAME: u16 = 25;
    pub const DEVICE_TYPE: u16 = 90;
    pub const MODEL_NUMBER: u16 = 91;
    pub const SERIAL_NUMBER: u16 = 92;
    pub const USER_TAG: u16 = 115;
    pub const CAPACITY_UNIT: u16 = 129;
    pub const IDENT_NUMBER: u16 = 175;
    pub const FMEASURE: u16 = 205;
    pub const FSETPOINT: u16 = 206;
}

/// One database entry.
#[derive(Debug, Clone, Copy)]
pub struct ParameterSpec {
    pub dde_nr: u16,
    pub name: &'static str,
    pub proc_nr: u8,
    pub parm_nr: u8,
    pub parm_type: ParameterType,
}

impl ParameterSpec {
    /// Descriptor for this entry, node unset.
    pub fn descriptor(&self) -> Parameter {
        Parameter::new(self.proc_nr, self.parm_nr, self.parm_type)
    }
}

/// Read-only DDE lookup table.
#[derive(Debug)]
pub struct ParameterDb {
    entries: HashMap<u16, ParameterSpec>,
}

impl ParameterDb {
    fn build() -> Self {
        use ParameterType::*;

        const ENTRIES: &[(u16, &str, u8, u8, ParameterType)] = &[
            (dde::MEASURE, "measure", 1, 0, Int16),
            (dde::SETPOINT, "setpoint", 1, 1, Int16),
            (dde::CAPACITY, "capacity 100%", 1, 13, Float),
            (dde::WINK, "wink", 0, 0, Int8),
            (dde::FLUID_INDEX, "fluidset index", 1, 16, Int8),
            (dde::FLUID_NAME, "fluidset name", 1, 17, String),
            (dde::DEVICE_TYPE, "device type", 113, 1, String),
            (dde::MODEL_NUMBER, "model number", 113, 2, String),
            (dde::SERIAL_NUMBER, "serial number", 113, 3, String),
            (dde::USER_TAG, "user tag", 113, 6, String),
            (dde::CAPACITY_UNIT, "capacity unit", 1, 31, String),
            (dde::IDENT_NUMBER, "identification number", 113, 12, Int8),
            (dde::FMEASURE, "fmeasure", 33, 0, Float),
            (dde::FSETPOINT, "fsetpoint", 33, 3, Float),
        ];

        let entries = ENTRIES
            .iter()
            .map(|&(dde_nr, name, proc_nr, parm_nr, parm_type)| {
                (
                    dde_nr,
                    ParameterSpec {
                        dde_nr,
                        name,
                        proc_nr,
                        parm_nr,
                        parm_type,
                    },
                )
            })
            .collect();

        Self { entries }
    }

    /// Process-wide shared instance.
    pub fn global() -> &'static ParameterDb {
        static DB: OnceLock<ParameterDb> = OnceLock::new();
        DB.get_or_init(ParameterDb::build)
    }

    /// Look up one DDE number.
    pub fn get(&self, dde_nr: u16) -> Result<&ParameterSpec> {
        self.entries
            .get(&dde_nr)
            .ok_or(FlowSrvError::UnknownParameter(dde_nr))
    }

    /// Descriptors for a list of DDE numbers, in order.
    pub fn descriptors(&self, dde_nrs: &[u16]) -> Result<Vec<Parameter>> {
        dde_nrs
            .iter()
            .map(|&dde| Ok(self.get(dde)?.descriptor()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
