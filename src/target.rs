use anyhow::{bail, Result};
use serde::Serialize;

use crate::types::Prim;

/// The two supported targets. Each carries the manifest of primitive
/// sizes and alignment rules that both the parser (struct layout,
/// `sizeof`) and the matching backend consult, so the two phases
/// always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, clap::ValueEnum)]
pub enum Target {
    /// 64-bit machine reached through an SSA-temporary IL.
    #[default]
    Qbe,
    /// 6809-class 8/16-bit machine, native assembly.
    #[value(name = "6809")]
    M6809,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Qbe => write!(f, "qbe"),
            Target::M6809 => write!(f, "6809"),
        }
    }
}

impl Target {
    /// Size in bytes of a scalar of the given type on this target.
    pub fn prim_size(self, prim: Prim) -> Result<i64> {
        if prim.is_ptr() {
            return Ok(match self {
                Target::Qbe => 8,
                Target::M6809 => 2,
            });
        }
        Ok(match (self, prim) {
            (_, Prim::VOID) => 0,
            (_, Prim::CHAR) => 1,
            (Target::Qbe, Prim::INT) => 4,
            (Target::Qbe, Prim::LONG) => 8,
            (Target::M6809, Prim::INT) => 2,
            (Target::M6809, Prim::LONG) => 4,
            _ => bail!("Bad type {prim:?} in prim_size"),
        })
    }

    /// Given a type and a memory offset not yet allocated to anything,
    /// return a suitably aligned offset for the type. `direction` is
    /// 1 when allocating upwards and -1 downwards.
    pub fn align(self, prim: Prim, offset: i64, direction: i64) -> i64 {
        match self {
            // The 6809 has no alignment constraints.
            Target::M6809 => offset,
            Target::Qbe => {
                if prim == Prim::CHAR {
                    offset
                } else {
                    let alignment = 4;
                    (offset + direction * (alignment - 1)) & !(alignment - 1)
                }
            }
        }
    }

    /// The integer type wide enough to hold an address, used when an
    /// integer is scaled into a pointer offset.
    pub fn addr_int(self) -> Prim {
        match self {
            Target::Qbe => Prim::LONG,
            Target::M6809 => Prim::INT,
        }
    }
}
