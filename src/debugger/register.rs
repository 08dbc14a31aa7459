use crate::engine::{DebugEngine, EngineResult};
use crate::muted_error;

/// Registers surfaced to the IDE, in the order the engine enumerates them.
const CURATED: [&str; 11] = [
    "eax", "ebx", "ecx", "edx", "esi", "edi", "ebp", "esp", "cs", "ds", "ss",
];

/// EFLAGS bits decoded for the synthetic EFLAGS scope.
const FLAG_BITS: [(&str, u32); 6] = [
    ("CF", 0),
    ("ZF", 6),
    ("SF", 7),
    ("IF", 9),
    ("DF", 10),
    ("OF", 11),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagValue {
    pub name: &'static str,
    pub value: &'static str,
}

/// Enumerate engine registers and keep the curated x86 set, values rendered
/// as `0x<hex>`. Registers the engine refuses to describe or read are skipped.
pub fn read_registers(engine: &dyn DebugEngine) -> EngineResult<Vec<RegisterValue>> {
    let count = engine.registers_count()?;

    let mut registers = Vec::with_capacity(CURATED.len());
    for index in 0..count {
        let Some(name) = muted_error!(engine.register_description(index)) else {
            continue;
        };
        if !CURATED.contains(&name.as_str()) {
            continue;
        }
        let Some(value) = muted_error!(engine.register_value(index)) else {
            continue;
        };
        registers.push(RegisterValue {
            name,
            value: value.format_hex(),
        });
    }

    Ok(registers)
}

/// Evaluate the `efl` pseudo-register and decode the status bits.
pub fn read_eflags(engine: &dyn DebugEngine) -> EngineResult<Vec<FlagValue>> {
    let eflags = engine.evaluate("efl", None)?.as_u64();
    Ok(decode_eflags(eflags))
}

fn decode_eflags(eflags: u64) -> Vec<FlagValue> {
    FLAG_BITS
        .iter()
        .map(|&(name, bit)| FlagValue {
            name,
            value: if (eflags >> bit) & 1 == 1 { "1" } else { "0" },
        })
        .collect()
}
