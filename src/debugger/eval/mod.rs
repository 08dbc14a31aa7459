//! Expression evaluation on top of the engine's MASM evaluator.
//!
//! Array expressions resolve the identifier to a base address, read the
//! requested slots from target memory and format each one. Everything the
//! mini-language does not recognize falls through to the engine, so plain
//! MASM arithmetic keeps working in the watch and repl contexts.

pub mod parser;

use itertools::Itertools;

use crate::engine::{DebugEngine, Scalar};
use parser::{EvalExpr, Format, ParseResult, Width};

pub const INVALID_EXPRESSION: &str = "<Invalid expression>";
pub const INVALID_BASE_ADDRESS: &str = "<Invalid base address>";
pub const FAILED_MEMORY_READ: &str = "<Failed to read memory>";
pub const VALUE_NOT_A_BYTE: &str = "<Value does not fit in a byte>";

/// Evaluate a watch/repl expression. Errors come back as bracketed
/// diagnostic strings; this function never fails.
pub fn evaluate_expression(engine: &dyn DebugEngine, input: &str) -> String {
    match parser::parse(input) {
        ParseResult::Parsed(expr) => evaluate_parsed(engine, &expr),
        ParseResult::Malformed(err) => err.diagnostic().to_string(),
        ParseResult::Foreign => match engine.evaluate(input.trim(), None) {
            Ok(value) => format_scalar(value, Format::Hex),
            Err(_) => INVALID_EXPRESSION.to_string(),
        },
    }
}

/// Hover lookup. A resolvable symbol reads as `Address: …, Value: …`; a
/// register name reads as its value; anything else yields an empty string,
/// which the protocol layer turns into "no hover".
pub fn evaluate_variable(engine: &dyn DebugEngine, name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        return String::new();
    }

    if let Ok(ty) = engine.symbol_type(name) {
        let Ok(address) = engine.evaluate(name, None) else {
            return String::new();
        };
        let address = address.as_u64();
        let size = (ty.size as usize).clamp(1, 8);
        let Ok(bytes) = engine.read_virtual(address, size) else {
            return String::new();
        };
        let value = le_bytes(&bytes);
        return format!(
            "Address: 0x{address:08x}, Value: 0x{value:0width$x}",
            width = size * 2
        );
    }

    if let Some(value) = register_by_name(engine, name) {
        return value.format_hex();
    }

    String::new()
}

fn evaluate_parsed(engine: &dyn DebugEngine, expr: &EvalExpr) -> String {
    match expr {
        EvalExpr::Array {
            width,
            base,
            count,
            format,
        } => {
            let Ok(base_addr) = engine.evaluate(base, None) else {
                return INVALID_BASE_ADDRESS.to_string();
            };

            if *count == Some(0) {
                return "{ }".to_string();
            }
            let elements = count.unwrap_or(1) as usize;
            let len = elements * width.element_size();

            let bytes = match engine.read_virtual(base_addr.as_u64(), len) {
                Ok(bytes) if bytes.len() >= len => bytes,
                _ => return FAILED_MEMORY_READ.to_string(),
            };

            let mut slots = bytes
                .chunks_exact(width.element_size())
                .take(elements)
                .map(|chunk| format_element(le_bytes(chunk), *width, *format));

            match count {
                // a count of one (or none) reads as a scalar
                None | Some(1) => slots.next().unwrap_or_default(),
                _ => format!("{{ {} }}", slots.join(", ")),
            }
        }
        EvalExpr::Simple { expression, format } => {
            let Ok(value) = engine.evaluate(expression, None) else {
                return INVALID_EXPRESSION.to_string();
            };
            match format {
                None => format_scalar(value, Format::Hex),
                Some(Format::Char) => {
                    if value.as_u64() <= 0xff {
                        format_element(value.as_u64(), Width::Byte, Format::Char)
                    } else {
                        VALUE_NOT_A_BYTE.to_string()
                    }
                }
                Some(format) => format_scalar(value, *format),
            }
        }
    }
}

fn register_by_name(engine: &dyn DebugEngine, name: &str) -> Option<Scalar> {
    let count = engine.registers_count().ok()?;
    (0..count).find_map(|index| {
        let description = engine.register_description(index).ok()?;
        if description.eq_ignore_ascii_case(name) {
            engine.register_value(index).ok()
        } else {
            None
        }
    })
}

fn le_bytes(chunk: &[u8]) -> u64 {
    chunk
        .iter()
        .rev()
        .fold(0u64, |acc, byte| (acc << 8) | *byte as u64)
}

/// Render one array slot of the given width.
fn format_element(value: u64, width: Width, format: Format) -> String {
    match format {
        Format::Hex => match width {
            Width::Byte => format!("0x{value:02x}"),
            Width::Word => format!("0x{value:04x}"),
            Width::Dword => format!("0x{value:08x}"),
        },
        Format::Signed => match width {
            Width::Byte => format!("{}", value as u8 as i8),
            Width::Word => format!("{}", value as u16 as i16),
            Width::Dword => format!("{}", value as u32 as i32),
        },
        Format::Unsigned => format!("{value}"),
        Format::Binary => format_binary(value, width),
        Format::Char => {
            if (0x20..=0x7e).contains(&value) {
                format!("'{}'", value as u8 as char)
            } else {
                format!("0x{value:02x}")
            }
        }
    }
}

/// Render a scalar that came straight from the engine, using its own width.
fn format_scalar(value: Scalar, format: Format) -> String {
    match (value, format) {
        (_, Format::Hex) => value.format_hex(),
        (Scalar::U32(v), Format::Signed) => format!("{}", v as i32),
        (Scalar::U64(v), Format::Signed) => format!("{}", v as i64),
        (_, Format::Unsigned) => format!("{}", value.as_u64()),
        (Scalar::U32(v), Format::Binary) => format_binary(v as u64, Width::Dword),
        (Scalar::U64(v), Format::Binary) => {
            let high = format_binary(v >> 32, Width::Dword);
            let low = format_binary(v & 0xFFFF_FFFF, Width::Dword);
            format!("{high} {low}")
        }
        // char formatting is range-checked by the caller
        (_, Format::Char) => format_element(value.as_u64() & 0xff, Width::Byte, Format::Char),
    }
}

/// Binary rendering, grouped by nibbles for bytes and by bytes otherwise.
fn format_binary(value: u64, width: Width) -> String {
    match width {
        Width::Byte => {
            let bits = format!("{value:08b}");
            format!("{} {}", &bits[..4], &bits[4..])
        }
        Width::Word => {
            let bits = format!("{value:016b}");
            format!("{} {}", &bits[..8], &bits[8..])
        }
        Width::Dword => {
            let bits = format!("{value:032b}");
            format!("{} {} {} {}", &bits[..8], &bits[8..16], &bits[16..24], &bits[24..])
        }
    }
}
