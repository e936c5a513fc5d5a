//! Static source map for one debug session.
//!
//! Compiled once from the program binary by the surrounding toolchain
//! layer, then consulted read-only by the session: function, global and
//! import tables plus the line-to-address correlation. Lookups return
//! `Option` instead of failing; nothing here mutates after construction.

use serde_json::Value;
use smol_str::SmolStr;

use crate::error::ProtocolError;

/// One local variable of a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalInfo {
    pub name: SmolStr,
    pub type_name: SmolStr,
}

/// One entry of the function table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub fidx: u32,
    pub name: SmolStr,
    pub type_name: SmolStr,
    pub locals: Vec<LocalInfo>,
}

/// One entry of the global table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalInfo {
    pub index: u32,
    pub name: SmolStr,
    pub type_name: SmolStr,
}

/// One imported function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportInfo {
    pub module: SmolStr,
    pub name: SmolStr,
    pub fidx: u32,
}

/// Correlation between a source line and a code address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineMapping {
    pub line: u32,
    pub address: u32,
}

/// Read-only lookup tables for one compiled program.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    functions: Vec<FunctionInfo>,
    globals: Vec<GlobalInfo>,
    imports: Vec<ImportInfo>,
    /// Sorted by address ascending.
    lines: Vec<LineMapping>,
}

impl SourceMap {
    #[must_use]
    pub fn new(
        functions: Vec<FunctionInfo>,
        globals: Vec<GlobalInfo>,
        imports: Vec<ImportInfo>,
        mut lines: Vec<LineMapping>,
    ) -> Self {
        lines.sort_by_key(|mapping| mapping.address);
        Self {
            functions,
            globals,
            imports,
            lines,
        }
    }

    /// Load a source map from the compiler's JSON description.
    ///
    /// Every table is optional; a missing table is an empty one. Entries
    /// with missing fields fail the whole load rather than being dropped.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let doc: Value = serde_json::from_str(text)
            .map_err(|err| ProtocolError::MalformedSourceMap(SmolStr::new(err.to_string())))?;

        let mut functions = Vec::new();
        for entry in array(&doc, "functions") {
            functions.push(FunctionInfo {
                fidx: index(entry, "fidx")?,
                name: string(entry, "name")?,
                type_name: string(entry, "type")?,
                locals: array(entry, "locals")
                    .iter()
                    .map(|local| {
                        Ok(LocalInfo {
                            name: string(local, "name")?,
                            type_name: string(local, "type")?,
                        })
                    })
                    .collect::<Result<_, ProtocolError>>()?,
            });
        }
        let mut globals = Vec::new();
        for entry in array(&doc, "globals") {
            globals.push(GlobalInfo {
                index: index(entry, "index")?,
                name: string(entry, "name")?,
                type_name: string(entry, "type")?,
            });
        }
        let mut imports = Vec::new();
        for entry in array(&doc, "imports") {
            imports.push(ImportInfo {
                module: string(entry, "module")?,
                name: string(entry, "name")?,
                fidx: index(entry, "fidx")?,
            });
        }
        let mut lines = Vec::new();
        for entry in array(&doc, "lines") {
            lines.push(LineMapping {
                line: index(entry, "line")?,
                address: index(entry, "address")?,
            });
        }
        Ok(Self::new(functions, globals, imports, lines))
    }

    #[must_use]
    pub fn function(&self, fidx: u32) -> Option<&FunctionInfo> {
        self.functions.iter().find(|info| info.fidx == fidx)
    }

    #[must_use]
    pub fn global(&self, index: u32) -> Option<&GlobalInfo> {
        self.globals.iter().find(|info| info.index == index)
    }

    #[must_use]
    pub fn imports(&self) -> &[ImportInfo] {
        &self.imports
    }

    #[must_use]
    pub fn functions(&self) -> &[FunctionInfo] {
        &self.functions
    }

    /// The code address a breakpoint on `line` should land on: the first
    /// mapped address at or after that line.
    #[must_use]
    pub fn address_for_line(&self, line: u32) -> Option<u32> {
        self.lines
            .iter()
            .filter(|mapping| mapping.line >= line)
            .min_by_key(|mapping| (mapping.line, mapping.address))
            .map(|mapping| mapping.address)
    }

    /// The source line covering `addr`: the nearest mapping at or below it.
    #[must_use]
    pub fn line_for_address(&self, addr: u32) -> Option<u32> {
        match self.lines.partition_point(|mapping| mapping.address <= addr) {
            0 => None,
            n => Some(self.lines[n - 1].line),
        }
    }
}

fn array<'a>(value: &'a Value, key: &str) -> &'a [Value] {
    value
        .get(key)
        .and_then(Value::as_array)
        .map_or(&[], Vec::as_slice)
}

fn index(value: &Value, key: &str) -> Result<u32, ProtocolError> {
    value
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or_else(|| {
            ProtocolError::MalformedSourceMap(SmolStr::new(format!("missing field '{key}'")))
        })
}

fn string(value: &Value, key: &str) -> Result<SmolStr, ProtocolError> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(SmolStr::new)
        .ok_or_else(|| {
            ProtocolError::MalformedSourceMap(SmolStr::new(format!("missing field '{key}'")))
        })
}
