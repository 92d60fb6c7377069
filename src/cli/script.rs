//! Mutation scripts replayed by `attrindex replay`
//!
//! ```json
//! {
//!   "container": 1,
//!   "transaction": "commit",
//!   "attributes": [{ "name": "order", "type": "int" }],
//!   "operations": [
//!     { "op": "insert_chain", "attribute": "order", "predecessor": null, "record": 1 },
//!     { "op": "insert_sort", "attribute": "order", "value": { "int": 10 }, "record": 1 }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use super::errors::{CliError, CliResult};
use super::io::read_text;
use crate::index::{
    AttributeIndexWriter, AttributeSchema, AttributeValue, ComparatorSource, CompoundSchema,
    IndexError, IndexResult, Predecessor, RecordId, Value, ValueType,
};

/// How the operations of a script are applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// Write the committed index directly
    #[default]
    None,
    /// Write through a transaction and commit it
    Commit,
    /// Write through a transaction and roll it back
    Rollback,
}

/// Declared plain attribute
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub localized: bool,
}

/// Declared compound sort attribute
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompoundDecl {
    pub name: String,
    pub sources: Vec<ComparatorSource>,
    #[serde(default)]
    pub localized: bool,
}

/// Single mutation of an attribute index
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    InsertUnique {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        value: AttributeValue,
        record: RecordId,
    },
    RemoveUnique {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        value: AttributeValue,
        record: RecordId,
    },
    InsertFilter {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        value: AttributeValue,
        record: RecordId,
    },
    RemoveFilter {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        value: AttributeValue,
        record: RecordId,
    },
    AddFilterDelta {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        values: Vec<Value>,
        record: RecordId,
    },
    RemoveFilterDelta {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        values: Vec<Value>,
        record: RecordId,
    },
    InsertSort {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        value: Value,
        record: RecordId,
    },
    RemoveSort {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        value: Value,
        record: RecordId,
    },
    InsertCompoundSort {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        values: Vec<Option<Value>>,
        record: RecordId,
    },
    RemoveCompoundSort {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        values: Vec<Option<Value>>,
        record: RecordId,
    },
    /// `predecessor: null` makes the record a chain head
    InsertChain {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        predecessor: Option<RecordId>,
        record: RecordId,
    },
    RemoveChain {
        attribute: String,
        #[serde(default)]
        locale: Option<String>,
        record: RecordId,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::InsertUnique { .. } => "insert_unique",
            Operation::RemoveUnique { .. } => "remove_unique",
            Operation::InsertFilter { .. } => "insert_filter",
            Operation::RemoveFilter { .. } => "remove_filter",
            Operation::AddFilterDelta { .. } => "add_filter_delta",
            Operation::RemoveFilterDelta { .. } => "remove_filter_delta",
            Operation::InsertSort { .. } => "insert_sort",
            Operation::RemoveSort { .. } => "remove_sort",
            Operation::InsertCompoundSort { .. } => "insert_compound_sort",
            Operation::RemoveCompoundSort { .. } => "remove_compound_sort",
            Operation::InsertChain { .. } => "insert_chain",
            Operation::RemoveChain { .. } => "remove_chain",
        }
    }

    /// Attribute the operation targets
    pub fn attribute(&self) -> &str {
        match self {
            Operation::InsertUnique { attribute, .. }
            | Operation::RemoveUnique { attribute, .. }
            | Operation::InsertFilter { attribute, .. }
            | Operation::RemoveFilter { attribute, .. }
            | Operation::AddFilterDelta { attribute, .. }
            | Operation::RemoveFilterDelta { attribute, .. }
            | Operation::InsertSort { attribute, .. }
            | Operation::RemoveSort { attribute, .. }
            | Operation::InsertCompoundSort { attribute, .. }
            | Operation::RemoveCompoundSort { attribute, .. }
            | Operation::InsertChain { attribute, .. }
            | Operation::RemoveChain { attribute, .. } => attribute,
        }
    }

    fn is_compound(&self) -> bool {
        matches!(
            self,
            Operation::InsertCompoundSort { .. } | Operation::RemoveCompoundSort { .. }
        )
    }
}

/// Parsed and validated mutation script
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    /// Container key stamped on exported storage parts
    #[serde(default)]
    pub container: u32,
    #[serde(default)]
    pub transaction: TransactionMode,
    #[serde(default)]
    pub attributes: Vec<AttributeDecl>,
    #[serde(default)]
    pub compounds: Vec<CompoundDecl>,
    pub operations: Vec<Operation>,
}

impl Script {
    /// Load a script from a JSON file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = read_text(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a script
    pub fn parse(content: &str) -> CliResult<Self> {
        let script: Script = serde_json::from_str(content)
            .map_err(|e| CliError::script_error(format!("Invalid script JSON: {}", e)))?;
        script.validate()?;
        Ok(script)
    }

    fn validate(&self) -> CliResult<()> {
        let mut names = HashSet::new();
        let declared = self
            .attributes
            .iter()
            .map(|a| &a.name)
            .chain(self.compounds.iter().map(|c| &c.name));
        for name in declared {
            if !names.insert(name.as_str()) {
                return Err(CliError::script_error(format!(
                    "Attribute `{}` is declared twice",
                    name
                )));
            }
        }

        for (i, op) in self.operations.iter().enumerate() {
            let known = if op.is_compound() {
                self.compound(op.attribute()).is_some()
            } else {
                self.attribute(op.attribute()).is_some()
            };
            if !known {
                return Err(CliError::script_error(format!(
                    "Operation {} ({}) targets undeclared attribute `{}`",
                    i,
                    op.name(),
                    op.attribute()
                )));
            }
        }
        Ok(())
    }

    fn attribute(&self, name: &str) -> Option<AttributeSchema> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .map(|a| AttributeSchema {
                name: a.name.clone(),
                value_type: a.value_type,
                localized: a.localized,
            })
    }

    fn compound(&self, name: &str) -> Option<CompoundSchema> {
        self.compounds
            .iter()
            .find(|c| c.name == name)
            .map(|c| CompoundSchema {
                name: c.name.clone(),
                sources: c.sources.clone(),
                localized: c.localized,
            })
    }

    /// Apply one operation through `writer`
    pub fn apply(&self, op: &Operation, writer: &mut AttributeIndexWriter<'_>) -> IndexResult<()> {
        let undeclared = || IndexError::invalid_usage(format!("Attribute `{}` is not declared!", op.attribute()));
        let schema = || self.attribute(op.attribute()).ok_or_else(undeclared);
        let compound = || self.compound(op.attribute()).ok_or_else(undeclared);
        match op {
            Operation::InsertUnique {
                locale,
                value,
                record,
                ..
            } => writer.insert_unique(&schema()?, locale.as_deref(), value, *record),
            Operation::RemoveUnique {
                locale,
                value,
                record,
                ..
            } => writer.remove_unique(&schema()?, locale.as_deref(), value, *record),
            Operation::InsertFilter {
                locale,
                value,
                record,
                ..
            } => writer.insert_filter(&schema()?, locale.as_deref(), value, *record),
            Operation::RemoveFilter {
                locale,
                value,
                record,
                ..
            } => writer.remove_filter(&schema()?, locale.as_deref(), value, *record),
            Operation::AddFilterDelta {
                locale,
                values,
                record,
                ..
            } => writer.add_filter_delta(&schema()?, locale.as_deref(), values, *record),
            Operation::RemoveFilterDelta {
                locale,
                values,
                record,
                ..
            } => writer.remove_filter_delta(&schema()?, locale.as_deref(), values, *record),
            Operation::InsertSort {
                locale,
                value,
                record,
                ..
            } => writer.insert_sort(&schema()?, locale.as_deref(), value, *record),
            Operation::RemoveSort {
                locale,
                value,
                record,
                ..
            } => writer.remove_sort(&schema()?, locale.as_deref(), value, *record),
            Operation::InsertCompoundSort {
                locale,
                values,
                record,
                ..
            } => writer.insert_compound_sort(&compound()?, locale.as_deref(), values, *record),
            Operation::RemoveCompoundSort {
                locale,
                values,
                record,
                ..
            } => writer.remove_compound_sort(&compound()?, locale.as_deref(), values, *record),
            Operation::InsertChain {
                locale,
                predecessor,
                record,
                ..
            } => {
                let predecessor = predecessor.map_or(Predecessor::Head, Predecessor::Of);
                writer.insert_chain(&schema()?, locale.as_deref(), predecessor, *record)
            }
            Operation::RemoveChain { locale, record, .. } => {
                writer.remove_chain(&schema()?, locale.as_deref(), *record)
            }
        }
    }
}
