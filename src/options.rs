//! Analysis configuration.
//!
//! Two options structs cover the two analysis families. Both derive serde
//! so hosts can keep them in configuration files; [`DataDependenceOptions`]
//! (including the function-model table) is loadable from TOML.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::diagnostics::{AnalysisError, AnalysisResult};
use crate::malformed;
use crate::offset::Offset;

/// Options for the pointer analysis solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PointerAnalysisOptions {
    /// Cap at which concrete offsets collapse to unknown. Default: uncapped.
    pub max_offset: Offset,
    /// Compute a distinct memory map per program point.
    pub flow_sensitive: bool,
    /// Enable the FREE / INVALIDATE_* transfer functions.
    /// Implies `flow_sensitive`.
    pub track_invalidations: bool,
}

impl Default for PointerAnalysisOptions {
    fn default() -> PointerAnalysisOptions {
        PointerAnalysisOptions {
            max_offset: Offset::UNKNOWN,
            flow_sensitive: false,
            track_invalidations: false,
        }
    }
}

impl PointerAnalysisOptions {
    pub fn with_max_offset(mut self, max_offset: Offset) -> Self {
        self.max_offset = max_offset;
        self
    }

    pub fn with_flow_sensitive(mut self, b: bool) -> Self {
        self.flow_sensitive = b;
        self
    }

    pub fn with_track_invalidations(mut self, b: bool) -> Self {
        self.track_invalidations = b;
        if b {
            self.flow_sensitive = true;
        }
        self
    }

    /// Invalidation tracking needs per-program-point memory maps.
    pub fn is_flow_sensitive(&self) -> bool {
        self.flow_sensitive || self.track_invalidations
    }
}

/// Which data-dependence engine to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataDependenceEngine {
    /// Dense reaching-definitions dataflow (reference engine).
    Rd,
    /// Semi-sparse memory SSA with on-demand phi insertion.
    Ssa,
}

/// Options for reaching definitions and memory SSA.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataDependenceOptions {
    pub engine: DataDependenceEngine,
    /// Permit strong updates through unknown memory. Unsound when true.
    pub strong_update_unknown: bool,
    /// Assume calls to declared functions have no side effects.
    pub undefined_are_pure: bool,
    /// Cap on the per-node reaching-definitions set; must be at least 1.
    /// When exceeded, the set collapses to the unknown-memory sentinel.
    pub max_set_size: Offset,
    /// Collapse all offsets of any allocation to unknown.
    pub field_insensitive: bool,
    /// Models for declared functions without a body, by name.
    pub function_models: BTreeMap<String, FunctionModel>,
    pub entry_function: String,
}

impl Default for DataDependenceOptions {
    fn default() -> DataDependenceOptions {
        DataDependenceOptions {
            engine: DataDependenceEngine::Ssa,
            strong_update_unknown: false,
            undefined_are_pure: false,
            max_set_size: Offset::UNKNOWN,
            field_insensitive: false,
            function_models: BTreeMap::new(),
            entry_function: "main".to_string(),
        }
    }
}

impl DataDependenceOptions {
    pub fn with_engine(mut self, engine: DataDependenceEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_strong_update_unknown(mut self, b: bool) -> Self {
        self.strong_update_unknown = b;
        self
    }

    pub fn with_undefined_are_pure(mut self, b: bool) -> Self {
        self.undefined_are_pure = b;
        self
    }

    pub fn with_max_set_size(mut self, size: Offset) -> Self {
        self.max_set_size = size;
        self
    }

    pub fn with_field_insensitive(mut self, b: bool) -> Self {
        self.field_insensitive = b;
        self
    }

    pub fn with_entry_function(mut self, name: impl Into<String>) -> Self {
        self.entry_function = name.into();
        self
    }

    pub fn add_function_model(mut self, name: impl Into<String>, model: FunctionModel) -> Self {
        self.function_models.insert(name.into(), model);
        self
    }

    pub fn model(&self, name: &str) -> Option<&FunctionModel> {
        self.function_models.get(name)
    }

    /// Load options from a TOML document.
    pub fn from_toml_str(input: &str) -> AnalysisResult<DataDependenceOptions> {
        let opts: DataDependenceOptions = toml::from_str(input)
            .map_err(|e| AnalysisError::malformed(format!("options: {e}")))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> AnalysisResult<()> {
        if self.max_set_size == Offset::ZERO {
            malformed!("max_set_size must be at least 1");
        }
        Ok(())
    }
}

/// One side of a modelled byte range: a literal offset, or the constant
/// value of the call's i-th operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperandValue {
    Offset(Offset),
    Operand(usize),
}

/// A byte range `[from, to)` of the memory reachable through one positional
/// pointer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRange {
    /// Index of the pointer argument the range applies to.
    pub operand: usize,
    pub from: OperandValue,
    pub to: OperandValue,
}

/// Externally specified memory effects of a declared function.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionModel {
    pub defines: Vec<ModelRange>,
    pub uses: Vec<ModelRange>,
}

impl FunctionModel {
    pub fn with_def(mut self, operand: usize, from: OperandValue, to: OperandValue) -> Self {
        self.defines.push(ModelRange { operand, from, to });
        self
    }

    pub fn with_use(mut self, operand: usize, from: OperandValue, to: OperandValue) -> Self {
        self.uses.push(ModelRange { operand, from, to });
        self
    }

    pub fn defines_operand(&self, operand: usize) -> Option<&ModelRange> {
        self.defines.iter().find(|r| r.operand == operand)
    }

    pub fn uses_operand(&self, operand: usize) -> Option<&ModelRange> {
        self.uses.iter().find(|r| r.operand == operand)
    }

    pub fn handles(&self, operand: usize) -> bool {
        self.defines_operand(operand).is_some() || self.uses_operand(operand).is_some()
    }

    /// Models for the handful of libc routines the analyses meet most often.
    pub fn builtin_models() -> BTreeMap<String, FunctionModel> {
        use OperandValue::{Offset as Lit, Operand as Op};

        let mut models = BTreeMap::new();
        // memcpy(dst, src, n) / memmove(dst, src, n)
        let copy = FunctionModel::default()
            .with_def(0, Lit(Offset::ZERO), Op(2))
            .with_use(1, Lit(Offset::ZERO), Op(2));
        models.insert("memcpy".to_string(), copy.clone());
        models.insert("memmove".to_string(), copy);
        // memset(s, c, n)
        models.insert(
            "memset".to_string(),
            FunctionModel::default().with_def(0, Lit(Offset::ZERO), Op(2)),
        );
        // strcpy(dst, src): lengths are data-dependent
        models.insert(
            "strcpy".to_string(),
            FunctionModel::default()
                .with_def(0, Lit(Offset::ZERO), Lit(Offset::UNKNOWN))
                .with_use(1, Lit(Offset::ZERO), Lit(Offset::UNKNOWN)),
        );
        models
    }
}
