use hashbrown::HashMap;
use rustc_hash::FxBuildHasher;

use crate::schema::Affinity;

/// Handle to a registered function definition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FuncId(u32);

impl FuncId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncKind {
    Scalar,
    Aggregate,
}

/// How a function's result affinity is derived.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultAffinity {
    Fixed(Affinity),
    /// Numeric if any argument is numeric, else text.
    FromArgs,
    /// Affinity of the indexed argument; numeric when the call has fewer
    /// arguments than that.
    Arg(usize),
}

#[derive(Clone, Debug)]
pub struct FuncDef {
    pub name: Box<str>,
    /// Expected argument count; `-1` accepts any number.
    pub n_arg: i32,
    pub kind: FuncKind,
    pub result: ResultAffinity,
    /// True if the emitter should push each argument's affinity name after
    /// its value.
    pub include_types: bool,
}

impl FuncDef {
    pub fn scalar(name: &str, n_arg: i32, result: ResultAffinity) -> Self {
        Self { name: name.into(), n_arg, kind: FuncKind::Scalar, result, include_types: false }
    }

    pub fn aggregate(name: &str, n_arg: i32, result: ResultAffinity) -> Self {
        Self { name: name.into(), n_arg, kind: FuncKind::Aggregate, result, include_types: false }
    }

    pub fn with_types(mut self) -> Self {
        self.include_types = true;
        self
    }

    pub fn is_aggregate(&self) -> bool {
        self.kind == FuncKind::Aggregate
    }
}

/// Registry of SQL functions, looked up by lowercase name and arity.
///
/// Several definitions may share a name (e.g. scalar `max(...)` and the
/// aggregate `max(x)`); lookup prefers an exact arity match and falls back
/// to a variadic definition.
pub struct FuncRegistry {
    defs: Vec<FuncDef>,
    by_name: HashMap<Box<str>, Vec<u32>, FxBuildHasher>,
}

impl FuncRegistry {
    pub fn new() -> Self {
        Self { defs: Vec::new(), by_name: HashMap::default() }
    }

    /// Registry preloaded with the builtin SQL functions.
    pub fn with_builtins() -> Self {
        use Affinity::{Numeric, Text};
        use ResultAffinity::{Arg, Fixed, FromArgs};

        let mut reg = Self::new();
        reg.register(FuncDef::scalar("min", -1, FromArgs).with_types());
        reg.register(FuncDef::scalar("max", -1, FromArgs).with_types());
        reg.register(FuncDef::scalar("length", 1, Fixed(Numeric)));
        reg.register(FuncDef::scalar("substr", 3, Fixed(Text)));
        reg.register(FuncDef::scalar("abs", 1, Fixed(Numeric)));
        reg.register(FuncDef::scalar("round", 1, Fixed(Numeric)));
        reg.register(FuncDef::scalar("round", 2, Fixed(Numeric)));
        reg.register(FuncDef::scalar("upper", 1, Fixed(Text)));
        reg.register(FuncDef::scalar("lower", 1, Fixed(Text)));
        reg.register(FuncDef::scalar("coalesce", -1, FromArgs));
        reg.register(FuncDef::scalar("ifnull", 2, FromArgs));
        reg.register(FuncDef::scalar("nullif", 2, Arg(0)));
        reg.register(FuncDef::scalar("typeof", 1, Fixed(Text)));
        reg.register(FuncDef::scalar("like", 2, Fixed(Numeric)));
        reg.register(FuncDef::scalar("glob", 2, Fixed(Numeric)));
        reg.register(FuncDef::aggregate("count", 0, Fixed(Numeric)));
        reg.register(FuncDef::aggregate("count", 1, Fixed(Numeric)));
        reg.register(FuncDef::aggregate("sum", 1, Fixed(Numeric)));
        reg.register(FuncDef::aggregate("avg", 1, Fixed(Numeric)));
        reg.register(FuncDef::aggregate("min", 1, Arg(0)));
        reg.register(FuncDef::aggregate("max", 1, Arg(0)));
        reg
    }

    pub fn register(&mut self, def: FuncDef) -> FuncId {
        let id = self.defs.len() as u32;
        let key = def.name.to_ascii_lowercase().into_boxed_str();
        self.defs.push(def);
        self.by_name.entry(key).or_default().push(id);
        FuncId(id)
    }

    #[inline]
    pub fn def(&self, id: FuncId) -> &FuncDef {
        &self.defs[id.index()]
    }

    /// Find a definition for `name` called with `n_arg` arguments: an exact
    /// arity match wins, else a variadic definition matches any call.
    pub fn find(&self, name: &str, n_arg: i32) -> Option<FuncId> {
        let ids = self.bucket(name)?;
        let mut variadic = None;
        for &id in ids {
            let def = &self.defs[id as usize];
            if def.n_arg == n_arg {
                return Some(FuncId(id));
            }
            if def.n_arg < 0 {
                variadic = Some(FuncId(id));
            }
        }
        variadic
    }

    /// Find any definition registered under `name`, regardless of arity.
    pub fn find_any(&self, name: &str) -> Option<FuncId> {
        self.bucket(name).and_then(|ids| ids.first().map(|&id| FuncId(id)))
    }

    fn bucket(&self, name: &str) -> Option<&Vec<u32>> {
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            self.by_name.get(name.to_ascii_lowercase().as_str())
        } else {
            self.by_name.get(name)
        }
    }
}

impl Default for FuncRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
