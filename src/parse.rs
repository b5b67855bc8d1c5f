use crate::emit::{Label, Program};
use crate::expr::{ExprId, ExprPool};
use crate::func::{FuncId, FuncRegistry};
use crate::schema::TableSchema;

/// One slot of the per-query aggregate table.
///
/// Value slots (`is_agg == false`) are distinct column references used
/// inside aggregation; aggregate slots are distinct aggregate-function
/// calls with their function binding resolved once.
#[derive(Clone, Debug)]
pub struct AggEntry {
    pub expr: ExprId,
    pub is_agg: bool,
    pub func: Option<FuncId>,
}

/// Trigger-body scope: `new`/`old` pseudo-table cursors and the jump target
/// of `RAISE(IGNORE)`.
#[derive(Debug)]
pub struct TriggerScope {
    pub new_cursor: Option<i32>,
    pub old_cursor: Option<i32>,
    pub table: TableSchema,
    pub ignore_label: Label,
}

/// Where a pending subquery's result goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubqueryDest {
    /// Fill the temporary table on this cursor (IN-subquery form).
    Set { cursor: i32 },
    /// Leave the single value in this memory cell (scalar subquery).
    Cell { cell: i32 },
}

/// A subquery the resolver has allocated resources for; the statement
/// compiler drains these and generates the evaluation code.
#[derive(Clone, Copy, Debug)]
pub struct SubqueryJob {
    pub expr: ExprId,
    pub dest: SubqueryDest,
}

/// Host hook invoked for every successful column binding.
pub type AccessHook = dyn FnMut(&str, &str) + 'static;

/// Per-statement compile context.
///
/// Owns the expression pool (and through it the source text), the program
/// being emitted, the error state, and the counters handing out cursor,
/// memory-cell and set numbers. The resolver, checker and emitter all
/// operate through this object.
pub struct ParseCtx<'db> {
    pub pool: ExprPool,
    pub program: Program,
    registry: &'db FuncRegistry,
    n_err: usize,
    err_msg: Option<String>,
    /// Next free table cursor.
    pub n_tab: i32,
    /// Next free memory cell.
    pub n_mem: i32,
    /// Next free set identifier.
    pub n_set: i32,
    /// Next free variable number.
    pub n_var: i32,
    pub agg: Vec<AggEntry>,
    pub subqueries: Vec<SubqueryJob>,
    /// File-format gate for text comparison opcodes.
    pub file_format: u32,
    pub(crate) trigger: Option<TriggerScope>,
    use_agg: bool,
    pub(crate) access_hook: Option<Box<AccessHook>>,
}

impl<'db> ParseCtx<'db> {
    pub fn new(sql: impl Into<String>, registry: &'db FuncRegistry) -> Self {
        Self {
            pool: ExprPool::new(sql),
            program: Program::new(),
            registry,
            n_err: 0,
            err_msg: None,
            n_tab: 0,
            n_mem: 0,
            n_set: 0,
            n_var: 0,
            agg: Vec::new(),
            subqueries: Vec::new(),
            file_format: 4,
            trigger: None,
            use_agg: false,
            access_hook: None,
        }
    }

    pub fn registry(&self) -> &'db FuncRegistry {
        self.registry
    }

    /// Record a compile error. The most recent message is retained.
    pub(crate) fn error(&mut self, msg: String) {
        self.n_err += 1;
        self.err_msg = Some(msg);
    }

    pub fn error_count(&self) -> usize {
        self.n_err
    }

    pub fn has_errors(&self) -> bool {
        self.n_err != 0
    }

    pub fn error_message(&self) -> Option<&str> {
        self.err_msg.as_deref()
    }

    /// Flip the aggregate-finalisation context: while set, column
    /// references emit aggregate-slot reads instead of cursor reads.
    pub fn set_aggregate_context(&mut self, on: bool) {
        self.use_agg = on;
    }

    pub fn aggregate_context(&self) -> bool {
        self.use_agg
    }

    pub fn enter_trigger(&mut self, scope: TriggerScope) {
        self.trigger = Some(scope);
    }

    pub fn exit_trigger(&mut self) -> Option<TriggerScope> {
        self.trigger.take()
    }

    pub fn in_trigger(&self) -> bool {
        self.trigger.is_some()
    }

    /// Install the host's read-access hook, invoked with `(table, column)`
    /// on every successful column binding.
    pub fn set_access_hook(&mut self, hook: Box<AccessHook>) {
        self.access_hook = Some(hook);
    }
}
