//! SQL expression compiler and external merge sorter.
//!
//! The compile half turns parsed expression trees into stack-machine
//! bytecode: name resolution, function checking, aggregate analysis,
//! affinity inference and emission with short-circuit branching. The sort
//! half is an external merge sorter that spills packed memory arrays to
//! temp files and merges them through a tournament tree, optionally across
//! worker threads.

pub mod emit;
pub mod expr;
pub mod func;
pub mod parse;
pub mod record;
pub mod resolve;
pub mod schema;
pub mod sort;
pub mod sql;
pub mod token;

pub use emit::{Insn, Label, Opcode, P3, Program};
pub use expr::{BinOp, ExprId, ExprKind, ExprList, ExprNode, ExprPool, Select, UnOp};
pub use func::{FuncDef, FuncRegistry};
pub use parse::ParseCtx;
pub use record::{FieldRef, KeyCompare, RecordCompare, UnpackedRecord};
pub use resolve::expr_affinity;
pub use schema::{Affinity, ColumnDef, SrcItem, TableSchema};
pub use sort::{Sorter, SorterConfig};
