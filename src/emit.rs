use std::fmt;

use smallvec::SmallVec;

use crate::expr::{BinOp, ExprId, ExprItem, ExprKind, ExprList, InSet, RaiseAction, UnOp};
use crate::func::FuncId;
use crate::parse::ParseCtx;
use crate::resolve::expr_affinity;
use crate::schema::Affinity;
use crate::token::dequote;

/// Error code carried by `Halt` for RAISE(ROLLBACK|ABORT|FAIL).
pub const HALT_CONSTRAINT: i32 = 19;

/// Stack-machine instruction set targeted by the emitter.
///
/// Discriminants are part of the emitter/VM contract; in particular each
/// text comparison opcode is exactly 6 above its numeric counterpart, and
/// the emitter converts between the families by that offset.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Goto = 1,
    Halt = 2,
    Integer = 3,
    String = 4,
    Variable = 5,
    Pop = 6,
    Dup = 7,
    Pull = 8,
    Column = 9,
    Recno = 10,
    Function = 11,
    AggGet = 12,
    MemLoad = 13,
    AddImm = 14,
    Not = 15,
    BitNot = 16,
    Negative = 17,

    Add = 30,
    Subtract = 31,
    Multiply = 32,
    Divide = 33,
    Remainder = 34,
    BitAnd = 35,
    BitOr = 36,
    ShiftLeft = 37,
    ShiftRight = 38,
    Concat = 39,
    And = 40,
    Or = 41,

    IsNull = 50,
    NotNull = 51,
    If = 52,
    IfNot = 53,

    Eq = 60,
    Ne = 61,
    Lt = 62,
    Le = 63,
    Gt = 64,
    Ge = 65,
    StrEq = 66,
    StrNe = 67,
    StrLt = 68,
    StrLe = 69,
    StrGt = 70,
    StrGe = 71,

    Found = 80,
    NotFound = 81,
    SetFound = 82,
    SetNotFound = 83,
    SetInsert = 84,
    OpenTemp = 85,

    SorterOpen = 90,
    SorterInsert = 91,
    SorterNext = 92,
    SorterData = 93,
}

impl Opcode {
    /// The text-comparison form of a numeric comparison opcode.
    pub fn text_variant(self) -> Opcode {
        match self {
            Opcode::Eq => Opcode::StrEq,
            Opcode::Ne => Opcode::StrNe,
            Opcode::Lt => Opcode::StrLt,
            Opcode::Le => Opcode::StrLe,
            Opcode::Gt => Opcode::StrGt,
            Opcode::Ge => Opcode::StrGe,
            other => other,
        }
    }

    pub fn is_comparison(self) -> bool {
        let v = self as u8;
        (Opcode::Eq as u8..=Opcode::StrGe as u8).contains(&v)
    }
}

/// Inline operand: a byte string or a function binding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum P3 {
    Text(Box<str>),
    Func(FuncId),
}

impl P3 {
    pub fn text(text: impl Into<Box<str>>) -> Self {
        P3::Text(text.into())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Insn {
    pub op: Opcode,
    pub p1: i32,
    pub p2: i32,
    pub p3: Option<P3>,
}

/// Forward-reference marker; resolves to an instruction address at seal
/// time. Encoded as a negative integer in the `p2` slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(i32);

impl Label {
    /// Raw `p2` encoding of this label.
    pub fn p2(self) -> i32 {
        self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ProgramError {
    UnresolvedLabel(i32),
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedLabel(label) => {
                write!(f, "Program sealed with unresolved label {label}")
            }
        }
    }
}

impl std::error::Error for ProgramError {}

const UNRESOLVED: i32 = -1;

/// Growable instruction buffer with label fixup.
#[derive(Debug, Default)]
pub struct Program {
    insns: Vec<Insn>,
    labels: Vec<i32>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    /// Address of the next instruction to be emitted.
    pub fn current_addr(&self) -> i32 {
        self.insns.len() as i32
    }

    pub fn add(&mut self, op: Opcode, p1: i32, p2: i32) -> usize {
        self.insns.push(Insn { op, p1, p2, p3: None });
        self.insns.len() - 1
    }

    pub fn add_p3(&mut self, op: Opcode, p1: i32, p2: i32, p3: P3) -> usize {
        self.insns.push(Insn { op, p1, p2, p3: Some(p3) });
        self.insns.len() - 1
    }

    /// Retroactively set the jump operand of the instruction at `addr`.
    pub fn change_p2(&mut self, addr: usize, p2: i32) {
        self.insns[addr].p2 = p2;
    }

    /// Allocate a new label. Labels are handed out as negative integers and
    /// patched to real addresses by [`seal`](Self::seal).
    pub fn make_label(&mut self) -> Label {
        self.labels.push(UNRESOLVED);
        Label(-(self.labels.len() as i32))
    }

    /// Record that `label` refers to the next instruction address.
    pub fn resolve_label(&mut self, label: Label) {
        let idx = (-label.0 - 1) as usize;
        self.labels[idx] = self.current_addr();
    }

    /// Patch every label reference to its resolved address. All forward
    /// references must be resolved by now; an unresolved label is a
    /// contract violation by the caller.
    pub fn seal(&mut self) -> Result<(), ProgramError> {
        for insn in &mut self.insns {
            if insn.p2 < 0 {
                let idx = (-insn.p2 - 1) as usize;
                match self.labels.get(idx) {
                    Some(&target) if target >= 0 => insn.p2 = target,
                    _ => return Err(ProgramError::UnresolvedLabel(insn.p2)),
                }
            }
        }
        Ok(())
    }
}

fn binop_opcode(op: BinOp) -> Opcode {
    match op {
        BinOp::Add => Opcode::Add,
        BinOp::Sub => Opcode::Subtract,
        BinOp::Mul => Opcode::Multiply,
        BinOp::Div => Opcode::Divide,
        BinOp::Rem => Opcode::Remainder,
        BinOp::BitAnd => Opcode::BitAnd,
        BinOp::BitOr => Opcode::BitOr,
        BinOp::ShiftLeft => Opcode::ShiftLeft,
        BinOp::ShiftRight => Opcode::ShiftRight,
        BinOp::Concat => Opcode::Concat,
        BinOp::And => Opcode::And,
        BinOp::Or => Opcode::Or,
        BinOp::Lt => Opcode::Lt,
        BinOp::Le => Opcode::Le,
        BinOp::Gt => Opcode::Gt,
        BinOp::Ge => Opcode::Ge,
        BinOp::Ne => Opcode::Ne,
        BinOp::Eq => Opcode::Eq,
    }
}

/// Comparison opcode for the branch that fires when `op` is false.
fn inverted_comparison(op: BinOp) -> Opcode {
    match op {
        BinOp::Lt => Opcode::Ge,
        BinOp::Le => Opcode::Gt,
        BinOp::Gt => Opcode::Le,
        BinOp::Ge => Opcode::Lt,
        BinOp::Ne => Opcode::Eq,
        BinOp::Eq => Opcode::Ne,
        _ => unreachable!("not a comparison"),
    }
}

fn raise_code(action: RaiseAction) -> i32 {
    match action {
        RaiseAction::Rollback => 1,
        RaiseAction::Abort => 2,
        RaiseAction::Fail => 3,
        RaiseAction::Ignore => 4,
    }
}

impl ParseCtx<'_> {
    /// Emit code that evaluates `id` and leaves the result on top of stack.
    pub fn emit_value(&mut self, id: ExprId) {
        if self.has_errors() {
            return;
        }
        let node = self.pool.node(id);
        let kind = node.kind.clone();
        let left = node.left;
        let right = node.right;

        match kind {
            ExprKind::Column(col) => {
                if self.aggregate_context() {
                    let slot = col.agg_slot.unwrap_or(0);
                    self.program.add(Opcode::AggGet, 0, slot as i32);
                } else if col.column >= 0 {
                    self.program.add(Opcode::Column, col.cursor, col.column);
                } else {
                    self.program.add(Opcode::Recno, col.cursor, 0);
                }
            }
            ExprKind::Integer => {
                let text = self.pool.node_token_text(id).to_owned();
                match crate::token::as_i32(&text) {
                    Some(value) => self.program.add_p3(Opcode::Integer, value, 0, P3::text(text)),
                    None => self.program.add_p3(Opcode::String, 0, 0, P3::text(text)),
                };
            }
            ExprKind::Float | ExprKind::Str => {
                let text = dequote(self.pool.node_token_text(id)).into_owned();
                self.program.add_p3(Opcode::String, 0, 0, P3::text(text));
            }
            ExprKind::Null => {
                self.program.add(Opcode::String, 0, 0);
            }
            ExprKind::Variable { index } => {
                self.program.add(Opcode::Variable, index, 0);
            }
            ExprKind::Binary(op) if op.is_comparison() => {
                let mut opcode = binop_opcode(op);
                if self.file_format >= 4 && expr_affinity(&self.pool, id) == Affinity::Text {
                    opcode = opcode.text_variant();
                }
                self.emit_value(left.expect("comparison lhs"));
                self.emit_value(right.expect("comparison rhs"));
                self.program.add(opcode, 0, 0);
            }
            ExprKind::Binary(op @ (BinOp::ShiftLeft | BinOp::ShiftRight)) => {
                // Shift operands are pushed right-to-left.
                self.emit_value(right.expect("shift rhs"));
                self.emit_value(left.expect("shift lhs"));
                self.program.add(binop_opcode(op), 0, 0);
            }
            ExprKind::Binary(BinOp::Concat) => {
                self.emit_value(left.expect("concat lhs"));
                self.emit_value(right.expect("concat rhs"));
                self.program.add(Opcode::Concat, 2, 0);
            }
            ExprKind::Binary(op) => {
                self.emit_value(left.expect("binary lhs"));
                self.emit_value(right.expect("binary rhs"));
                self.program.add(binop_opcode(op), 0, 0);
            }
            ExprKind::Unary(UnOp::Neg) => {
                let operand = left.expect("negation operand");
                let operand_kind = self.pool.node(operand).kind.clone();
                if matches!(operand_kind, ExprKind::Integer | ExprKind::Float) {
                    // Fuse the minus sign into the literal, keeping the
                    // 32-bit fit heuristic.
                    let text = format!("-{}", self.pool.node_token_text(operand));
                    let fused = matches!(operand_kind, ExprKind::Integer)
                        .then(|| crate::token::as_i32(&text))
                        .flatten();
                    match fused {
                        Some(value) => {
                            self.program.add_p3(Opcode::Integer, value, 0, P3::text(text))
                        }
                        None => self.program.add_p3(Opcode::String, 0, 0, P3::text(text)),
                    };
                } else {
                    self.emit_value(operand);
                    self.program.add(Opcode::Negative, 0, 0);
                }
            }
            ExprKind::Unary(UnOp::Not) => {
                self.emit_value(left.expect("NOT operand"));
                self.program.add(Opcode::Not, 0, 0);
            }
            ExprKind::Unary(UnOp::BitNot) => {
                self.emit_value(left.expect("~ operand"));
                self.program.add(Opcode::BitNot, 0, 0);
            }
            ExprKind::Unary(UnOp::Plus) | ExprKind::Alias { .. } => {
                self.emit_value(left.expect("operand"));
            }
            ExprKind::IsNull | ExprKind::NotNull => {
                let opcode =
                    if matches!(kind, ExprKind::IsNull) { Opcode::IsNull } else { Opcode::NotNull };
                self.program.add(Opcode::Integer, 1, 0);
                self.emit_value(left.expect("null-test operand"));
                let dest = self.program.current_addr() + 2;
                self.program.add(opcode, 1, dest);
                self.program.add(Opcode::AddImm, -1, 0);
            }
            ExprKind::AggFunction { agg_slot, .. } => {
                self.program.add(Opcode::AggGet, 0, agg_slot.unwrap_or(0) as i32);
            }
            ExprKind::Function { func, .. } => {
                let node = self.pool.node(id);
                let args = node.args.clone().unwrap_or_default();
                let func = func.or_else(|| {
                    let name = self.pool.node_token_text(id);
                    self.registry().find(name, args.len() as i32)
                });
                let Some(func) = func else {
                    let name = self.pool.node_token_text(id).to_owned();
                    self.error(format!("no such function: {name}"));
                    return;
                };
                let include_types = self.registry().def(func).include_types;
                let pushed = self.emit_list(&args, include_types);
                self.program.add_p3(Opcode::Function, pushed as i32, 0, P3::Func(func));
            }
            ExprKind::ScalarSelect { cell } => {
                self.program.add(Opcode::MemLoad, cell.unwrap_or(0), 0);
            }
            ExprKind::In { set } => {
                self.program.add(Opcode::Integer, 1, 0);
                self.emit_value(left.expect("IN lhs"));
                let addr = self.program.current_addr();
                self.program.add(Opcode::NotNull, -1, addr + 4);
                self.program.add(Opcode::Pop, 2, 0);
                self.program.add(Opcode::String, 0, 0);
                self.program.add(Opcode::Goto, 0, addr + 6);
                match set.unwrap_or(InSet::Values(0)) {
                    InSet::Select(cursor) => self.program.add(Opcode::Found, cursor, addr + 6),
                    InSet::Values(set) => self.program.add(Opcode::SetFound, set, addr + 6),
                };
                self.program.add(Opcode::AddImm, -1, 0);
            }
            ExprKind::Between => {
                let node = self.pool.node(id);
                let args = node.args.clone().unwrap_or_default();
                self.emit_value(left.expect("BETWEEN operand"));
                self.program.add(Opcode::Dup, 0, 0);
                self.emit_value(args.items[0].expr);
                self.program.add(Opcode::Ge, 0, 0);
                self.program.add(Opcode::Pull, 1, 0);
                self.emit_value(args.items[1].expr);
                self.program.add(Opcode::Le, 0, 0);
                self.program.add(Opcode::And, 0, 0);
            }
            ExprKind::Case => {
                let node = self.pool.node(id);
                let args = node.args.clone().unwrap_or_default();
                debug_assert!(!args.is_empty() && args.len() % 2 == 0);
                let end = self.program.make_label();
                let has_base = left.is_some();
                if let Some(base) = left {
                    self.emit_value(base);
                }
                let mut i = 0;
                while i + 1 < args.len() {
                    self.emit_value(args.items[i].expr);
                    let jump = if has_base {
                        self.program.add(Opcode::Dup, 1, 1);
                        let jump = self.program.add(Opcode::Ne, 1, 0);
                        self.program.add(Opcode::Pop, 1, 0);
                        jump
                    } else {
                        self.program.add(Opcode::IfNot, 1, 0)
                    };
                    self.emit_value(args.items[i + 1].expr);
                    self.program.add(Opcode::Goto, 0, end.p2());
                    let addr = self.program.current_addr();
                    self.program.change_p2(jump, addr);
                    i += 2;
                }
                if has_base {
                    self.program.add(Opcode::Pop, 1, 0);
                }
                match right {
                    Some(els) => self.emit_value(els),
                    None => {
                        self.program.add(Opcode::String, 0, 0);
                    }
                }
                self.program.resolve_label(end);
            }
            ExprKind::Raise(action) => {
                let Some(trigger) = self.trigger.as_ref() else {
                    self.error("RAISE() may only be used within a trigger-program".to_owned());
                    return;
                };
                if action == RaiseAction::Ignore {
                    let target = trigger.ignore_label;
                    self.program.add_p3(
                        Opcode::Goto,
                        0,
                        target.p2(),
                        P3::text("(IGNORE jump)"),
                    );
                } else {
                    let msg = dequote(self.pool.node_token_text(id)).into_owned();
                    self.program.add_p3(
                        Opcode::Halt,
                        HALT_CONSTRAINT,
                        raise_code(action),
                        P3::text(msg),
                    );
                }
            }
            ExprKind::Id | ExprKind::Dot => {
                debug_assert!(false, "unresolved identifier reached the emitter");
            }
        }
    }

    /// Emit each list element's value in order. With `include_types` set, a
    /// `"numeric"` or `"text"` affinity string follows each value; the
    /// return value is the number of stack entries pushed (`n` or `2n`).
    pub fn emit_list(&mut self, list: &ExprList, include_types: bool) -> usize {
        if self.has_errors() {
            return 0;
        }
        let items: SmallVec<[ExprItem; 8]> = list.items.iter().cloned().collect();
        for item in &items {
            self.emit_value(item.expr);
            if include_types {
                let name = match expr_affinity(&self.pool, item.expr) {
                    Affinity::Numeric => "numeric",
                    Affinity::Text => "text",
                };
                self.program.add_p3(Opcode::String, 0, 0, P3::text(name));
            }
        }
        if include_types { items.len() * 2 } else { items.len() }
    }

    /// Emit code that jumps to `dest` when the expression is true and falls
    /// through when it is false. A NULL result jumps iff `jump_if_null`.
    pub fn emit_branch_true(&mut self, id: ExprId, dest: Label, jump_if_null: bool) {
        if self.has_errors() {
            return;
        }
        let node = self.pool.node(id);
        let kind = node.kind.clone();
        let left = node.left;
        let right = node.right;
        let null_flag = jump_if_null as i32;

        match kind {
            ExprKind::Binary(BinOp::And) => {
                let fall = self.program.make_label();
                self.emit_branch_false(left.expect("AND lhs"), fall, !jump_if_null);
                self.emit_branch_true(right.expect("AND rhs"), dest, jump_if_null);
                self.program.resolve_label(fall);
            }
            ExprKind::Binary(BinOp::Or) => {
                self.emit_branch_true(left.expect("OR lhs"), dest, jump_if_null);
                self.emit_branch_true(right.expect("OR rhs"), dest, jump_if_null);
            }
            ExprKind::Unary(UnOp::Not) => {
                self.emit_branch_false(left.expect("NOT operand"), dest, jump_if_null);
            }
            ExprKind::Binary(op) if op.is_comparison() => {
                let mut opcode = binop_opcode(op);
                if self.file_format >= 4 && expr_affinity(&self.pool, id) == Affinity::Text {
                    opcode = opcode.text_variant();
                }
                self.emit_value(left.expect("comparison lhs"));
                self.emit_value(right.expect("comparison rhs"));
                self.program.add(opcode, null_flag, dest.p2());
            }
            ExprKind::IsNull | ExprKind::NotNull => {
                let opcode =
                    if matches!(kind, ExprKind::IsNull) { Opcode::IsNull } else { Opcode::NotNull };
                self.emit_value(left.expect("null-test operand"));
                self.program.add(opcode, 1, dest.p2());
            }
            ExprKind::In { set } => {
                self.emit_value(left.expect("IN lhs"));
                let addr = self.program.current_addr();
                self.program.add(Opcode::NotNull, -1, addr + 3);
                self.program.add(Opcode::Pop, 1, 0);
                let miss = if jump_if_null { dest.p2() } else { addr + 4 };
                self.program.add(Opcode::Goto, 0, miss);
                match set.unwrap_or(InSet::Values(0)) {
                    InSet::Select(cursor) => self.program.add(Opcode::Found, cursor, dest.p2()),
                    InSet::Values(set) => self.program.add(Opcode::SetFound, set, dest.p2()),
                };
            }
            ExprKind::Between => {
                let node = self.pool.node(id);
                let args = node.args.clone().unwrap_or_default();
                self.emit_value(left.expect("BETWEEN operand"));
                self.program.add(Opcode::Dup, 0, 0);
                self.emit_value(args.items[0].expr);
                let skip = self.program.add(Opcode::Lt, !jump_if_null as i32, 0);
                self.emit_value(args.items[1].expr);
                self.program.add(Opcode::Le, null_flag, dest.p2());
                self.program.add(Opcode::Integer, 0, 0);
                let addr = self.program.current_addr();
                self.program.change_p2(skip, addr);
                self.program.add(Opcode::Pop, 1, 0);
            }
            _ => {
                self.emit_value(id);
                self.program.add(Opcode::If, null_flag, dest.p2());
            }
        }
    }

    /// Emit code that jumps to `dest` when the expression is false and
    /// falls through when it is true. A NULL result jumps iff
    /// `jump_if_null`.
    pub fn emit_branch_false(&mut self, id: ExprId, dest: Label, jump_if_null: bool) {
        if self.has_errors() {
            return;
        }
        let node = self.pool.node(id);
        let kind = node.kind.clone();
        let left = node.left;
        let right = node.right;
        let null_flag = jump_if_null as i32;

        match kind {
            ExprKind::Binary(BinOp::And) => {
                self.emit_branch_false(left.expect("AND lhs"), dest, jump_if_null);
                self.emit_branch_false(right.expect("AND rhs"), dest, jump_if_null);
            }
            ExprKind::Binary(BinOp::Or) => {
                let fall = self.program.make_label();
                self.emit_branch_true(left.expect("OR lhs"), fall, !jump_if_null);
                self.emit_branch_false(right.expect("OR rhs"), dest, jump_if_null);
                self.program.resolve_label(fall);
            }
            ExprKind::Unary(UnOp::Not) => {
                self.emit_branch_true(left.expect("NOT operand"), dest, jump_if_null);
            }
            ExprKind::Binary(op) if op.is_comparison() => {
                let mut opcode = inverted_comparison(op);
                if self.file_format >= 4 && expr_affinity(&self.pool, id) == Affinity::Text {
                    opcode = opcode.text_variant();
                }
                self.emit_value(left.expect("comparison lhs"));
                self.emit_value(right.expect("comparison rhs"));
                self.program.add(opcode, null_flag, dest.p2());
            }
            ExprKind::IsNull | ExprKind::NotNull => {
                let opcode =
                    if matches!(kind, ExprKind::IsNull) { Opcode::NotNull } else { Opcode::IsNull };
                self.emit_value(left.expect("null-test operand"));
                self.program.add(opcode, 1, dest.p2());
            }
            ExprKind::In { set } => {
                self.emit_value(left.expect("IN lhs"));
                let addr = self.program.current_addr();
                self.program.add(Opcode::NotNull, -1, addr + 3);
                self.program.add(Opcode::Pop, 1, 0);
                let miss = if jump_if_null { dest.p2() } else { addr + 4 };
                self.program.add(Opcode::Goto, 0, miss);
                match set.unwrap_or(InSet::Values(0)) {
                    InSet::Select(cursor) => self.program.add(Opcode::NotFound, cursor, dest.p2()),
                    InSet::Values(set) => self.program.add(Opcode::SetNotFound, set, dest.p2()),
                };
            }
            ExprKind::Between => {
                let node = self.pool.node(id);
                let args = node.args.clone().unwrap_or_default();
                self.emit_value(left.expect("BETWEEN operand"));
                self.program.add(Opcode::Dup, 0, 0);
                self.emit_value(args.items[0].expr);
                let addr = self.program.current_addr();
                self.program.add(Opcode::Ge, !jump_if_null as i32, addr + 3);
                self.program.add(Opcode::Pop, 1, 0);
                self.program.add(Opcode::Goto, 0, dest.p2());
                self.emit_value(args.items[1].expr);
                self.program.add(Opcode::Gt, null_flag, dest.p2());
            }
            _ => {
                self.emit_value(id);
                self.program.add(Opcode::IfNot, null_flag, dest.p2());
            }
        }
    }
}
