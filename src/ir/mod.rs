//! # Scheduling IR
//!
//! Expression and statement types for the scheduling middle-end. These are
//! plain value types: every transformation builds a new term, and structural
//! equality is the notion of sameness throughout the crate.
//!
//! ```text
//! Producer definitions -> [Loop-nest synthesis] -> Stmt tree -> downstream passes
//! ```
//!
//! Variable references follow the naming conventions in [`crate::names`];
//! bounds inference downstream resolves `*.loop_min`-style references against
//! the let bindings this layer emits.

pub mod printer;
pub mod substitute;
pub mod visit;

use crate::target::DeviceApi;

/// Scalar element types carried by producers and realize nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    Bool,
    UInt8,
    UInt16,
    Int32,
    Int64,
    Float32,
    Float64,
    /// Opaque pointer (buffer handles passed to extern stages).
    Handle,
}

impl ScalarType {
    /// A zero constant of this type, used as the type tag slot of
    /// `create_buffer_t` argument lists.
    pub fn zero(self) -> Expr {
        match self {
            ScalarType::Float32 | ScalarType::Float64 => Expr::FloatImm(0.0),
            ScalarType::Bool => Expr::BoolImm(false),
            _ => Expr::IntImm(0),
        }
    }
}

/// Arithmetic operators over integer expressions. Division and modulo are
/// Euclidean, matching the semantics bounds inference assumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Call flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallType {
    /// A reference to another producer's value at a site.
    Producer,
    /// A compiler-internal operation (`likely`, `create_buffer_t`, ...).
    Intrinsic,
    /// A call with external linkage.
    Extern,
    /// A call with external C++-mangled linkage.
    ExternCPlusPlus,
}

impl CallType {
    /// Producer references and intrinsics are pure; anything with external
    /// linkage may have observable effects.
    pub fn is_pure(self) -> bool {
        matches!(self, CallType::Producer | CallType::Intrinsic)
    }
}

/// Loop execution strategy attached to a dim and to the for-loops built
/// from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoopType {
    Serial,
    Parallel,
    Vectorized,
    Unrolled,
    GpuBlock,
    GpuThread,
}

impl LoopType {
    /// True for loop types whose iterations may run concurrently. Storage
    /// hoisted outside such a loop but computed inside it is a race.
    pub fn is_parallel(self) -> bool {
        matches!(self, LoopType::Parallel | LoopType::Vectorized)
    }
}

/// An integer-valued expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    IntImm(i64),
    FloatImm(f64),
    BoolImm(bool),
    /// String constants only appear as diagnostic arguments to runtime
    /// error calls.
    StringImm(String),
    Var(String),
    Arith {
        op: ArithOp,
        a: Box<Expr>,
        b: Box<Expr>,
    },
    Min(Box<Expr>, Box<Expr>),
    Max(Box<Expr>, Box<Expr>),
    Cmp {
        op: CmpOp,
        a: Box<Expr>,
        b: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Select {
        condition: Box<Expr>,
        true_value: Box<Expr>,
        false_value: Box<Expr>,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        call_type: CallType,
        /// Which output channel of a multi-valued producer this call reads.
        value_index: usize,
    },
}

impl Expr {
    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Var(name.into())
    }

    /// A producer-reference call reading channel 0.
    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
            call_type: CallType::Producer,
            value_index: 0,
        }
    }

    /// A producer-reference call reading a specific output channel.
    pub fn call_channel(name: impl Into<String>, args: Vec<Expr>, value_index: usize) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
            call_type: CallType::Producer,
            value_index,
        }
    }

    pub fn intrinsic(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
            call_type: CallType::Intrinsic,
            value_index: 0,
        }
    }

    pub fn extern_call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            name: name.into(),
            args,
            call_type: CallType::Extern,
            value_index: 0,
        }
    }

    pub fn as_const_int(&self) -> Option<i64> {
        match self {
            Expr::IntImm(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.as_const_int() == Some(0)
    }

    pub fn is_one(&self) -> bool {
        self.as_const_int() == Some(1)
    }

    pub fn eq(self, other: Expr) -> Expr {
        cmp(CmpOp::Eq, self, other)
    }

    pub fn ne(self, other: Expr) -> Expr {
        cmp(CmpOp::Ne, self, other)
    }

    pub fn lt(self, other: Expr) -> Expr {
        cmp(CmpOp::Lt, self, other)
    }

    pub fn le(self, other: Expr) -> Expr {
        cmp(CmpOp::Le, self, other)
    }

    pub fn gt(self, other: Expr) -> Expr {
        cmp(CmpOp::Gt, self, other)
    }

    pub fn ge(self, other: Expr) -> Expr {
        cmp(CmpOp::Ge, self, other)
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Expr {
        Expr::IntImm(v)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Expr {
        Expr::IntImm(i64::from(v))
    }
}

fn arith(op: ArithOp, a: Expr, b: Expr) -> Expr {
    Expr::Arith {
        op,
        a: Box::new(a),
        b: Box::new(b),
    }
}

fn cmp(op: CmpOp, a: Expr, b: Expr) -> Expr {
    Expr::Cmp {
        op,
        a: Box::new(a),
        b: Box::new(b),
    }
}

impl std::ops::Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        arith(ArithOp::Add, self, rhs)
    }
}

impl std::ops::Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        arith(ArithOp::Sub, self, rhs)
    }
}

impl std::ops::Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        arith(ArithOp::Mul, self, rhs)
    }
}

impl std::ops::Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        arith(ArithOp::Div, self, rhs)
    }
}

impl std::ops::Rem for Expr {
    type Output = Expr;
    fn rem(self, rhs: Expr) -> Expr {
        arith(ArithOp::Mod, self, rhs)
    }
}

/// `min(a, b)` as an expression.
pub fn min(a: Expr, b: Expr) -> Expr {
    Expr::Min(Box::new(a), Box::new(b))
}

/// `max(a, b)` as an expression.
pub fn max(a: Expr, b: Expr) -> Expr {
    Expr::Max(Box::new(a), Box::new(b))
}

/// Marks a condition as expected-true so a later pass can partition the
/// enclosing loop around it.
pub fn likely(e: Expr) -> Expr {
    Expr::intrinsic("likely", vec![e])
}

/// Like [`likely`], but only honored when the marked expression sits at or
/// inside the innermost non-trivial loop.
pub fn likely_if_innermost(e: Expr) -> Expr {
    Expr::intrinsic("likely_if_innermost", vec![e])
}

/// A min/extent pair, as carried by realize nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Range {
    pub min: Expr,
    pub extent: Expr,
}

impl Range {
    pub fn new(min: Expr, extent: Expr) -> Range {
        Range { min, extent }
    }
}

/// An imperative statement.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        value: Expr,
        body: Box<Stmt>,
    },
    For {
        name: String,
        min: Expr,
        extent: Expr,
        loop_type: LoopType,
        device_api: DeviceApi,
        body: Box<Stmt>,
    },
    IfThenElse {
        condition: Expr,
        then_case: Box<Stmt>,
        else_case: Option<Box<Stmt>>,
    },
    Block(Vec<Stmt>),
    /// Multi-dimensional, multi-valued store into a producer's buffer.
    Provide {
        name: String,
        values: Vec<Expr>,
        args: Vec<Expr>,
    },
    /// Allocation bracket declaring the lifetime and bounds of a producer's
    /// storage.
    Realize {
        name: String,
        types: Vec<ScalarType>,
        bounds: Vec<Range>,
        condition: Expr,
        body: Box<Stmt>,
    },
    /// Marker delimiting the production of one producer's values from their
    /// consumption.
    ProducerConsumer {
        name: String,
        is_producer: bool,
        body: Box<Stmt>,
    },
    Assert {
        condition: Expr,
        message: Expr,
    },
    Evaluate(Expr),
}

impl Stmt {
    pub fn let_stmt(name: impl Into<String>, value: Expr, body: Stmt) -> Stmt {
        Stmt::Let {
            name: name.into(),
            value,
            body: Box::new(body),
        }
    }

    pub fn if_then(condition: Expr, then_case: Stmt) -> Stmt {
        Stmt::IfThenElse {
            condition,
            then_case: Box::new(then_case),
            else_case: None,
        }
    }

    pub fn if_then_else(condition: Expr, then_case: Stmt, else_case: Stmt) -> Stmt {
        Stmt::IfThenElse {
            condition,
            then_case: Box::new(then_case),
            else_case: Some(Box::new(else_case)),
        }
    }

    pub fn producer(name: impl Into<String>, body: Stmt) -> Stmt {
        Stmt::ProducerConsumer {
            name: name.into(),
            is_producer: true,
            body: Box::new(body),
        }
    }

    pub fn consumer(name: impl Into<String>, body: Stmt) -> Stmt {
        Stmt::ProducerConsumer {
            name: name.into(),
            is_producer: false,
            body: Box::new(body),
        }
    }

    /// A sequence of statements. Nested blocks are flattened and a
    /// single-element sequence collapses to its element.
    pub fn block(stmts: Vec<Stmt>) -> Stmt {
        let mut flat = Vec::with_capacity(stmts.len());
        for s in stmts {
            match s {
                Stmt::Block(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        if flat.len() == 1 {
            flat.pop().expect("len checked")
        } else {
            Stmt::Block(flat)
        }
    }

    /// Sequence two statements, either of which may be absent.
    pub fn sequence(first: Option<Stmt>, second: Option<Stmt>) -> Option<Stmt> {
        match (first, second) {
            (Some(a), Some(b)) => Some(Stmt::block(vec![a, b])),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }
}
