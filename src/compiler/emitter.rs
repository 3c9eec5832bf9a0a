use std::collections::HashMap;

use crate::compiler::ast::{
    BinaryOp, Decl, Designator, Expr, ExprKind, ForInit, FuncDef, Init, Program, Stmt, StmtKind,
    UnaryOp, VarDecl,
};
use crate::compiler::buffer::CodeBuffer;
use crate::compiler::intern::Atom;
use crate::compiler::session::Session;
use crate::compiler::symtab::{SymKind, SymbolTable};
use crate::compiler::types::{self, StorageClass, TypeId, TypeKind, TypeTable};

/// Globals start above a reserved low-memory region so null-pointer probes
/// stay distinguishable.
const GLOBAL_BASE: u32 = 4096;

/// C library functions the runtime implements directly as `rt.name(...)`.
const RUNTIME_FUNCS: &[&str] = &[
    "printf", "fprintf", "sprintf", "snprintf", "scanf", "sscanf", "malloc", "calloc", "realloc",
    "free", "strlen", "strcpy", "strncpy", "strcmp", "strncmp", "strcat", "strncat", "strchr",
    "strrchr", "strstr", "memcpy", "memmove", "memset", "memcmp", "memchr", "atoi", "atof",
    "strtol", "strtoul", "strtod", "abs", "labs", "rand", "srand", "exit", "abort", "qsort",
    "bsearch", "isalpha", "isdigit", "isalnum", "isspace", "isupper", "islower", "ispunct",
    "isprint", "iscntrl", "isxdigit", "toupper", "tolower", "fopen", "fclose", "fread", "fwrite",
    "fgets", "fputs", "feof", "fgetc", "fputc", "fseek", "ftell", "rewind", "fflush", "puts",
    "putchar", "getchar", "assert", "perror", "clock", "time", "difftime", "localtime",
    "strftime", "strdup", "strtoll", "strtoull", "vsnprintf", "vfprintf", "__errno_ptr",
];

/// C math functions lowered to `Math.*`; float variants share the same
/// JavaScript function.
fn math_js_name(name: &str) -> Option<&'static str> {
    Some(match name {
        "sin" | "sinf" => "sin",
        "cos" | "cosf" => "cos",
        "tan" | "tanf" => "tan",
        "asin" | "asinf" => "asin",
        "acos" | "acosf" => "acos",
        "atan" | "atanf" => "atan",
        "atan2" | "atan2f" => "atan2",
        "sqrt" | "sqrtf" => "sqrt",
        "pow" | "powf" => "pow",
        "fabs" | "fabsf" => "abs",
        "ceil" | "ceilf" => "ceil",
        "floor" | "floorf" => "floor",
        "fmod" | "fmodf" => "fmod",
        "log" | "logf" => "log",
        "log10" | "log10f" => "log10",
        "exp" | "expf" => "exp",
        "tanh" | "tanhf" => "tanh",
        "fmin" | "fminf" => "min",
        "fmax" | "fmaxf" => "max",
        "round" | "roundf" => "round",
        _ => return None,
    })
}

fn align_up(value: u32, align: u32) -> u32 {
    let align = align.max(1);
    (value + align - 1) & !(align - 1)
}

#[derive(Debug, Clone, Copy)]
struct CgVar {
    addr: i64,
    is_local: bool,
    ty: TypeId,
}

/// Emits the final JavaScript program against the `rt` runtime ABI: all C
/// data lives in `rt.mem`, the stack grows down from `rt.mem.sp`, doubles
/// travel as BigInt bit patterns and `long long` as BigInt values.
pub struct Emitter<'a> {
    sess: &'a mut Session,
    types: &'a TypeTable,
    symtab: &'a SymbolTable,
    out: CodeBuffer,
    data: CodeBuffer,
    locals: HashMap<Atom, CgVar>,
    globals: HashMap<Atom, CgVar>,
    stack_offset: u32,
    str_count: u32,
    global_offset: u32,
    current_ret: Option<TypeId>,
}

pub fn emit(
    program: &Program,
    sess: &mut Session,
    types: &TypeTable,
    symtab: &SymbolTable,
) -> String {
    Emitter {
        sess,
        types,
        symtab,
        out: CodeBuffer::new(),
        data: CodeBuffer::new(),
        locals: HashMap::new(),
        globals: HashMap::new(),
        stack_offset: 0,
        str_count: 0,
        global_offset: GLOBAL_BASE,
        current_ret: None,
    }
    .emit_program(program)
}

impl<'a> Emitter<'a> {
    fn name(&self, atom: Atom) -> String {
        self.sess.interner.str(atom).to_string()
    }

    fn is_double(&self, ty: Option<TypeId>) -> bool {
        ty.map(|t| {
            matches!(
                self.types.get(t).kind,
                TypeKind::Double | TypeKind::LongDouble
            )
        })
        .unwrap_or(false)
    }

    fn is_u64(&self, ty: Option<TypeId>) -> bool {
        ty.map(|t| matches!(self.types.get(t).kind, TypeKind::LongLong))
            .unwrap_or(false)
    }

    fn type_sz(&self, ty: Option<TypeId>) -> u32 {
        ty.map(|t| self.types.size_of(t))
            .filter(|&s| s > 0)
            .unwrap_or(4)
    }

    fn is_record(&self, ty: Option<TypeId>) -> bool {
        ty.map(|t| self.types.is_record(t)).unwrap_or(false)
    }

    fn is_addr_kind(&self, ty: Option<TypeId>) -> bool {
        ty.map(|t| self.types.is_record(t) || self.types.is_array(t))
            .unwrap_or(false)
    }

    /// Memory accessor name for loads of the given type (little-endian).
    fn js_getter(&self, ty: Option<TypeId>) -> &'static str {
        let Some(t) = ty else { return "readInt32" };
        let record = self.types.get(t);
        match record.kind {
            TypeKind::Bool => "readUint8",
            TypeKind::Char => {
                if record.is_unsigned {
                    "readUint8"
                } else {
                    "readInt8"
                }
            }
            TypeKind::Short => {
                if record.is_unsigned {
                    "readUint16"
                } else {
                    "readInt16"
                }
            }
            TypeKind::Int | TypeKind::Enum { .. } | TypeKind::Long => {
                if record.is_unsigned {
                    "readUint32"
                } else {
                    "readInt32"
                }
            }
            TypeKind::LongLong => {
                if record.is_unsigned {
                    "readBigUint64"
                } else {
                    "readBigInt64"
                }
            }
            TypeKind::Float => "readFloat32",
            TypeKind::Double | TypeKind::LongDouble => "readBigUint64",
            TypeKind::Ptr { .. } => "readUint32",
            _ => "readInt32",
        }
    }

    fn js_setter(&self, ty: Option<TypeId>) -> &'static str {
        match self.js_getter(ty) {
            "readUint8" => "writeUint8",
            "readInt8" => "writeInt8",
            "readUint16" => "writeUint16",
            "readInt16" => "writeInt16",
            "readUint32" => "writeUint32",
            "readInt32" => "writeInt32",
            "readBigUint64" => "writeBigUint64",
            "readBigInt64" => "writeBigInt64",
            "readFloat32" => "writeFloat32",
            _ => "writeInt32",
        }
    }

    fn alloc_local(&mut self, ty: TypeId) -> i64 {
        let size = self.type_sz(Some(ty));
        let align = self.types.align_of(ty).max(1);
        self.stack_offset = align_up(self.stack_offset, align);
        self.stack_offset += size;
        -(self.stack_offset as i64)
    }

    // ---- Lvalue addresses ----

    fn addr(&mut self, e: &Expr) -> String {
        match &e.kind {
            ExprKind::Ident(name) => {
                if let Some(v) = self
                    .locals
                    .get(name)
                    .or_else(|| self.globals.get(name))
                    .copied()
                {
                    if v.is_local {
                        return format!("(bp + ({}))", v.addr);
                    }
                    return v.addr.to_string();
                }
                let text = self.name(*name);
                match self.symtab.lookup(*name) {
                    Some(sym) if sym.kind == SymKind::Func => format!("__fp_{}", text),
                    _ => format!("0 /* unknown: {} */", text),
                }
            }
            ExprKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => self.expr(operand),
            ExprKind::Member { base, name, arrow } => {
                let base_str = if *arrow {
                    self.expr(base)
                } else {
                    self.addr(base)
                };
                let record = if *arrow {
                    base.ty.and_then(|t| self.types.base_of(t))
                } else {
                    base.ty
                };
                let offset = record
                    .and_then(|r| self.types.find_member(r, *name))
                    .map(|m| m.offset)
                    .unwrap_or(0);
                if offset > 0 {
                    format!("{} + {}", base_str, offset)
                } else {
                    base_str
                }
            }
            ExprKind::Index { base, index } => {
                let base_str = self.expr(base);
                let index_str = self.expr(index);
                let size = self.type_sz(e.ty);
                if size > 1 {
                    format!("({} + ({}) * {})", base_str, index_str, size)
                } else {
                    format!("({} + ({}))", base_str, index_str)
                }
            }
            _ => "0 /* cannot take addr */".to_string(),
        }
    }

    // ---- Expressions ----

    /// The expression as a plain JS number: doubles unwrap through
    /// `rt.f64`, 64-bit integers through `Number`.
    fn f64_val(&mut self, e: &Expr) -> String {
        if self.is_double(e.ty) {
            format!("rt.f64({})", self.expr(e))
        } else if self.is_u64(e.ty) {
            format!("Number({})", self.expr(e))
        } else {
            self.expr(e)
        }
    }

    fn string_literal(&mut self, bytes: &[u8]) -> String {
        let idx = self.str_count;
        self.str_count += 1;
        let mut escaped = String::new();
        for &b in bytes {
            match b {
                b'\\' => escaped.push_str("\\\\"),
                b'"' => escaped.push_str("\\\""),
                b'\n' => escaped.push_str("\\n"),
                b'\r' => escaped.push_str("\\r"),
                b'\t' => escaped.push_str("\\t"),
                0 => escaped.push_str("\\0"),
                0x20..=0x7e => escaped.push(b as char),
                _ => escaped.push_str(&format!("\\x{:02x}", b)),
            }
        }
        self.data
            .push(&format!("const __str{} = rt.mem.allocString(\"{}\");\n", idx, escaped));
        format!("__str{}", idx)
    }

    fn expr(&mut self, e: &Expr) -> String {
        match &e.kind {
            ExprKind::IntLit(v) => (*v as i64).to_string(),
            ExprKind::FloatLit(v) => {
                if e.ty == Some(types::FLOAT) {
                    format!("{:?}", v)
                } else {
                    format!("rt.f64bits({:?})", v)
                }
            }
            ExprKind::CharLit(c) => c.to_string(),
            ExprKind::StrLit(atom) => {
                let bytes = self.sess.interner.bytes(*atom).to_vec();
                self.string_literal(&bytes)
            }

            ExprKind::Ident(name) => {
                let v = self
                    .locals
                    .get(name)
                    .or_else(|| self.globals.get(name))
                    .copied();
                let Some(v) = v else {
                    let text = self.name(*name);
                    return match self.symtab.lookup(*name) {
                        Some(sym) if sym.kind == SymKind::Func => format!("__fp_{}", text),
                        Some(sym) if sym.kind == SymKind::EnumConst => sym.enum_val.to_string(),
                        Some(sym)
                            if sym.kind == SymKind::Var
                                && sym.storage == StorageClass::Extern =>
                        {
                            match text.as_str() {
                                "stdin" => "rt.stdin".to_string(),
                                "stdout" => "rt.stdout".to_string(),
                                "stderr" => "rt.stderr".to_string(),
                                _ => format!("0 /* extern: {} */", text),
                            }
                        }
                        _ => format!("0 /* undef: {} */", text),
                    };
                };
                if self.types.is_array(v.ty) || self.types.is_record(v.ty) {
                    return self.addr(e);
                }
                if self.types.is_func(v.ty) {
                    return format!("_{}", self.name(*name));
                }
                let getter = self.js_getter(Some(v.ty));
                let address = self.addr(e);
                format!("rt.mem.{}({})", getter, address)
            }

            ExprKind::Unary { op, operand } => self.unary(e, *op, operand),

            ExprKind::Binary { op, lhs, rhs } => self.binary(e, *op, lhs, rhs),

            ExprKind::Assign {
                op: None,
                target,
                value,
            } => {
                let lt = target.ty;
                if self.is_record(lt) {
                    let dest = self.addr(target);
                    let src = self.expr(value);
                    let dest2 = self.addr(target);
                    format!(
                        "(rt.memcpy({}, {}, {}), {})",
                        dest,
                        src,
                        self.type_sz(lt),
                        dest2
                    )
                } else {
                    let value_str = self.expr(value);
                    let setter = self.js_setter(lt);
                    let address = self.addr(target);
                    format!(
                        "((function(){{ var v = {}; rt.mem.{}({}, v); return v; }})())",
                        value_str, setter, address
                    )
                }
            }

            ExprKind::Assign {
                op: Some(op),
                target,
                value,
            } => {
                let lt = target.ty;
                let js = op.js();
                let address = self.addr(target);
                if self.is_double(lt) {
                    let rhs = self.f64_val(value);
                    format!(
                        "((function(){{ var a = {}; var v = rt.f64bits(rt.f64(rt.mem.readBigUint64(a)) {} {}); rt.mem.writeBigUint64(a, v); return v; }})())",
                        address, js, rhs
                    )
                } else {
                    let getter = self.js_getter(lt);
                    let setter = self.js_setter(lt);
                    let rhs = self.expr(value);
                    format!(
                        "((function(){{ var a = {}; var v = rt.mem.{}(a) {} ({}); rt.mem.{}(a, v); return v; }})())",
                        address, getter, js, rhs, setter
                    )
                }
            }

            ExprKind::Ternary {
                cond,
                then_branch,
                else_branch,
            } => {
                let res_double = self.is_double(e.ty);
                let cond_str = self.expr(cond);
                let then_str = self.coerce_branch(then_branch, res_double);
                let else_str = self.coerce_branch(else_branch, res_double);
                format!("({} ? {} : {})", cond_str, then_str, else_str)
            }

            ExprKind::Comma { lhs, rhs } => {
                let l = self.expr(lhs);
                let r = self.expr(rhs);
                format!("({}, {})", l, r)
            }

            ExprKind::Call { callee, args } => self.call(e, callee, args),

            ExprKind::Member { base, name, arrow } => {
                // A member whose declared type is an array stays in address
                // form even after the checker decayed the node's type.
                let record = if *arrow {
                    base.ty.and_then(|t| self.types.base_of(t))
                } else {
                    base.ty
                };
                let declared_array = record
                    .and_then(|r| self.types.find_member(r, *name))
                    .map(|m| self.types.is_array(m.ty))
                    .unwrap_or(false);
                if self.is_addr_kind(e.ty) || declared_array {
                    self.addr(e)
                } else {
                    let getter = self.js_getter(e.ty);
                    let address = self.addr(e);
                    format!("rt.mem.{}({})", getter, address)
                }
            }

            ExprKind::Index { .. } => {
                if self.is_addr_kind(e.ty) {
                    self.addr(e)
                } else {
                    let getter = self.js_getter(e.ty);
                    let address = self.addr(e);
                    format!("rt.mem.{}({})", getter, address)
                }
            }

            ExprKind::Cast { target, operand } => self.cast(*target, operand),

            ExprKind::CompoundLit { .. } => "0 /* compound_lit */".to_string(),

            ExprKind::SizeofExpr(operand) => self.type_sz(operand.ty).to_string(),
            ExprKind::SizeofType(ty) => self.type_sz(Some(*ty)).to_string(),
        }
    }

    fn unary(&mut self, e: &Expr, op: UnaryOp, operand: &Expr) -> String {
        match op {
            UnaryOp::Neg => {
                if self.is_double(e.ty) {
                    format!("rt.f64bits(-rt.f64({}))", self.expr(operand))
                } else {
                    format!("(-({}))", self.expr(operand))
                }
            }
            UnaryOp::Pos => format!("(+({}))", self.expr(operand)),
            UnaryOp::Not => format!("(({}) ? 0 : 1)", self.expr(operand)),
            UnaryOp::BitNot => format!("(~({}))", self.expr(operand)),
            UnaryOp::Deref => {
                if self.is_addr_kind(e.ty) {
                    self.expr(operand)
                } else {
                    let getter = self.js_getter(e.ty);
                    format!("rt.mem.{}({})", getter, self.expr(operand))
                }
            }
            UnaryOp::Addr => self.addr(operand),
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let js = if matches!(op, UnaryOp::PreInc | UnaryOp::PostInc) {
                    "+"
                } else {
                    "-"
                };
                let lt = operand.ty;
                let step = lt
                    .filter(|&t| self.types.is_ptr(t))
                    .and_then(|t| self.types.base_of(t))
                    .map(|b| self.type_sz(Some(b)))
                    .unwrap_or(1);
                let step_str = if self.is_u64(lt) {
                    format!("{}n", step)
                } else {
                    step.to_string()
                };
                let address = self.addr(operand);
                let pre = matches!(op, UnaryOp::PreInc | UnaryOp::PreDec);
                if self.is_double(lt) {
                    if pre {
                        format!(
                            "((function(){{ var a = {}; var v = rt.f64bits(rt.f64(rt.mem.readBigUint64(a)) {} {}); rt.mem.writeBigUint64(a, v); return v; }})())",
                            address, js, step
                        )
                    } else {
                        format!(
                            "((function(){{ var a = {}; var old = rt.mem.readBigUint64(a); rt.mem.writeBigUint64(a, rt.f64bits(rt.f64(old) {} {})); return old; }})())",
                            address, js, step
                        )
                    }
                } else {
                    let getter = self.js_getter(lt);
                    let setter = self.js_setter(lt);
                    if pre {
                        format!(
                            "((function(){{ var a = {}; var v = rt.mem.{}(a) {} {}; rt.mem.{}(a, v); return v; }})())",
                            address, getter, js, step_str, setter
                        )
                    } else {
                        format!(
                            "((function(){{ var a = {}; var old = rt.mem.{}(a); rt.mem.{}(a, old {} {}); return old; }})())",
                            address, getter, setter, js, step_str
                        )
                    }
                }
            }
        }
    }

    fn binary(&mut self, e: &Expr, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> String {
        if op.is_logical() {
            let l = self.expr(lhs);
            let r = self.expr(rhs);
            return format!("(({} {} {}) ? 1 : 0)", l, op.js(), r);
        }
        let js = op.js();

        // Float64 mode: either operand or the result is a double. Checked
        // before BigInt mode because double + long long is a double.
        let f64mode =
            self.is_double(lhs.ty) || self.is_double(rhs.ty) || self.is_double(e.ty);
        if f64mode {
            let l = self.f64_val(lhs);
            let r = self.f64_val(rhs);
            return if op.is_comparison() {
                format!("(({} {} {}) ? 1 : 0)", l, js, r)
            } else {
                format!("rt.f64bits({} {} {})", l, js, r)
            };
        }

        // BigInt mode: either side is long long.
        let u64mode = self.is_u64(lhs.ty) || self.is_u64(rhs.ty) || self.is_u64(e.ty);
        if u64mode {
            let l = if self.is_u64(lhs.ty) {
                self.expr(lhs)
            } else {
                format!("BigInt({})", self.expr(lhs))
            };
            let r = if self.is_u64(rhs.ty) {
                self.expr(rhs)
            } else {
                format!("BigInt({})", self.expr(rhs))
            };
            return if op.is_comparison() {
                format!("(({} {} {}) ? 1 : 0)", l, js, r)
            } else {
                format!("({} {} {})", l, js, r)
            };
        }

        let lp = lhs
            .ty
            .map(|t| self.types.is_ptr(t) || self.types.is_array(t))
            .unwrap_or(false);
        let rp = rhs
            .ty
            .map(|t| self.types.is_ptr(t) || self.types.is_array(t))
            .unwrap_or(false);

        if matches!(op, BinaryOp::Add | BinaryOp::Sub) && lp && !rp {
            let elem = lhs
                .ty
                .and_then(|t| self.types.base_of(t))
                .map(|b| self.type_sz(Some(b)))
                .unwrap_or(1);
            let l = self.expr(lhs);
            let r = self.expr(rhs);
            return if elem > 1 {
                format!("({} {} {} * {})", l, js, r, elem)
            } else {
                format!("({} {} {})", l, js, r)
            };
        }
        if op == BinaryOp::Add && rp && !lp {
            let elem = rhs
                .ty
                .and_then(|t| self.types.base_of(t))
                .map(|b| self.type_sz(Some(b)))
                .unwrap_or(1);
            let l = self.expr(lhs);
            let r = self.expr(rhs);
            return if elem > 1 {
                format!("({} * {} + {})", l, elem, r)
            } else {
                format!("({} + {})", l, r)
            };
        }
        if op == BinaryOp::Sub && lp && rp {
            let elem = lhs
                .ty
                .and_then(|t| self.types.base_of(t))
                .map(|b| self.type_sz(Some(b)))
                .unwrap_or(1);
            let l = self.expr(lhs);
            let r = self.expr(rhs);
            return if elem > 1 {
                format!("(({} - {}) / {} | 0)", l, r, elem)
            } else {
                format!("(({} - {}) | 0)", l, r)
            };
        }
        if op == BinaryOp::Div && e.ty.map(|t| self.types.is_integer(t)).unwrap_or(false) {
            let l = self.expr(lhs);
            let r = self.expr(rhs);
            return format!("(({} / {}) | 0)", l, r);
        }
        if op.is_comparison() {
            let l = self.expr(lhs);
            let r = self.expr(rhs);
            return format!("(({} {} {}) ? 1 : 0)", l, js, r);
        }
        let l = self.expr(lhs);
        let r = self.expr(rhs);
        format!("({} {} {})", l, js, r)
    }

    /// Coerce a ternary branch so the whole expression honors its type.
    fn coerce_branch(&mut self, branch: &Expr, res_double: bool) -> String {
        let branch_double = self.is_double(branch.ty);
        let branch_u64 = self.is_u64(branch.ty);
        if res_double && branch_u64 && !branch_double {
            format!("rt.f64bits(Number({}))", self.expr(branch))
        } else if res_double && !branch_double && !branch_u64 {
            format!("rt.f64bits({})", self.expr(branch))
        } else {
            self.expr(branch)
        }
    }

    fn call(&mut self, e: &Expr, callee: &Expr, args: &[Expr]) -> String {
        let fname = match &callee.kind {
            ExprKind::Ident(name) => Some(self.name(*name)),
            _ => None,
        };

        // Variadic bookkeeping builtins manipulate the hidden spread
        // parameter directly.
        if let Some(fname) = fname.as_deref() {
            match fname {
                "va_start" if !args.is_empty() => {
                    let address = self.addr(&args[0]);
                    return format!("rt.mem.writeUint32({}, rt.vaStart(p___va))", address);
                }
                "va_end" if !args.is_empty() => {
                    let address = self.addr(&args[0]);
                    return format!("rt.vaEnd(rt.mem.readUint32({}))", address);
                }
                "va_copy" if args.len() >= 2 => {
                    let dest = self.addr(&args[0]);
                    let src = self.addr(&args[1]);
                    return format!(
                        "rt.mem.writeUint32({}, rt.vaCopy(rt.mem.readUint32({})))",
                        dest, src
                    );
                }
                _ => {}
            }
        }

        // Direct when the name is not shadowed by a variable and resolves to
        // a function symbol; otherwise the call goes through the runtime
        // function table.
        let is_direct = match callee_atom(callee) {
            Some(atom) => {
                !(self.locals.contains_key(&atom) || self.globals.contains_key(&atom))
                    && self
                        .symtab
                        .lookup(atom)
                        .map(|sym| sym.kind == SymKind::Func)
                        .unwrap_or(false)
            }
            None => false,
        };

        let sret = self.is_record(e.ty);
        let sret_off = if sret {
            self.alloc_local(e.ty.unwrap_or(types::INT))
        } else {
            0
        };

        let is_math = is_direct
            && fname
                .as_deref()
                .map(|n| math_js_name(n).is_some())
                .unwrap_or(false);
        let is_runtime = is_direct
            && fname
                .as_deref()
                .map(|n| RUNTIME_FUNCS.contains(&n))
                .unwrap_or(false);
        let ret_f64 = !sret && self.is_double(e.ty);
        // Math/runtime functions speak plain JS numbers at the boundary.
        let wrap_ret = (is_math || is_runtime) && ret_f64;
        let unwrap_args = is_math || is_runtime;

        let mut arg_strs = Vec::new();
        if sret {
            arg_strs.push(format!("(bp + ({}))", sret_off));
        }
        for arg in args {
            if unwrap_args && self.is_double(arg.ty) {
                arg_strs.push(format!("rt.f64({})", self.expr(arg)));
            } else {
                arg_strs.push(self.expr(arg));
            }
        }
        let arg_list = arg_strs.join(", ");

        let mut call_str = if is_math {
            let js = fname
                .as_deref()
                .and_then(math_js_name)
                .unwrap_or("abs");
            format!("Math.{}({})", js, arg_list)
        } else if is_runtime {
            format!("rt.{}({})", fname.as_deref().unwrap_or(""), arg_list)
        } else if is_direct {
            format!("_{}({})", fname.as_deref().unwrap_or(""), arg_list)
        } else {
            let target = self.expr(callee);
            if arg_list.is_empty() {
                format!("rt.callFunction({})", target)
            } else {
                format!("rt.callFunction({}, {})", target, arg_list)
            }
        };

        if wrap_ret {
            call_str = format!("rt.f64bits({})", call_str);
        }
        if sret {
            call_str = format!("({}, (bp + ({})))", call_str, sret_off);
        }
        call_str
    }

    fn cast(&mut self, target: TypeId, operand: &Expr) -> String {
        let to_double = self.is_double(Some(target));
        let from_double = self.is_double(operand.ty);
        let to_u64 = self.is_u64(Some(target));
        let from_u64 = self.is_u64(operand.ty);
        let to_float32 = matches!(self.types.get(target).kind, TypeKind::Float);
        let to_int = self.types.is_integer(target) && self.types.size_of(target) <= 4;

        if to_double {
            if from_double {
                return self.expr(operand);
            }
            if from_u64 {
                return format!("rt.f64bits(Number({}))", self.expr(operand));
            }
            return format!("rt.f64bits({})", self.expr(operand));
        }
        if to_u64 {
            if from_double {
                return format!("BigInt(Math.trunc(rt.f64({})))", self.expr(operand));
            }
            return format!("BigInt({})", self.expr(operand));
        }
        if to_float32 && from_double {
            return format!("Math.fround(rt.f64({}))", self.expr(operand));
        }
        if to_float32 && from_u64 {
            return format!("Number({})", self.expr(operand));
        }
        if to_int {
            // Mask BigInts to 32 bits before Number() so values beyond 2^53
            // narrow without precision loss.
            let (pre, suf) = if from_double {
                ("rt.f64(", ")")
            } else if from_u64 {
                ("Number(", " & 0xFFFFFFFFn)")
            } else {
                ("", "")
            };
            let inner = self.expr(operand);
            let record = self.types.get(target);
            return match record.kind {
                TypeKind::Char if !record.is_unsigned => {
                    format!("(({}{}{}) << 24 >> 24)", pre, inner, suf)
                }
                TypeKind::Short if !record.is_unsigned => {
                    format!("(({}{}{}) << 16 >> 16)", pre, inner, suf)
                }
                TypeKind::Char => format!("(({}{}{}) & 0xFF)", pre, inner, suf),
                TypeKind::Short => format!("(({}{}{}) & 0xFFFF)", pre, inner, suf),
                _ if record.is_unsigned => format!("(({}{}{}) >>> 0)", pre, inner, suf),
                _ => format!("(({}{}{}) | 0)", pre, inner, suf),
            };
        }
        self.expr(operand)
    }

    // ---- Statements ----

    fn stmt(&mut self, s: &Stmt) {
        match &s.kind {
            StmtKind::Block(stmts) => {
                for inner in stmts {
                    self.stmt(inner);
                }
            }

            StmtKind::Decl(v) => self.local_decl(v),

            StmtKind::Expr(e) => {
                let text = self.expr(e);
                self.out.line(&format!("{};", text));
            }

            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond_str = self.expr(cond);
                self.out.line(&format!("if ({}) {{", cond_str));
                self.out.indent();
                self.stmt(then_branch);
                self.out.dedent();
                if let Some(els) = else_branch {
                    self.out.line("} else {");
                    self.out.indent();
                    self.stmt(els);
                    self.out.dedent();
                }
                self.out.line("}");
            }

            StmtKind::While { cond, body } => {
                let cond_str = self.expr(cond);
                self.out.line(&format!("while ({}) {{", cond_str));
                self.out.indent();
                self.stmt(body);
                self.out.dedent();
                self.out.line("}");
            }

            StmtKind::DoWhile { body, cond } => {
                self.out.line("do {");
                self.out.indent();
                self.stmt(body);
                self.out.dedent();
                let cond_str = self.expr(cond);
                self.out.line(&format!("}} while ({});", cond_str));
            }

            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                let init_str = match init.as_deref() {
                    Some(ForInit::Decl(vars)) => {
                        let mut parts = Vec::new();
                        for v in vars {
                            let off = self.alloc_local(v.ty);
                            self.locals.insert(
                                v.name,
                                CgVar {
                                    addr: off,
                                    is_local: true,
                                    ty: v.ty,
                                },
                            );
                            if let Some(Init::Expr(e)) = &v.init {
                                let setter = self.js_setter(Some(v.ty));
                                let value = self.expr(e);
                                parts.push(format!(
                                    "rt.mem.{}(bp + ({}), {})",
                                    setter, off, value
                                ));
                            }
                        }
                        parts.join(", ")
                    }
                    Some(ForInit::Expr(e)) => self.expr(e),
                    None => String::new(),
                };
                let cond_str = cond.as_ref().map(|c| self.expr(c)).unwrap_or_default();
                let step_str = step.as_ref().map(|i| self.expr(i)).unwrap_or_default();
                self.out
                    .line(&format!("for ({}; {}; {}) {{", init_str, cond_str, step_str));
                self.out.indent();
                self.stmt(body);
                self.out.dedent();
                self.out.line("}");
            }

            StmtKind::Switch { cond, body } => {
                let cond_str = self.expr(cond);
                self.out.line(&format!("switch ({}) {{", cond_str));
                self.out.indent();
                self.stmt(body);
                self.out.dedent();
                self.out.line("}");
            }

            StmtKind::Case { expr, body, .. } => {
                let value = self.expr(expr);
                self.out.dedent();
                self.out.line(&format!("case {}:", value));
                self.out.indent();
                self.stmt(body);
            }

            StmtKind::Default(body) => {
                self.out.dedent();
                self.out.line("default:");
                self.out.indent();
                self.stmt(body);
            }

            StmtKind::Break => self.out.line("break;"),
            StmtKind::Continue => self.out.line("continue;"),

            StmtKind::Return(value) => {
                let ret_record = self.is_record(self.current_ret);
                match value {
                    Some(e) if ret_record => {
                        let size = self.type_sz(self.current_ret);
                        let src = self.expr(e);
                        self.out
                            .line(&format!("rt.memcpy(p___retptr, {}, {});", src, size));
                        self.out.line("rt.mem.sp = saved_sp; return p___retptr;");
                    }
                    Some(e) => {
                        // Evaluate before restoring sp: the expression may
                        // reference addresses inside this frame.
                        let value_str = self.expr(e);
                        self.out.line(&format!(
                            "var __ret = {}; rt.mem.sp = saved_sp; return __ret;",
                            value_str
                        ));
                    }
                    None => {
                        self.out.line("rt.mem.sp = saved_sp; return;");
                    }
                }
            }

            StmtKind::Goto(name) => {
                let text = self.name(*name);
                self.sess
                    .warn_at(s.loc, format!("goto '{}' is not supported; ignored", text));
                self.out.line(&format!("/* goto {} */", text));
            }

            StmtKind::Label { name, stmt } => {
                let text = self.name(*name);
                self.out.line(&format!("/* label {}: */", text));
                self.stmt(stmt);
            }

            StmtKind::Empty => {}
        }
    }

    fn local_decl(&mut self, v: &VarDecl) {
        if v.storage == StorageClass::Static {
            // Static locals get a global slot and data-section initialization.
            let size = self.type_sz(Some(v.ty));
            let align = self.types.align_of(v.ty).max(1);
            self.global_offset = align_up(self.global_offset, align);
            let addr = self.global_offset as i64;
            self.globals.insert(
                v.name,
                CgVar {
                    addr,
                    is_local: false,
                    ty: v.ty,
                },
            );
            if let Some(init) = &v.init {
                self.global_init(addr, v.ty, init);
            }
            self.global_offset += size;
            return;
        }

        let off = self.alloc_local(v.ty);
        self.locals.insert(
            v.name,
            CgVar {
                addr: off,
                is_local: true,
                ty: v.ty,
            },
        );

        let Some(init) = &v.init else { return };
        let size = self.type_sz(Some(v.ty));

        // A string literal may sit under the implicit cast the checker added.
        let real_init = match init {
            Init::Expr(e) => match &e.kind {
                ExprKind::Cast { operand, .. } => Some(operand.as_ref()),
                _ => Some(e),
            },
            Init::List { .. } => None,
        };
        let is_char_array = self.types.is_array(v.ty)
            && self
                .types
                .base_of(v.ty)
                .map(|b| matches!(self.types.get(b).kind, TypeKind::Char))
                .unwrap_or(false);

        match init {
            Init::List { .. } => {
                self.out
                    .line(&format!("rt.memset(bp + ({}), 0, {});", off, size));
                self.init_value("bp", off, v.ty, init);
            }
            Init::Expr(e) => {
                if let Some(lit) = real_init.filter(|r| matches!(r.kind, ExprKind::StrLit(_))) {
                    if is_char_array {
                        let text = self.expr(lit);
                        self.out
                            .line(&format!("rt.memset(bp + ({}), 0, {});", off, size));
                        self.out.line(&format!("rt.strcpy(bp + ({}), {});", off, text));
                        return;
                    }
                }
                if self.is_record(Some(v.ty)) {
                    let src = self.expr(e);
                    self.out
                        .line(&format!("rt.memset(bp + ({}), 0, {});", off, size));
                    self.out
                        .line(&format!("rt.memcpy(bp + ({}), {}, {});", off, src, size));
                } else {
                    let setter = self.js_setter(Some(v.ty));
                    let value = self.expr(e);
                    self.out
                        .line(&format!("rt.mem.{}(bp + ({}), {});", setter, off, value));
                }
            }
        }
    }

    /// Lower an initializer into stores relative to `base_expr + offset`.
    fn init_value(&mut self, base_expr: &str, offset: i64, ty: TypeId, init: &Init) {
        match init {
            Init::List { items, .. } => match &self.types.get(ty).kind {
                TypeKind::Array { base, .. } | TypeKind::Vla { base, .. } => {
                    let elem = *base;
                    let elem_size = self.type_sz(Some(elem)) as i64;
                    let mut idx: i64 = 0;
                    for item in items {
                        if let Some(Designator::Index(n)) = &item.designator {
                            idx = *n;
                        }
                        let at = offset + idx * elem_size;
                        self.init_value(base_expr, at, elem, &item.init);
                        idx += 1;
                    }
                }
                TypeKind::Struct { .. } | TypeKind::Union { .. } => {
                    let members = self.types.members_of(ty);
                    let mut cursor = 0usize;
                    for item in items {
                        match &item.designator {
                            Some(Designator::Field(name)) => {
                                if let Some(pos) =
                                    members.iter().position(|m| m.name == Some(*name))
                                {
                                    let m = members[pos];
                                    self.init_value(
                                        base_expr,
                                        offset + m.offset as i64,
                                        m.ty,
                                        &item.init,
                                    );
                                    cursor = pos + 1;
                                }
                            }
                            _ => {
                                if let Some(m) = members.get(cursor).copied() {
                                    self.init_value(
                                        base_expr,
                                        offset + m.offset as i64,
                                        m.ty,
                                        &item.init,
                                    );
                                    cursor += 1;
                                }
                            }
                        }
                    }
                }
                _ => {
                    if let Some(item) = items.first() {
                        self.init_value(base_expr, offset, ty, &item.init);
                    }
                }
            },
            Init::Expr(e) => {
                if self.is_record(Some(ty)) {
                    let src = self.expr(e);
                    let size = self.type_sz(Some(ty));
                    self.out.line(&format!(
                        "rt.memcpy({} + ({}), {}, {});",
                        base_expr, offset, src, size
                    ));
                } else {
                    let setter = self.js_setter(Some(ty));
                    let value = self.expr(e);
                    self.out.line(&format!(
                        "rt.mem.{}({} + ({}), {});",
                        setter, base_expr, offset, value
                    ));
                }
            }
        }
    }

    // ---- Globals ----

    fn global_var(&mut self, v: &VarDecl) {
        let size = self.type_sz(Some(v.ty));
        let align = self.types.align_of(v.ty).max(1);
        self.global_offset = align_up(self.global_offset, align);
        let addr = self.global_offset as i64;
        self.globals.insert(
            v.name,
            CgVar {
                addr,
                is_local: false,
                ty: v.ty,
            },
        );
        if let Some(init) = &v.init {
            self.global_init(addr, v.ty, init);
        }
        self.global_offset += size;
    }

    /// Initialization code for a global goes to the data section, after any
    /// string-literal declarations it references.
    fn global_init(&mut self, addr: i64, ty: TypeId, init: &Init) {
        let saved = std::mem::take(&mut self.out);

        let real_init = match init {
            Init::Expr(e) => match &e.kind {
                ExprKind::Cast { operand, .. } => Some(operand.as_ref()),
                _ => Some(e),
            },
            Init::List { .. } => None,
        };
        let is_char_array = self.types.is_array(ty)
            && self
                .types
                .base_of(ty)
                .map(|b| matches!(self.types.get(b).kind, TypeKind::Char))
                .unwrap_or(false);

        match init {
            Init::List { .. } => self.init_value("0", addr, ty, init),
            Init::Expr(e) => {
                if let Some(lit) = real_init.filter(|r| matches!(r.kind, ExprKind::StrLit(_))) {
                    if is_char_array {
                        let text = self.expr(lit);
                        self.out.line(&format!("rt.strcpy({}, {});", addr, text));
                        let code = self.out.detach();
                        self.out = saved;
                        self.data.push(&code);
                        return;
                    }
                }
                if self.is_record(Some(ty)) {
                    let src = self.expr(e);
                    let size = self.type_sz(Some(ty));
                    self.out
                        .line(&format!("rt.memcpy({}, {}, {});", addr, src, size));
                } else {
                    let setter = self.js_setter(Some(ty));
                    let value = self.expr(e);
                    self.out
                        .line(&format!("rt.mem.{}({}, {});", setter, addr, value));
                }
            }
        }

        let code = self.out.detach();
        self.out = saved;
        self.data.push(&code);
    }

    // ---- Functions ----

    fn func(&mut self, f: &FuncDef) -> String {
        self.stack_offset = 0;
        self.locals.clear();
        self.current_ret = self.types.return_type_of(f.ty);

        let fname = self.name(f.name);
        let sret = self.is_record(self.current_ret);
        let params = self.types.params_of(f.ty);
        let variadic = self.types.is_variadic(f.ty);

        let mut sig_parts = Vec::new();
        if sret {
            sig_parts.push("p___retptr".to_string());
        }
        for (i, p) in params.iter().enumerate() {
            let pname = p
                .name
                .map(|a| self.name(a))
                .unwrap_or_else(|| format!("arg{}", i));
            sig_parts.push(format!("p_{}", pname));
        }
        if variadic {
            sig_parts.push("...p___va".to_string());
        }

        // Parameter stores and the body go to side buffers first; the frame
        // size is only known after the body has been generated.
        let saved = std::mem::take(&mut self.out);
        self.out.indent();
        for p in &params {
            let Some(pname_atom) = p.name else { continue };
            let pname = self.name(pname_atom);
            let off = self.alloc_local(p.ty);
            self.locals.insert(
                pname_atom,
                CgVar {
                    addr: off,
                    is_local: true,
                    ty: p.ty,
                },
            );
            if self.is_record(Some(p.ty)) {
                // Aggregate params arrive by address; copy into the frame.
                let size = self.type_sz(Some(p.ty));
                self.out
                    .line(&format!("rt.memcpy(bp + ({}), p_{}, {});", off, pname, size));
            } else {
                let setter = self.js_setter(Some(p.ty));
                self.out
                    .line(&format!("rt.mem.{}(bp + ({}), p_{});", setter, off, pname));
            }
        }
        let param_stores = self.out.detach();

        self.out.indent();
        self.stmt(&f.body);
        if fname == "main" {
            self.out.line("rt.mem.sp = saved_sp; return 0;");
        } else {
            self.out.line("rt.mem.sp = saved_sp;");
        }
        let body = self.out.detach();
        self.out = saved;

        let frame = align_up(self.stack_offset, 16);
        let mut text = String::new();
        text.push_str(&format!("function _{}({}) {{\n", fname, sig_parts.join(", ")));
        text.push_str("  const saved_sp = rt.mem.sp;\n");
        text.push_str("  const bp = rt.mem.sp;\n");
        text.push_str(&param_stores);
        text.push_str(&format!("  rt.mem.sp -= {};  /* frame */\n", frame));
        text.push_str(&body);
        text.push_str("}\n\n");
        text
    }

    // ---- Program ----

    fn emit_program(mut self, program: &Program) -> String {
        // Globals first so functions see their addresses.
        for decl in &program.decls {
            if let Decl::Var(v) = decl {
                self.global_var(v);
            }
        }

        let mut funcs = String::new();
        for decl in &program.decls {
            if let Decl::Func(f) = decl {
                funcs.push_str(&self.func(f));
            }
        }

        let mut out = String::new();
        out.push_str("\"use strict\";\n");
        out.push_str("const { Runtime } = require(\"./runtime/runtime.js\");\n");
        out.push_str("const rt = new Runtime(16 * 1024 * 1024);\n\n");

        // reserveGlobals comes first so heap allocations (allocString) land
        // past the global region.
        out.push_str("// === Data ===\n");
        out.push_str(&format!("rt.mem.reserveGlobals({});\n", self.global_offset));

        out.push_str("\n// === Functions ===\n");
        out.push_str(&funcs);

        // Function-pointer ids are registered before global data because
        // initializers may reference __fp_ constants.
        let mut has_fp = false;
        for decl in &program.decls {
            if let Decl::Func(f) = decl {
                if !has_fp {
                    out.push_str("// === Function Pointers ===\n");
                    has_fp = true;
                }
                let fname = self.name(f.name);
                out.push_str(&format!(
                    "const __fp_{} = rt.registerFunction(_{});\n",
                    fname, fname
                ));
            }
        }
        if has_fp {
            out.push('\n');
        }

        out.push_str("// === Global Data ===\n");
        out.push_str(self.data.as_str());

        let main = program.decls.iter().find_map(|d| match d {
            Decl::Func(f) if self.sess.interner.str(f.name) == "main" => Some(f),
            _ => None,
        });
        let main_has_args = main
            .map(|f| !self.types.params_of(f.ty).is_empty())
            .unwrap_or(false);

        out.push_str("// === Entry ===\n");
        if main_has_args {
            out.push_str("const __argv_ptrs = [];\n");
            out.push_str("const __argv_strs = process.argv.slice(1);\n");
            out.push_str(
                "for (let i = 0; i < __argv_strs.length; i++) __argv_ptrs.push(rt.mem.allocString(__argv_strs[i]));\n",
            );
            out.push_str("const __argv = rt.malloc((__argv_ptrs.length + 1) * 4);\n");
            out.push_str(
                "for (let i = 0; i < __argv_ptrs.length; i++) rt.mem.writeUint32(__argv + i * 4, __argv_ptrs[i]);\n",
            );
            out.push_str("rt.mem.writeUint32(__argv + __argv_ptrs.length * 4, 0);\n");
            out.push_str("try {\n  process.exit(_main(__argv_ptrs.length, __argv) | 0);\n");
        } else {
            out.push_str("try {\n  process.exit(_main() | 0);\n");
        }
        out.push_str("} catch (e) {\n");
        out.push_str("  if (e.name === 'ExitException') process.exit(e.code);\n");
        out.push_str("  throw e;\n}\n");
        out
    }
}

fn callee_atom(callee: &Expr) -> Option<Atom> {
    match &callee.kind {
        ExprKind::Ident(name) => Some(*name),
        _ => None,
    }
}
