use bitflags::bitflags;

use crate::compiler::ast::{
    BinaryOp, Decl, Designator, Expr, ExprKind, ForInit, FuncDef, Init, InitItem, Program, Stmt,
    StmtKind, UnaryOp, VarDecl,
};
use crate::compiler::diagnostics::SrcLoc;
use crate::compiler::intern::Atom;
use crate::compiler::scanner::{Scanner, Token, TokenFlags, TokenKind};
use crate::compiler::session::Session;
use crate::compiler::symtab::{SymKind, SymbolTable};
use crate::compiler::types::{self, Member, Param, Quals, StorageClass, TypeId, TypeTable};

/// Marker for a parse failure whose diagnostic has already been reported.
/// Recovery happens at statement and declaration boundaries.
#[derive(Debug, Clone, Copy)]
pub struct ParseError;

pub type PResult<T> = Result<T, ParseError>;

bitflags! {
    /// Accumulated basic type specifiers.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    struct SpecFlags: u16 {
        const VOID = 1 << 0;
        const BOOL = 1 << 1;
        const CHAR = 1 << 2;
        const SHORT = 1 << 3;
        const INT = 1 << 4;
        const LONG = 1 << 5;
        const LLONG = 1 << 6;
        const FLOAT = 1 << 7;
        const DOUBLE = 1 << 8;
        const SIGNED = 1 << 9;
        const UNSIGNED = 1 << 10;
        const COMPLEX = 1 << 11;
        const OTHER = 1 << 12;
    }
}

fn is_storage_class(kind: TokenKind) -> bool {
    matches!(
        kind,
        TokenKind::KwTypedef
            | TokenKind::KwExtern
            | TokenKind::KwStatic
            | TokenKind::KwAuto
            | TokenKind::KwRegister
    )
}

fn precedence(kind: TokenKind) -> i32 {
    match kind {
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => 13,
        TokenKind::Plus | TokenKind::Minus => 12,
        TokenKind::Shl | TokenKind::Shr => 11,
        TokenKind::Lt | TokenKind::Le | TokenKind::Gt | TokenKind::Ge => 10,
        TokenKind::EqEq | TokenKind::Ne => 9,
        TokenKind::Amp => 8,
        TokenKind::Caret => 7,
        TokenKind::Pipe => 6,
        TokenKind::AmpAmp => 5,
        TokenKind::PipePipe => 4,
        _ => -1,
    }
}

fn binop_kind(kind: TokenKind) -> BinaryOp {
    match kind {
        TokenKind::Star => BinaryOp::Mul,
        TokenKind::Slash => BinaryOp::Div,
        TokenKind::Percent => BinaryOp::Mod,
        TokenKind::Plus => BinaryOp::Add,
        TokenKind::Minus => BinaryOp::Sub,
        TokenKind::Shl => BinaryOp::Shl,
        TokenKind::Shr => BinaryOp::Shr,
        TokenKind::Lt => BinaryOp::Lt,
        TokenKind::Le => BinaryOp::Le,
        TokenKind::Gt => BinaryOp::Gt,
        TokenKind::Ge => BinaryOp::Ge,
        TokenKind::EqEq => BinaryOp::Eq,
        TokenKind::Ne => BinaryOp::Ne,
        TokenKind::Amp => BinaryOp::BitAnd,
        TokenKind::Pipe => BinaryOp::BitOr,
        TokenKind::Caret => BinaryOp::BitXor,
        TokenKind::AmpAmp => BinaryOp::LogAnd,
        TokenKind::PipePipe => BinaryOp::LogOr,
        _ => BinaryOp::Add,
    }
}

fn assign_op(kind: TokenKind) -> Option<Option<BinaryOp>> {
    match kind {
        TokenKind::Assign => Some(None),
        TokenKind::PlusAssign => Some(Some(BinaryOp::Add)),
        TokenKind::MinusAssign => Some(Some(BinaryOp::Sub)),
        TokenKind::StarAssign => Some(Some(BinaryOp::Mul)),
        TokenKind::SlashAssign => Some(Some(BinaryOp::Div)),
        TokenKind::PercentAssign => Some(Some(BinaryOp::Mod)),
        TokenKind::ShlAssign => Some(Some(BinaryOp::Shl)),
        TokenKind::ShrAssign => Some(Some(BinaryOp::Shr)),
        TokenKind::AmpAssign => Some(Some(BinaryOp::BitAnd)),
        TokenKind::PipeAssign => Some(Some(BinaryOp::BitOr)),
        TokenKind::CaretAssign => Some(Some(BinaryOp::BitXor)),
        _ => None,
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    let align = align.max(1);
    (value + align - 1) & !(align - 1)
}

/// Try to evaluate an expression as a compile-time 64-bit signed integer.
/// Used for array sizes, enum initializers, case labels, bitfield widths and
/// designator indices.
pub fn const_eval(expr: &Expr) -> Option<i64> {
    match &expr.kind {
        ExprKind::IntLit(v) => Some(*v as i64),
        ExprKind::CharLit(c) => Some(*c as i64),
        ExprKind::Unary { op, operand } => {
            let v = const_eval(operand)?;
            match op {
                UnaryOp::Neg => Some(v.wrapping_neg()),
                UnaryOp::Pos => Some(v),
                UnaryOp::Not => Some((v == 0) as i64),
                UnaryOp::BitNot => Some(!v),
                _ => None,
            }
        }
        ExprKind::Binary { op, lhs, rhs } => {
            let l = const_eval(lhs)?;
            let r = const_eval(rhs)?;
            match op {
                BinaryOp::Add => Some(l.wrapping_add(r)),
                BinaryOp::Sub => Some(l.wrapping_sub(r)),
                BinaryOp::Mul => Some(l.wrapping_mul(r)),
                BinaryOp::Div => (r != 0).then(|| l.wrapping_div(r)),
                BinaryOp::Mod => (r != 0).then(|| l.wrapping_rem(r)),
                BinaryOp::Shl => Some(l.wrapping_shl((r & 63) as u32)),
                BinaryOp::Shr => Some(l.wrapping_shr((r & 63) as u32)),
                BinaryOp::Lt => Some((l < r) as i64),
                BinaryOp::Le => Some((l <= r) as i64),
                BinaryOp::Gt => Some((l > r) as i64),
                BinaryOp::Ge => Some((l >= r) as i64),
                BinaryOp::Eq => Some((l == r) as i64),
                BinaryOp::Ne => Some((l != r) as i64),
                BinaryOp::BitAnd => Some(l & r),
                BinaryOp::BitOr => Some(l | r),
                BinaryOp::BitXor => Some(l ^ r),
                BinaryOp::LogAnd => Some((l != 0 && r != 0) as i64),
                BinaryOp::LogOr => Some((l != 0 || r != 0) as i64),
            }
        }
        ExprKind::Ternary {
            cond,
            then_branch,
            else_branch,
        } => {
            let c = const_eval(cond)?;
            let t = const_eval(then_branch)?;
            let e = const_eval(else_branch)?;
            Some(if c != 0 { t } else { e })
        }
        ExprKind::Cast { operand, .. } => const_eval(operand),
        _ => None,
    }
}

/// Recursive-descent parser over the preprocessed token stream. Resolves
/// typedef names against the symbol table while parsing and assigns tentative
/// types where they are obvious; the checker completes the rest.
pub struct Parser<'a> {
    scanner: Scanner<'a>,
    sess: &'a mut Session,
    types: &'a mut TypeTable,
    symtab: &'a mut SymbolTable,
    loop_depth: u32,
    switch_depth: u32,
}

impl<'a> Parser<'a> {
    pub fn new(
        src: &'a str,
        file: Atom,
        sess: &'a mut Session,
        types: &'a mut TypeTable,
        symtab: &'a mut SymbolTable,
    ) -> Self {
        let mut parser = Parser {
            scanner: Scanner::new(src, file),
            sess,
            types,
            symtab,
            loop_depth: 0,
            switch_depth: 0,
        };
        parser.bump(); // prime the first token
        parser
    }

    fn tok(&self) -> Token {
        self.scanner.cur
    }

    fn kind(&self) -> TokenKind {
        self.scanner.cur.kind
    }

    fn loc(&self) -> SrcLoc {
        self.scanner.cur.loc
    }

    fn bump(&mut self) {
        self.scanner.next(&mut *self.sess);
    }

    fn peek(&mut self) -> Token {
        self.scanner.peek(&mut *self.sess)
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        self.scanner.eat(&mut *self.sess, kind)
    }

    fn expect(&mut self, kind: TokenKind) -> PResult<()> {
        if self.kind() != kind {
            let msg = format!("expected '{}', got '{}'", kind, self.kind());
            let loc = self.loc();
            self.sess.error_at(loc, msg);
            return Err(ParseError);
        }
        self.bump();
        Ok(())
    }

    fn error_here(&mut self, msg: impl AsRef<str>) -> ParseError {
        let loc = self.loc();
        self.sess.error_at(loc, msg);
        ParseError
    }

    /// Skip forward to the next statement boundary: just past a `;`, or in
    /// front of a `}`.
    fn synchronize(&mut self) {
        loop {
            match self.kind() {
                TokenKind::Eof | TokenKind::RBrace => return,
                TokenKind::Semicolon => {
                    self.bump();
                    return;
                }
                _ => self.bump(),
            }
        }
    }

    // ---- Type parsing ----

    fn is_type_spec_qual(&self) -> bool {
        let tok = self.tok();
        if tok.kind.is_type_keyword() {
            return true;
        }
        tok.kind == TokenKind::Ident
            && tok.text.map(|a| self.symtab.is_typedef(a)).unwrap_or(false)
    }

    fn is_type_name(&self) -> bool {
        is_storage_class(self.kind()) || self.is_type_spec_qual()
    }

    /// Parse declaration specifiers: storage class, qualifiers, and basic
    /// type specifiers accumulated as flags, resolved at the end.
    fn parse_decl_specifiers(&mut self, want_storage: bool) -> PResult<(TypeId, StorageClass)> {
        let mut storage = StorageClass::None;
        let mut flags = SpecFlags::empty();
        let mut quals = Quals::empty();
        let mut is_inline = false;
        let mut custom: Option<TypeId> = None;

        loop {
            let kind = self.kind();

            if is_storage_class(kind) {
                if !want_storage {
                    break;
                }
                storage = match kind {
                    TokenKind::KwTypedef => StorageClass::Typedef,
                    TokenKind::KwExtern => StorageClass::Extern,
                    TokenKind::KwStatic => StorageClass::Static,
                    TokenKind::KwAuto => StorageClass::Auto,
                    _ => StorageClass::Register,
                };
                self.bump();
                continue;
            }

            match kind {
                TokenKind::KwConst => {
                    quals |= Quals::CONST;
                    self.bump();
                    continue;
                }
                TokenKind::KwVolatile => {
                    quals |= Quals::VOLATILE;
                    self.bump();
                    continue;
                }
                TokenKind::KwRestrict => {
                    quals |= Quals::RESTRICT;
                    self.bump();
                    continue;
                }
                TokenKind::KwInline => {
                    is_inline = true;
                    self.bump();
                    continue;
                }
                TokenKind::KwVoid => {
                    flags |= SpecFlags::VOID;
                    self.bump();
                    continue;
                }
                TokenKind::KwBool => {
                    flags |= SpecFlags::BOOL;
                    self.bump();
                    continue;
                }
                TokenKind::KwChar => {
                    flags |= SpecFlags::CHAR;
                    self.bump();
                    continue;
                }
                TokenKind::KwShort => {
                    flags |= SpecFlags::SHORT;
                    self.bump();
                    continue;
                }
                TokenKind::KwInt => {
                    flags |= SpecFlags::INT;
                    self.bump();
                    continue;
                }
                TokenKind::KwFloat => {
                    flags |= SpecFlags::FLOAT;
                    self.bump();
                    continue;
                }
                TokenKind::KwDouble => {
                    flags |= SpecFlags::DOUBLE;
                    self.bump();
                    continue;
                }
                TokenKind::KwSigned => {
                    flags |= SpecFlags::SIGNED;
                    self.bump();
                    continue;
                }
                TokenKind::KwUnsigned => {
                    flags |= SpecFlags::UNSIGNED;
                    self.bump();
                    continue;
                }
                TokenKind::KwComplex | TokenKind::KwImaginary => {
                    flags |= SpecFlags::COMPLEX;
                    self.bump();
                    continue;
                }
                TokenKind::KwLong => {
                    if flags.contains(SpecFlags::LONG) {
                        flags.remove(SpecFlags::LONG);
                        flags |= SpecFlags::LLONG;
                    } else {
                        flags |= SpecFlags::LONG;
                    }
                    self.bump();
                    continue;
                }
                TokenKind::KwStruct | TokenKind::KwUnion => {
                    let ty = self.parse_record_specifier(kind == TokenKind::KwStruct)?;
                    custom = Some(ty);
                    flags |= SpecFlags::OTHER;
                    continue;
                }
                TokenKind::KwEnum => {
                    let ty = self.parse_enum_specifier()?;
                    custom = Some(ty);
                    flags |= SpecFlags::OTHER;
                    continue;
                }
                TokenKind::Ident => {
                    let only_sign = flags & !(SpecFlags::SIGNED | SpecFlags::UNSIGNED)
                        == SpecFlags::empty();
                    let name = self.tok().text;
                    if only_sign
                        && name.map(|a| self.symtab.is_typedef(a)).unwrap_or(false)
                    {
                        let atom = name.unwrap_or(Atom(0));
                        if let Some(sym) = self.symtab.lookup(atom) {
                            custom = Some(sym.ty);
                        }
                        flags |= SpecFlags::OTHER;
                        self.bump();
                        continue;
                    }
                    break;
                }
                _ => break,
            }
        }

        let mut result = if flags.contains(SpecFlags::OTHER) {
            custom.unwrap_or(types::INT)
        } else if flags.is_empty()
            || flags == SpecFlags::SIGNED
            || flags == SpecFlags::INT
            || flags == SpecFlags::SIGNED | SpecFlags::INT
        {
            types::INT
        } else if flags.contains(SpecFlags::VOID) {
            types::VOID
        } else if flags.contains(SpecFlags::BOOL) {
            types::BOOL
        } else if flags.contains(SpecFlags::FLOAT) {
            if flags.contains(SpecFlags::COMPLEX) {
                self.types.complex(types::FLOAT)
            } else {
                types::FLOAT
            }
        } else if flags.contains(SpecFlags::DOUBLE) {
            let base = if flags.contains(SpecFlags::LONG) {
                types::LDOUBLE
            } else {
                types::DOUBLE
            };
            if flags.contains(SpecFlags::COMPLEX) {
                self.types.complex(base)
            } else {
                base
            }
        } else if flags.contains(SpecFlags::CHAR) {
            if flags.contains(SpecFlags::UNSIGNED) {
                types::UCHAR
            } else {
                types::CHAR
            }
        } else if flags.contains(SpecFlags::SHORT) {
            if flags.contains(SpecFlags::UNSIGNED) {
                types::USHORT
            } else {
                types::SHORT
            }
        } else if flags.contains(SpecFlags::LLONG) {
            if flags.contains(SpecFlags::UNSIGNED) {
                types::ULLONG
            } else {
                types::LLONG
            }
        } else if flags.contains(SpecFlags::LONG) {
            if flags.contains(SpecFlags::UNSIGNED) {
                types::ULONG
            } else {
                types::LONG
            }
        } else if flags.contains(SpecFlags::UNSIGNED) {
            types::UINT
        } else {
            types::INT
        };

        if !quals.is_empty() {
            result = self.types.qualified(result, quals);
        }
        if is_inline {
            result = self.types.set_inline(result);
        }

        Ok((result, storage))
    }

    /// Struct/union specifier. A braced body completes the tag's type in
    /// place so earlier forward references resolve to the same object.
    fn parse_record_specifier(&mut self, is_struct: bool) -> PResult<TypeId> {
        let tag_loc = self.loc();
        self.bump(); // struct/union keyword

        let mut tag = None;
        if self.kind() == TokenKind::Ident {
            tag = self.tok().text;
            self.bump();
        }

        if self.kind() != TokenKind::LBrace {
            // Forward reference or use of an existing tag.
            let Some(tag) = tag else {
                self.sess
                    .error_at(tag_loc, "expected struct/union tag or definition");
                return Ok(if is_struct {
                    self.types.struct_type(None)
                } else {
                    self.types.union_type(None)
                });
            };
            if let Some(existing) = self.symtab.lookup_tag(tag) {
                return Ok(existing);
            }
            let ty = if is_struct {
                self.types.struct_type(Some(tag))
            } else {
                self.types.union_type(Some(tag))
            };
            self.symtab.define_tag(tag, ty);
            return Ok(ty);
        }
        self.bump(); // {

        let ty = match tag {
            Some(tag) => match self.symtab.lookup_tag_current(tag) {
                Some(existing) => existing,
                None => {
                    let ty = if is_struct {
                        self.types.struct_type(Some(tag))
                    } else {
                        self.types.union_type(Some(tag))
                    };
                    self.symtab.define_tag(tag, ty);
                    ty
                }
            },
            None => {
                if is_struct {
                    self.types.struct_type(None)
                } else {
                    self.types.union_type(None)
                }
            }
        };

        let mut members: Vec<Member> = Vec::new();
        let mut offset: u32 = 0;
        let mut max_align: u32 = 1;
        let mut index: u32 = 0;

        while self.kind() != TokenKind::RBrace && self.kind() != TokenKind::Eof {
            let (mbase, _) = self.parse_decl_specifiers(false)?;
            loop {
                let mut mname = None;
                let mtype;
                if self.kind() == TokenKind::Colon || self.kind() == TokenKind::Semicolon {
                    // Anonymous bitfield or anonymous struct/union member.
                    mtype = mbase;
                } else {
                    let (name, ty) = self.parse_declarator(mbase)?;
                    mname = name;
                    mtype = ty;
                }

                let mut bit_width = None;
                if self.eat(TokenKind::Colon) {
                    let width_expr = self.parse_cond_expr()?;
                    bit_width = Some(const_eval(&width_expr).unwrap_or(1).max(0) as u32);
                }

                let size = self.types.size_of(mtype);
                let align = self.types.align_of(mtype);
                max_align = max_align.max(align);

                let member_offset;
                if is_struct {
                    offset = align_up(offset, align);
                    member_offset = offset;
                    if bit_width.is_none() {
                        offset += size;
                    }
                } else {
                    member_offset = 0;
                    offset = offset.max(size);
                }

                members.push(Member {
                    name: mname,
                    ty: mtype,
                    offset: member_offset,
                    bit_width,
                    index,
                });
                index += 1;

                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::Semicolon)?;
        }
        self.expect(TokenKind::RBrace)?;

        // Flatten anonymous struct/union members into the parent, patching
        // offsets, until no anonymous aggregates remain.
        loop {
            let mut changed = false;
            let mut flat: Vec<Member> = Vec::new();
            for m in &members {
                if m.name.is_none() && self.types.is_record(m.ty) {
                    changed = true;
                    for sub in self.types.members_of(m.ty) {
                        let mut copy = sub;
                        copy.offset += m.offset;
                        flat.push(copy);
                    }
                } else {
                    flat.push(*m);
                }
            }
            members = flat;
            if !changed {
                break;
            }
        }

        let total = align_up(offset, max_align);
        self.types.complete_record(ty, members, total, max_align);
        Ok(ty)
    }

    fn parse_enum_specifier(&mut self) -> PResult<TypeId> {
        let tag_loc = self.loc();
        self.bump(); // enum keyword

        let mut tag = None;
        if self.kind() == TokenKind::Ident {
            tag = self.tok().text;
            self.bump();
        }

        if self.kind() != TokenKind::LBrace {
            let Some(tag) = tag else {
                self.sess.error_at(tag_loc, "expected enum tag or definition");
                return Ok(self.types.enum_type(None));
            };
            if let Some(existing) = self.symtab.lookup_tag(tag) {
                return Ok(existing);
            }
            let ty = self.types.enum_type(Some(tag));
            self.symtab.define_tag(tag, ty);
            return Ok(ty);
        }
        self.bump(); // {

        let ty = self.types.enum_type(tag);
        if let Some(tag) = tag {
            self.symtab.define_tag(tag, ty);
        }

        let mut value: i64 = 0;
        while self.kind() != TokenKind::RBrace && self.kind() != TokenKind::Eof {
            if self.kind() != TokenKind::Ident {
                self.error_here("expected identifier in enum");
                break;
            }
            let name = self.tok().text.unwrap_or(Atom(0));
            let name_loc = self.loc();
            self.bump();
            if self.eat(TokenKind::Assign) {
                let init = self.parse_cond_expr()?;
                if let Some(v) = const_eval(&init) {
                    value = v;
                }
            }
            let sym = self
                .symtab
                .define(&mut *self.sess, name, SymKind::EnumConst, types::INT, name_loc);
            sym.enum_val = value;
            value += 1;
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(ty)
    }

    /// Parse a declarator: pointer runs, an optional grouped inner
    /// declarator, the name, and array/function suffixes.
    fn parse_declarator(&mut self, mut base: TypeId) -> PResult<(Option<Atom>, TypeId)> {
        while self.kind() == TokenKind::Star {
            self.bump();
            let mut quals = Quals::empty();
            loop {
                match self.kind() {
                    TokenKind::KwConst => quals |= Quals::CONST,
                    TokenKind::KwVolatile => quals |= Quals::VOLATILE,
                    TokenKind::KwRestrict => quals |= Quals::RESTRICT,
                    _ => break,
                }
                self.bump();
            }
            base = self.types.ptr(base);
            if !quals.is_empty() {
                self.types.set_quals(base, quals);
            }
        }

        // Grouped declarator like (*f)(...): parse the inner declarator
        // against a placeholder, then graft the suffixed type into it.
        let mut grouped: Option<(TypeId, Option<Atom>, TypeId)> = None;
        if self.kind() == TokenKind::LParen && !self.is_type_spec_qual() {
            let peeked = self.peek();
            let is_grouped = peeked.kind == TokenKind::Star
                || peeked.kind == TokenKind::LParen
                || (peeked.kind == TokenKind::Ident
                    && !peeked
                        .text
                        .map(|a| self.symtab.is_typedef(a))
                        .unwrap_or(false));
            if is_grouped {
                self.bump(); // (
                let placeholder = self.types.placeholder();
                let (name, inner) = self.parse_declarator(placeholder)?;
                self.expect(TokenKind::RParen)?;
                grouped = Some((placeholder, name, inner));
            }
        }

        let mut name = None;
        if grouped.is_none() && self.kind() == TokenKind::Ident {
            name = self.tok().text;
            self.bump();
        }

        // Array and function suffixes.
        loop {
            if self.kind() == TokenKind::LBracket {
                self.bump();
                if self.kind() == TokenKind::RBracket {
                    self.bump();
                    base = self.types.array(base, None);
                } else if self.kind() == TokenKind::Star
                    && self.peek().kind == TokenKind::RBracket
                {
                    self.bump();
                    self.bump();
                    base = self.types.vla(base, None);
                } else {
                    // static and qualifiers inside array declarators are
                    // accepted and ignored (C99 parameter syntax).
                    while matches!(
                        self.kind(),
                        TokenKind::KwStatic
                            | TokenKind::KwConst
                            | TokenKind::KwVolatile
                            | TokenKind::KwRestrict
                    ) {
                        self.bump();
                    }
                    if self.kind() == TokenKind::RBracket {
                        self.bump();
                        base = self.types.array(base, None);
                    } else {
                        let size = self.parse_assign_expr()?;
                        self.expect(TokenKind::RBracket)?;
                        match const_eval(&size) {
                            Some(n) => {
                                base = self.types.array(base, Some(n.max(0) as u32));
                            }
                            None => {
                                base = self.types.vla(base, Some(Box::new(size)));
                            }
                        }
                    }
                }
            } else if self.kind() == TokenKind::LParen {
                self.bump();
                let mut params: Vec<Param> = Vec::new();
                let mut variadic = false;
                let mut old_style = false;

                if self.kind() == TokenKind::RParen {
                    old_style = true;
                    self.bump();
                } else if self.kind() == TokenKind::KwVoid
                    && self.peek().kind == TokenKind::RParen
                {
                    self.bump();
                    self.bump();
                } else {
                    loop {
                        if self.kind() == TokenKind::Ellipsis {
                            variadic = true;
                            self.bump();
                            break;
                        }
                        let (pbase, _) = self.parse_decl_specifiers(false)?;
                        let (pname, mut ptype) = if self.kind() == TokenKind::Comma
                            || self.kind() == TokenKind::RParen
                        {
                            (None, pbase)
                        } else {
                            self.parse_declarator(pbase)?
                        };
                        // Parameters decay: arrays and functions to pointers.
                        if self.types.is_array(ptype) {
                            let elem = self.types.base_of(ptype).unwrap_or(types::INT);
                            ptype = self.types.ptr(elem);
                        }
                        if self.types.is_func(ptype) {
                            ptype = self.types.ptr(ptype);
                        }
                        params.push(Param {
                            name: pname,
                            ty: ptype,
                        });
                        if !self.eat(TokenKind::Comma) {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                }
                base = self.types.func(base, params, variadic, old_style);
            } else {
                break;
            }
        }

        if let Some((placeholder, name, inner)) = grouped {
            self.types.replace(placeholder, base);
            return Ok((name, inner));
        }
        Ok((name, base))
    }

    fn parse_type_name(&mut self) -> PResult<TypeId> {
        let (base, _) = self.parse_decl_specifiers(false)?;
        let (_, ty) = self.parse_declarator(base)?;
        Ok(ty)
    }

    // ---- Expressions ----

    fn parse_primary_expr(&mut self) -> PResult<Expr> {
        let loc = self.loc();

        match self.kind() {
            TokenKind::IntLit => {
                let tok = self.tok();
                let ty = if tok.flags.contains(TokenFlags::UNSIGNED) {
                    if tok.flags.contains(TokenFlags::LONG_LONG) {
                        types::ULLONG
                    } else if tok.flags.contains(TokenFlags::LONG) {
                        types::ULONG
                    } else {
                        types::UINT
                    }
                } else if tok.flags.contains(TokenFlags::LONG_LONG) {
                    types::LLONG
                } else if tok.flags.contains(TokenFlags::LONG) {
                    types::LONG
                } else {
                    types::INT
                };
                self.bump();
                Ok(Expr::int_lit(tok.ival, ty, loc))
            }
            TokenKind::FloatLit => {
                let tok = self.tok();
                let ty = if tok.flags.contains(TokenFlags::LONG) {
                    types::LDOUBLE
                } else {
                    types::DOUBLE
                };
                self.bump();
                Ok(Expr::float_lit(tok.fval, ty, loc))
            }
            TokenKind::CharLit => {
                let value = self.tok().ival as i32;
                self.bump();
                Ok(Expr::typed(ExprKind::CharLit(value), types::INT, loc))
            }
            TokenKind::StrLit => {
                let mut bytes = self
                    .tok()
                    .text
                    .map(|a| self.sess.interner.bytes(a).to_vec())
                    .unwrap_or_default();
                self.bump();
                // Adjacent string literals concatenate at the token level.
                while self.kind() == TokenKind::StrLit {
                    if let Some(atom) = self.tok().text {
                        bytes.extend_from_slice(self.sess.interner.bytes(atom));
                    }
                    self.bump();
                }
                let len = bytes.len() as u32;
                let atom = self.sess.interner.intern_bytes(&bytes);
                let ty = self.types.array(types::CHAR, Some(len + 1));
                Ok(Expr::typed(ExprKind::StrLit(atom), ty, loc))
            }
            TokenKind::Ident => {
                let name = self.tok().text.unwrap_or(Atom(0));
                self.bump();
                if let Some(sym) = self.symtab.lookup(name) {
                    if sym.kind == SymKind::EnumConst {
                        return Ok(Expr::int_lit(sym.enum_val as u64, types::INT, loc));
                    }
                    return Ok(Expr::typed(ExprKind::Ident(name), sym.ty, loc));
                }
                Ok(Expr::new(ExprKind::Ident(name), loc))
            }
            TokenKind::LParen => {
                self.bump();
                if self.is_type_name() {
                    let target = self.parse_type_name()?;
                    self.expect(TokenKind::RParen)?;
                    if self.kind() == TokenKind::LBrace {
                        let init = self.parse_initializer()?;
                        return Ok(Expr::typed(
                            ExprKind::CompoundLit {
                                target,
                                init: Box::new(init),
                            },
                            target,
                            loc,
                        ));
                    }
                    let operand = self.parse_cast_expr()?;
                    return Ok(Expr::typed(
                        ExprKind::Cast {
                            target,
                            operand: Box::new(operand),
                        },
                        target,
                        loc,
                    ));
                }
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            other => {
                let msg = format!("expected expression, got '{}'", other);
                Err(self.error_here(msg))
            }
        }
    }

    fn parse_postfix_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_primary_expr()?;

        loop {
            let loc = self.loc();
            match self.kind() {
                TokenKind::LBracket => {
                    self.bump();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    let elem = expr
                        .ty
                        .filter(|&t| self.types.is_ptr(t) || self.types.is_array(t))
                        .and_then(|t| self.types.base_of(t));
                    let mut node = Expr::new(
                        ExprKind::Index {
                            base: Box::new(expr),
                            index: Box::new(index),
                        },
                        loc,
                    );
                    node.ty = elem;
                    expr = node;
                }
                TokenKind::LParen if !matches!(expr.kind, ExprKind::Cast { .. }) => {
                    self.bump();
                    let mut args = Vec::new();
                    if self.kind() != TokenKind::RParen {
                        loop {
                            args.push(self.parse_assign_expr()?);
                            if !self.eat(TokenKind::Comma) {
                                break;
                            }
                        }
                    }
                    self.expect(TokenKind::RParen)?;
                    let ret = expr
                        .ty
                        .map(|t| {
                            let f = if self.types.is_ptr(t) {
                                self.types.base_of(t).unwrap_or(t)
                            } else {
                                t
                            };
                            self.types.return_type_of(f).unwrap_or(types::INT)
                        })
                        .unwrap_or(types::INT);
                    expr = Expr::typed(
                        ExprKind::Call {
                            callee: Box::new(expr),
                            args,
                        },
                        ret,
                        loc,
                    );
                }
                TokenKind::Dot | TokenKind::Arrow => {
                    let arrow = self.kind() == TokenKind::Arrow;
                    self.bump();
                    let name = self.tok().text.unwrap_or(Atom(0));
                    self.expect(TokenKind::Ident)?;
                    let record = if arrow {
                        expr.ty
                            .filter(|&t| self.types.is_ptr(t))
                            .and_then(|t| self.types.base_of(t))
                    } else {
                        expr.ty
                    };
                    let member_ty =
                        record.and_then(|r| self.types.find_member(r, name)).map(|m| m.ty);
                    let mut node = Expr::new(
                        ExprKind::Member {
                            base: Box::new(expr),
                            name,
                            arrow,
                        },
                        loc,
                    );
                    node.ty = member_ty;
                    expr = node;
                }
                TokenKind::PlusPlus | TokenKind::MinusMinus => {
                    let op = if self.kind() == TokenKind::PlusPlus {
                        UnaryOp::PostInc
                    } else {
                        UnaryOp::PostDec
                    };
                    self.bump();
                    let ty = expr.ty;
                    let mut node = Expr::new(
                        ExprKind::Unary {
                            op,
                            operand: Box::new(expr),
                        },
                        loc,
                    );
                    node.ty = ty;
                    expr = node;
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_unary_expr(&mut self) -> PResult<Expr> {
        let loc = self.loc();

        let prefix = match self.kind() {
            TokenKind::PlusPlus => Some((UnaryOp::PreInc, false)),
            TokenKind::MinusMinus => Some((UnaryOp::PreDec, false)),
            TokenKind::Amp => Some((UnaryOp::Addr, true)),
            TokenKind::Star => Some((UnaryOp::Deref, true)),
            TokenKind::Plus => Some((UnaryOp::Pos, true)),
            TokenKind::Minus => Some((UnaryOp::Neg, true)),
            TokenKind::Tilde => Some((UnaryOp::BitNot, true)),
            TokenKind::Bang => Some((UnaryOp::Not, true)),
            _ => None,
        };

        if let Some((op, cast_operand)) = prefix {
            self.bump();
            let operand = if cast_operand {
                self.parse_cast_expr()?
            } else {
                self.parse_unary_expr()?
            };
            let ty = match op {
                UnaryOp::Not => Some(types::INT),
                UnaryOp::Addr => operand.ty.map(|t| self.types.ptr(t)),
                UnaryOp::Deref => operand
                    .ty
                    .filter(|&t| self.types.is_ptr(t))
                    .and_then(|t| self.types.base_of(t)),
                _ => operand.ty,
            };
            let mut node = Expr::new(
                ExprKind::Unary {
                    op,
                    operand: Box::new(operand),
                },
                loc,
            );
            node.ty = ty;
            return Ok(node);
        }

        if self.kind() == TokenKind::KwSizeof {
            self.bump();
            if self.kind() == TokenKind::LParen {
                let peeked = self.peek();
                let is_type = peeked.kind.is_type_keyword()
                    || (peeked.kind == TokenKind::Ident
                        && peeked
                            .text
                            .map(|a| self.symtab.is_typedef(a))
                            .unwrap_or(false));
                if is_type {
                    self.bump(); // (
                    let ty = self.parse_type_name()?;
                    self.expect(TokenKind::RParen)?;
                    return Ok(Expr::typed(ExprKind::SizeofType(ty), types::UINT, loc));
                }
            }
            let operand = self.parse_unary_expr()?;
            return Ok(Expr::typed(
                ExprKind::SizeofExpr(Box::new(operand)),
                types::UINT,
                loc,
            ));
        }

        self.parse_postfix_expr()
    }

    fn parse_cast_expr(&mut self) -> PResult<Expr> {
        // Casts are recognized in the primary rule via parenthesized type
        // names.
        self.parse_unary_expr()
    }

    fn parse_binary_expr(&mut self, min_prec: i32) -> PResult<Expr> {
        let mut lhs = self.parse_cast_expr()?;

        loop {
            let prec = precedence(self.kind());
            if prec < min_prec {
                break;
            }
            let loc = self.loc();
            let op = binop_kind(self.kind());
            self.bump();
            let rhs = self.parse_binary_expr(prec + 1)?;

            let ty = if op.is_comparison() || op.is_logical() {
                Some(types::INT)
            } else {
                match (lhs.ty, rhs.ty) {
                    (Some(lt), _) if self.types.is_ptr(lt) => Some(lt),
                    (_, Some(rt)) if self.types.is_ptr(rt) => Some(rt),
                    (Some(lt), Some(rt)) => Some(self.types.usual_arith(lt, rt)),
                    _ => None,
                }
            };
            let mut node = Expr::new(
                ExprKind::Binary {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                },
                loc,
            );
            node.ty = ty;
            lhs = node;
        }
        Ok(lhs)
    }

    fn parse_cond_expr(&mut self) -> PResult<Expr> {
        let cond = self.parse_binary_expr(4)?;
        if self.kind() != TokenKind::Question {
            return Ok(cond);
        }
        let loc = self.loc();
        self.bump();
        let then_branch = self.parse_expr()?;
        self.expect(TokenKind::Colon)?;
        let else_branch = self.parse_cond_expr()?;
        let ty = then_branch.ty;
        let mut node = Expr::new(
            ExprKind::Ternary {
                cond: Box::new(cond),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            loc,
        );
        node.ty = ty;
        Ok(node)
    }

    fn parse_assign_expr(&mut self) -> PResult<Expr> {
        let lhs = self.parse_cond_expr()?;
        if let Some(op) = assign_op(self.kind()) {
            let loc = self.loc();
            self.bump();
            let rhs = self.parse_assign_expr()?;
            let ty = lhs.ty;
            let mut node = Expr::new(
                ExprKind::Assign {
                    op,
                    target: Box::new(lhs),
                    value: Box::new(rhs),
                },
                loc,
            );
            node.ty = ty;
            return Ok(node);
        }
        Ok(lhs)
    }

    fn parse_expr(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_assign_expr()?;
        while self.kind() == TokenKind::Comma {
            let loc = self.loc();
            self.bump();
            let rhs = self.parse_assign_expr()?;
            let ty = rhs.ty;
            let mut node = Expr::new(
                ExprKind::Comma {
                    lhs: Box::new(expr),
                    rhs: Box::new(rhs),
                },
                loc,
            );
            node.ty = ty;
            expr = node;
        }
        Ok(expr)
    }

    // ---- Initializers ----

    fn parse_initializer(&mut self) -> PResult<Init> {
        if self.kind() != TokenKind::LBrace {
            return Ok(Init::Expr(self.parse_assign_expr()?));
        }
        let loc = self.loc();
        self.bump();

        let mut items = Vec::new();
        while self.kind() != TokenKind::RBrace && self.kind() != TokenKind::Eof {
            let designator = match self.kind() {
                TokenKind::Dot => {
                    self.bump();
                    let name = self.tok().text.unwrap_or(Atom(0));
                    self.expect(TokenKind::Ident)?;
                    Some(Designator::Field(name))
                }
                TokenKind::LBracket => {
                    self.bump();
                    let index_expr = self.parse_cond_expr()?;
                    self.expect(TokenKind::RBracket)?;
                    Some(Designator::Index(const_eval(&index_expr).unwrap_or(0)))
                }
                _ => None,
            };
            if designator.is_some() {
                self.expect(TokenKind::Assign)?;
            }
            let init = self.parse_initializer()?;
            items.push(InitItem { designator, init });
            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        Ok(Init::List { items, loc })
    }

    // ---- Statements ----

    fn parse_stmt(&mut self) -> PResult<Stmt> {
        let loc = self.loc();

        // Label: identifier followed by colon.
        if self.kind() == TokenKind::Ident && self.peek().kind == TokenKind::Colon {
            let name = self.tok().text.unwrap_or(Atom(0));
            self.bump();
            self.bump();
            self.symtab.define_label(&mut *self.sess, name, loc);
            let stmt = self.parse_stmt()?;
            return Ok(Stmt::new(
                StmtKind::Label {
                    name,
                    stmt: Box::new(stmt),
                },
                loc,
            ));
        }

        match self.kind() {
            TokenKind::LBrace => {
                self.bump();
                self.parse_compound_stmt()
            }
            TokenKind::KwIf => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                let then_branch = self.parse_stmt()?;
                let else_branch = if self.eat(TokenKind::KwElse) {
                    Some(Box::new(self.parse_stmt()?))
                } else {
                    None
                };
                Ok(Stmt::new(
                    StmtKind::If {
                        cond,
                        then_branch: Box::new(then_branch),
                        else_branch,
                    },
                    loc,
                ))
            }
            TokenKind::KwWhile => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                self.loop_depth += 1;
                let body = self.parse_stmt();
                self.loop_depth -= 1;
                Ok(Stmt::new(
                    StmtKind::While {
                        cond,
                        body: Box::new(body?),
                    },
                    loc,
                ))
            }
            TokenKind::KwDo => {
                self.bump();
                self.loop_depth += 1;
                let body = self.parse_stmt();
                self.loop_depth -= 1;
                let body = body?;
                self.expect(TokenKind::KwWhile)?;
                self.expect(TokenKind::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt::new(
                    StmtKind::DoWhile {
                        body: Box::new(body),
                        cond,
                    },
                    loc,
                ))
            }
            TokenKind::KwFor => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                self.symtab.enter_scope();
                let result = self.parse_for_tail(loc);
                self.symtab.leave_scope();
                result
            }
            TokenKind::KwSwitch => {
                self.bump();
                self.expect(TokenKind::LParen)?;
                let cond = self.parse_expr()?;
                self.expect(TokenKind::RParen)?;
                self.switch_depth += 1;
                let body = self.parse_stmt();
                self.switch_depth -= 1;
                Ok(Stmt::new(
                    StmtKind::Switch {
                        cond,
                        body: Box::new(body?),
                    },
                    loc,
                ))
            }
            TokenKind::KwCase => {
                self.bump();
                let expr = self.parse_cond_expr()?;
                self.expect(TokenKind::Colon)?;
                let value = const_eval(&expr).unwrap_or(0);
                let body = self.parse_stmt()?;
                Ok(Stmt::new(
                    StmtKind::Case {
                        expr,
                        value,
                        body: Box::new(body),
                    },
                    loc,
                ))
            }
            TokenKind::KwDefault => {
                self.bump();
                self.expect(TokenKind::Colon)?;
                let body = self.parse_stmt()?;
                Ok(Stmt::new(StmtKind::Default(Box::new(body)), loc))
            }
            TokenKind::KwBreak => {
                self.bump();
                if self.loop_depth == 0 && self.switch_depth == 0 {
                    self.sess.warn_at(loc, "'break' outside of loop or switch");
                }
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt::new(StmtKind::Break, loc))
            }
            TokenKind::KwContinue => {
                self.bump();
                if self.loop_depth == 0 {
                    self.sess.warn_at(loc, "'continue' outside of loop");
                }
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt::new(StmtKind::Continue, loc))
            }
            TokenKind::KwReturn => {
                self.bump();
                let value = if self.kind() != TokenKind::Semicolon {
                    Some(self.parse_expr()?)
                } else {
                    None
                };
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt::new(StmtKind::Return(value), loc))
            }
            TokenKind::KwGoto => {
                self.bump();
                let name = self.tok().text.unwrap_or(Atom(0));
                self.expect(TokenKind::Ident)?;
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt::new(StmtKind::Goto(name), loc))
            }
            TokenKind::Semicolon => {
                self.bump();
                Ok(Stmt::new(StmtKind::Empty, loc))
            }
            _ => {
                if self.is_type_name() {
                    let decls = self.parse_declaration()?;
                    return Ok(self.decls_to_stmt(decls, loc));
                }
                let expr = self.parse_expr()?;
                self.expect(TokenKind::Semicolon)?;
                Ok(Stmt::new(StmtKind::Expr(expr), loc))
            }
        }
    }

    fn parse_for_tail(&mut self, loc: SrcLoc) -> PResult<Stmt> {
        let init = if self.kind() == TokenKind::Semicolon {
            self.bump();
            None
        } else if self.is_type_name() {
            let decls = self.parse_declaration()?;
            let mut vars = Vec::new();
            for d in decls {
                match d {
                    Decl::Var(v) => vars.push(v),
                    Decl::Func(f) => {
                        self.sess
                            .error_at(f.loc, "function definition is not allowed here");
                    }
                }
            }
            Some(Box::new(ForInit::Decl(vars)))
        } else {
            let expr = self.parse_expr()?;
            self.expect(TokenKind::Semicolon)?;
            Some(Box::new(ForInit::Expr(expr)))
        };

        let cond = if self.kind() != TokenKind::Semicolon {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon)?;
        let step = if self.kind() != TokenKind::RParen {
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(TokenKind::RParen)?;

        self.loop_depth += 1;
        let body = self.parse_stmt();
        self.loop_depth -= 1;
        Ok(Stmt::new(
            StmtKind::For {
                init,
                cond,
                step,
                body: Box::new(body?),
            },
            loc,
        ))
    }

    fn decls_to_stmt(&mut self, decls: Vec<Decl>, loc: SrcLoc) -> Stmt {
        let mut stmts = Vec::new();
        for d in decls {
            match d {
                Decl::Var(v) => {
                    let at = v.loc;
                    stmts.push(Stmt::new(StmtKind::Decl(v), at));
                }
                Decl::Func(f) => {
                    self.sess
                        .error_at(f.loc, "function definition is not allowed here");
                }
            }
        }
        match stmts.len() {
            0 => Stmt::new(StmtKind::Empty, loc),
            1 => stmts.remove(0),
            _ => Stmt::new(StmtKind::Block(stmts), loc),
        }
    }

    /// Compound statement body; the opening brace has been consumed.
    fn parse_compound_stmt(&mut self) -> PResult<Stmt> {
        let loc = self.loc();
        self.symtab.enter_scope();
        let mut stmts = Vec::new();

        while self.kind() != TokenKind::RBrace && self.kind() != TokenKind::Eof {
            match self.parse_stmt() {
                Ok(stmt) => {
                    // Declaration groups flatten into the block.
                    if let StmtKind::Block(inner) = stmt.kind {
                        stmts.extend(inner);
                    } else {
                        stmts.push(stmt);
                    }
                }
                Err(_) => self.synchronize(),
            }
        }
        let result = self.expect(TokenKind::RBrace);
        self.symtab.leave_scope();
        result?;
        Ok(Stmt::new(StmtKind::Block(stmts), loc))
    }

    // ---- Declarations ----

    fn parse_declaration(&mut self) -> PResult<Vec<Decl>> {
        let loc = self.loc();
        let (base, storage) = self.parse_decl_specifiers(true)?;
        let base_inline = self.types.get(base).is_inline;

        if storage == StorageClass::Typedef {
            loop {
                let (name, ty) = self.parse_declarator(base)?;
                if let Some(name) = name {
                    let sym =
                        self.symtab
                            .define(&mut *self.sess, name, SymKind::Typedef, ty, loc);
                    sym.storage = StorageClass::Typedef;
                }
                if !self.eat(TokenKind::Comma) {
                    break;
                }
            }
            self.expect(TokenKind::Semicolon)?;
            return Ok(Vec::new());
        }

        // Bare struct/union/enum declaration.
        if self.kind() == TokenKind::Semicolon {
            self.bump();
            return Ok(Vec::new());
        }

        let mut decls = Vec::new();
        loop {
            let (name, mut ty) = self.parse_declarator(base)?;
            let Some(name) = name else {
                return Err(self.error_here("expected declarator name"));
            };

            // Function definition.
            if self.types.is_func(ty) && self.kind() == TokenKind::LBrace {
                let sym = self
                    .symtab
                    .define(&mut *self.sess, name, SymKind::Func, ty, loc);
                sym.storage = storage;
                sym.is_defined = true;

                self.symtab.enter_func_scope();
                for p in self.types.params_of(ty) {
                    if let Some(pname) = p.name {
                        self.symtab
                            .define(&mut *self.sess, pname, SymKind::Param, p.ty, loc);
                    }
                }

                self.bump(); // {
                let body = self.parse_compound_stmt();
                self.symtab.leave_scope();

                decls.push(Decl::Func(FuncDef {
                    name,
                    ty,
                    body: body?,
                    storage,
                    is_inline: base_inline,
                    loc,
                }));
                return Ok(decls);
            }

            let sym_kind = if self.types.is_func(ty) {
                SymKind::Func
            } else {
                SymKind::Var
            };
            let sym = self
                .symtab
                .define(&mut *self.sess, name, sym_kind, ty, loc);
            sym.storage = storage;

            if !self.types.is_func(ty) {
                let mut init = None;
                if self.eat(TokenKind::Assign) {
                    let parsed = self.parse_initializer()?;
                    // Complete an incomplete array from its initializer.
                    if self.types.is_array(ty) && !self.types.is_complete(ty) {
                        let elem = self.types.base_of(ty).unwrap_or(types::INT);
                        match &parsed {
                            Init::List { items, .. } => {
                                ty = self.types.array(elem, Some(items.len() as u32));
                            }
                            Init::Expr(e) => {
                                if let ExprKind::StrLit(atom) = &e.kind {
                                    let len = self.sess.interner.bytes(*atom).len() as u32;
                                    ty = self.types.array(elem, Some(len + 1));
                                }
                            }
                        }
                    }
                    init = Some(parsed);
                }
                decls.push(Decl::Var(VarDecl {
                    name,
                    ty,
                    storage,
                    init,
                    loc,
                }));
            }

            if !self.eat(TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::Semicolon)?;
        Ok(decls)
    }

    /// Parse a full translation unit, recovering at declaration boundaries.
    pub fn parse(&mut self) -> Program {
        let mut program = Program::default();
        while self.kind() != TokenKind::Eof {
            match self.parse_declaration() {
                Ok(decls) => program.decls.extend(decls),
                Err(_) => {
                    self.synchronize();
                    // A stray closing brace at file scope would otherwise
                    // stall recovery.
                    if self.kind() == TokenKind::RBrace {
                        self.bump();
                    }
                }
            }
        }
        program
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Parsed {
        program: Program,
        sess: Session,
        types: TypeTable,
        #[allow(dead_code)]
        symtab: SymbolTable,
    }

    fn parse(src: &str) -> Parsed {
        let mut sess = Session::new();
        let mut types = TypeTable::new();
        let mut symtab = SymbolTable::new();
        let file = sess.intern("test.c");
        let program = {
            let mut parser = Parser::new(src, file, &mut sess, &mut types, &mut symtab);
            parser.parse()
        };
        Parsed {
            program,
            sess,
            types,
            symtab,
        }
    }

    fn parse_ok(src: &str) -> Parsed {
        let parsed = parse(src);
        assert_eq!(
            parsed.sess.diags.error_count(),
            0,
            "unexpected errors in: {}",
            src
        );
        parsed
    }

    fn first_func(parsed: &Parsed) -> &FuncDef {
        parsed
            .program
            .decls
            .iter()
            .find_map(|d| match d {
                Decl::Func(f) => Some(f),
                _ => None,
            })
            .expect("no function in program")
    }

    #[test]
    fn parses_a_minimal_main() {
        let parsed = parse_ok("int main(void) { return 0; }");
        let f = first_func(&parsed);
        assert_eq!(parsed.sess.str(f.name), "main");
        assert_eq!(parsed.types.return_type_of(f.ty), Some(types::INT));
    }

    #[test]
    fn declarators_build_pointer_and_array_types() {
        let parsed = parse_ok("int *p; int a[10]; char **pp;");
        let tys: Vec<TypeId> = parsed
            .program
            .decls
            .iter()
            .map(|d| match d {
                Decl::Var(v) => v.ty,
                _ => panic!("expected var"),
            })
            .collect();
        assert!(parsed.types.is_ptr(tys[0]));
        assert!(parsed.types.is_array(tys[1]));
        assert_eq!(parsed.types.size_of(tys[1]), 40);
        let inner = parsed.types.base_of(tys[2]).unwrap();
        assert!(parsed.types.is_ptr(inner));
    }

    #[test]
    fn grouped_declarator_is_a_function_pointer() {
        let parsed = parse_ok("int (*op)(int, int);");
        let Decl::Var(v) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        assert!(parsed.types.is_ptr(v.ty));
        let pointee = parsed.types.base_of(v.ty).unwrap();
        assert!(parsed.types.is_func(pointee));
        assert_eq!(parsed.types.params_of(pointee).len(), 2);
    }

    #[test]
    fn struct_layout_and_member_offsets() {
        let parsed = parse_ok("struct P { char c; int x; short s; }; struct P p;");
        let Decl::Var(v) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        assert_eq!(parsed.types.size_of(v.ty), 12);
        assert_eq!(parsed.types.align_of(v.ty), 4);
        let members = parsed.types.members_of(v.ty);
        assert_eq!(members[0].offset, 0);
        assert_eq!(members[1].offset, 4);
        assert_eq!(members[2].offset, 8);
    }

    #[test]
    fn union_size_is_max_member_rounded() {
        let parsed = parse_ok("union U { char c; int x; double d; }; union U u;");
        let Decl::Var(v) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        assert_eq!(parsed.types.size_of(v.ty), 8);
        assert!(parsed
            .types
            .members_of(v.ty)
            .iter()
            .all(|m| m.offset == 0));
    }

    #[test]
    fn anonymous_members_flatten() {
        let parsed = parse_ok(
            "struct Outer { int a; struct { int b; int c; }; int d; }; struct Outer o;",
        );
        let Decl::Var(v) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        let mut sess = parsed.sess;
        let b = sess.intern("b");
        let c = sess.intern("c");
        let member_b = parsed.types.find_member(v.ty, b).unwrap();
        let member_c = parsed.types.find_member(v.ty, c).unwrap();
        assert_eq!(member_b.offset, 4);
        assert_eq!(member_c.offset, 8);
        assert_eq!(parsed.types.size_of(v.ty), 16);
    }

    #[test]
    fn self_referential_struct_closes_forward_reference() {
        let parsed = parse_ok("struct Node { int value; struct Node *next; }; struct Node n;");
        let Decl::Var(v) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        assert_eq!(parsed.types.size_of(v.ty), 8);
        let members = parsed.types.members_of(v.ty);
        let next_ty = members[1].ty;
        assert!(parsed.types.is_ptr(next_ty));
        assert_eq!(parsed.types.base_of(next_ty), Some(v.ty));
    }

    #[test]
    fn enum_constants_fold_to_literals() {
        let parsed = parse_ok("enum Color { RED, GREEN = 5, BLUE }; int x = BLUE;");
        let Decl::Var(v) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        let Some(Init::Expr(e)) = &v.init else {
            panic!("expected expr init");
        };
        assert!(matches!(e.kind, ExprKind::IntLit(6)));
    }

    #[test]
    fn typedef_names_parse_as_types() {
        let parsed = parse_ok("typedef unsigned int uint; uint x; typedef uint *uintp; uintp p;");
        let Decl::Var(v) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        assert_eq!(v.ty, types::UINT);
        let Decl::Var(p) = &parsed.program.decls[1] else {
            panic!("expected var");
        };
        assert!(parsed.types.is_ptr(p.ty));
    }

    #[test]
    fn incomplete_array_completed_by_initializer() {
        let parsed = parse_ok("int a[] = {1, 2, 3}; char s[] = \"hi\";");
        let Decl::Var(a) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        assert_eq!(parsed.types.size_of(a.ty), 12);
        let Decl::Var(s) = &parsed.program.decls[1] else {
            panic!("expected var");
        };
        assert_eq!(parsed.types.size_of(s.ty), 3);
    }

    #[test]
    fn string_literals_concatenate() {
        let parsed = parse_ok("char *s = \"foo\" \"bar\";");
        let Decl::Var(v) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        let Some(Init::Expr(e)) = &v.init else {
            panic!("expected expr init");
        };
        let ExprKind::StrLit(atom) = &e.kind else {
            panic!("expected string literal");
        };
        assert_eq!(parsed.sess.interner.bytes(*atom), b"foobar");
    }

    #[test]
    fn precedence_groups_correctly() {
        let parsed = parse_ok("int x = 1 + 2 * 3;");
        let Decl::Var(v) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        let Some(Init::Expr(e)) = &v.init else {
            panic!("expected expr");
        };
        assert_eq!(const_eval(e), Some(7));
    }

    #[test]
    fn sizeof_type_and_expr_forms() {
        let parsed = parse_ok("int a = sizeof(int); int b[4]; int c = sizeof b;");
        let Decl::Var(v) = &parsed.program.decls[0] else {
            panic!("expected var");
        };
        let Some(Init::Expr(e)) = &v.init else {
            panic!("expected expr");
        };
        assert!(matches!(e.kind, ExprKind::SizeofType(_)));
    }

    #[test]
    fn variadic_function_declaration() {
        let parsed = parse_ok("int printf(const char *fmt, ...); int main(void) { return 0; }");
        let mut sess = parsed.sess;
        let name = sess.intern("printf");
        let sym = parsed.symtab.lookup(name).unwrap();
        assert!(parsed.types.is_variadic(sym.ty));
    }

    #[test]
    fn error_recovery_continues_at_statement_boundary() {
        let parsed = parse(
            "int main(void) { int x = ; x = 1; return x; }\nint other(void) { return 2; }",
        );
        assert!(parsed.sess.diags.error_count() > 0);
        assert_eq!(parsed.program.decls.len(), 2);
    }

    #[test]
    fn case_labels_fold_constants() {
        let parsed = parse_ok(
            "int f(int x) { switch (x) { case 1 + 2: return 1; default: return 0; } }",
        );
        let f = first_func(&parsed);
        let StmtKind::Block(stmts) = &f.body.kind else {
            panic!("expected block");
        };
        let StmtKind::Switch { body, .. } = &stmts[0].kind else {
            panic!("expected switch");
        };
        let StmtKind::Block(case_stmts) = &body.kind else {
            panic!("expected block");
        };
        let StmtKind::Case { value, .. } = &case_stmts[0].kind else {
            panic!("expected case");
        };
        assert_eq!(*value, 3);
    }

    #[test]
    fn for_loop_with_declared_init() {
        let parsed = parse_ok("int f(void) { int s = 0; for (int i = 0; i < 10; i++) s += i; return s; }");
        let f = first_func(&parsed);
        let StmtKind::Block(stmts) = &f.body.kind else {
            panic!("expected block");
        };
        assert!(matches!(
            stmts[1].kind,
            StmtKind::For {
                init: Some(_),
                cond: Some(_),
                step: Some(_),
                ..
            }
        ));
    }
}
