use crate::compiler::ast::{
    BinaryOp, Decl, Expr, ExprKind, ForInit, Init, Program, Stmt, StmtKind, UnaryOp, VarDecl,
};
use crate::compiler::session::Session;
use crate::compiler::symtab::SymbolTable;
use crate::compiler::types::{self, TypeId, TypeKind, TypeTable};

/// Completes expression typing after parsing: every expression node ends up
/// with a type, implicit conversions become explicit cast nodes, arrays decay
/// in value contexts, and member accesses are resolved.
pub struct Checker<'a> {
    sess: &'a mut Session,
    types: &'a mut TypeTable,
    symtab: &'a SymbolTable,
    current_ret: Option<TypeId>,
}

pub fn check(
    program: &mut Program,
    sess: &mut Session,
    types: &mut TypeTable,
    symtab: &SymbolTable,
) {
    let mut checker = Checker {
        sess,
        types,
        symtab,
        current_ret: None,
    };
    for decl in &mut program.decls {
        checker.check_decl(decl);
    }
}

impl<'a> Checker<'a> {
    fn ensure_type(&mut self, e: &mut Expr) {
        if e.ty.is_none() {
            e.ty = Some(types::INT);
        }
    }

    /// Array-to-pointer decay in a value context.
    fn decay_array(&mut self, e: &mut Expr) {
        if let Some(t) = e.ty {
            if self.types.is_array(t) {
                let base = self.types.base_of(t).unwrap_or(types::INT);
                e.ty = Some(self.types.ptr(base));
            }
        }
    }

    /// Wrap `e` in an implicit cast when its type differs from `target`.
    fn insert_cast(&mut self, e: &mut Expr, target: TypeId) {
        let Some(ty) = e.ty else { return };
        if self.types.is_compatible(ty, target) {
            return;
        }
        let loc = e.loc;
        let inner = std::mem::replace(e, Expr::new(ExprKind::IntLit(0), loc));
        *e = Expr::typed(
            ExprKind::Cast {
                target,
                operand: Box::new(inner),
            },
            target,
            loc,
        );
    }

    fn check_decl(&mut self, decl: &mut Decl) {
        match decl {
            Decl::Func(f) => {
                let prev = self.current_ret;
                self.current_ret = self.types.return_type_of(f.ty);
                self.check_stmt(&mut f.body);
                self.current_ret = prev;
            }
            Decl::Var(v) => self.check_var_decl(v),
        }
    }

    fn check_var_decl(&mut self, v: &mut VarDecl) {
        let ty = v.ty;
        let Some(init) = &mut v.init else { return };
        match init {
            Init::List { .. } => self.check_init(init),
            Init::Expr(e) => {
                self.check_expr(e);
                self.ensure_type(e);
                // char arr[] = "..." keeps the literal; the emitter copies it
                // into the array storage directly.
                let char_array_from_string = matches!(e.kind, ExprKind::StrLit(_))
                    && self.types.is_array(ty)
                    && self
                        .types
                        .base_of(ty)
                        .map(|b| matches!(self.types.get(b).kind, TypeKind::Char))
                        == Some(true);
                if !char_array_from_string {
                    self.insert_cast(e, ty);
                }
            }
        }
    }

    fn check_init(&mut self, init: &mut Init) {
        match init {
            Init::Expr(e) => {
                self.check_expr(e);
                self.ensure_type(e);
            }
            Init::List { items, .. } => {
                for item in items {
                    self.check_init(&mut item.init);
                }
            }
        }
    }

    fn check_stmt(&mut self, stmt: &mut Stmt) {
        match &mut stmt.kind {
            StmtKind::Block(stmts) => {
                for s in stmts {
                    self.check_stmt(s);
                }
            }
            StmtKind::Expr(e) => self.check_expr(e),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                self.check_expr(cond);
                self.check_stmt(then_branch);
                if let Some(els) = else_branch {
                    self.check_stmt(els);
                }
            }
            StmtKind::While { cond, body } | StmtKind::DoWhile { body, cond } => {
                self.check_expr(cond);
                self.check_stmt(body);
            }
            StmtKind::For {
                init,
                cond,
                step,
                body,
            } => {
                if let Some(fi) = init {
                    match fi.as_mut() {
                        ForInit::Decl(vars) => {
                            for v in vars {
                                self.check_var_decl(v);
                            }
                        }
                        ForInit::Expr(e) => self.check_expr(e),
                    }
                }
                if let Some(c) = cond {
                    self.check_expr(c);
                }
                if let Some(s) = step {
                    self.check_expr(s);
                }
                self.check_stmt(body);
            }
            StmtKind::Switch { cond, body } => {
                self.check_expr(cond);
                self.check_stmt(body);
            }
            StmtKind::Case { expr, body, .. } => {
                self.check_expr(expr);
                self.check_stmt(body);
            }
            StmtKind::Default(body) => self.check_stmt(body),
            StmtKind::Return(value) => {
                if let Some(e) = value {
                    self.check_expr(e);
                    self.ensure_type(e);
                    if let Some(ret) = self.current_ret {
                        if !self.types.is_void(ret) {
                            self.insert_cast(e, ret);
                        }
                    }
                }
            }
            StmtKind::Label { stmt, .. } => self.check_stmt(stmt),
            StmtKind::Decl(v) => self.check_var_decl(v),
            StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Goto(_)
            | StmtKind::Empty => {}
        }
    }

    fn check_expr(&mut self, e: &mut Expr) {
        let loc = e.loc;
        match &mut e.kind {
            ExprKind::IntLit(_)
            | ExprKind::FloatLit(_)
            | ExprKind::CharLit(_)
            | ExprKind::StrLit(_) => {}

            ExprKind::Ident(name) => {
                if e.ty.is_none() {
                    match self.symtab.lookup(*name) {
                        Some(sym) => e.ty = Some(sym.ty),
                        None => {
                            let text = self.sess.interner.str(*name).to_string();
                            self.sess
                                .error_at(loc, format!("undeclared identifier '{}'", text));
                            e.ty = Some(types::INT);
                        }
                    }
                }
            }

            ExprKind::Unary { op, operand } => {
                let op = *op;
                self.check_expr(operand);
                self.ensure_type(operand);
                let operand_ty = operand.ty.unwrap_or(types::INT);
                match op {
                    UnaryOp::Neg | UnaryOp::Pos => {
                        if !self.types.is_arithmetic(operand_ty) {
                            self.sess
                                .error_at(loc, "operand of unary +/- must be arithmetic");
                        }
                        e.ty = Some(self.types.int_promote(operand_ty));
                    }
                    UnaryOp::Not => {
                        if !self.types.is_scalar(operand_ty) {
                            self.sess.error_at(loc, "operand of ! must be scalar");
                        }
                        e.ty = Some(types::INT);
                    }
                    UnaryOp::BitNot => {
                        if !self.types.is_integer(operand_ty) {
                            self.sess.error_at(loc, "operand of ~ must be integer");
                        }
                        e.ty = Some(self.types.int_promote(operand_ty));
                    }
                    UnaryOp::Deref => {
                        if !self.types.is_ptr(operand_ty) && !self.types.is_array(operand_ty) {
                            self.sess
                                .error_at(loc, "cannot dereference non-pointer type");
                            e.ty = Some(types::INT);
                        } else {
                            e.ty = self.types.base_of(operand_ty);
                        }
                    }
                    UnaryOp::Addr => {
                        e.ty = Some(self.types.ptr(operand_ty));
                    }
                    UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                        e.ty = Some(operand_ty);
                    }
                }
            }

            ExprKind::Binary { op, lhs, rhs } => {
                let op = *op;
                self.check_expr(lhs);
                self.check_expr(rhs);
                self.ensure_type(lhs);
                self.ensure_type(rhs);

                match op {
                    BinaryOp::Add
                    | BinaryOp::Sub
                    | BinaryOp::Mul
                    | BinaryOp::Div
                    | BinaryOp::Mod => {
                        self.decay_array(lhs);
                        self.decay_array(rhs);
                        let lt = lhs.ty.unwrap_or(types::INT);
                        let rt = rhs.ty.unwrap_or(types::INT);

                        if matches!(op, BinaryOp::Add | BinaryOp::Sub) {
                            if self.types.is_ptr(lt) && self.types.is_integer(rt) {
                                self.check_ptr_arith(lt, loc);
                                e.ty = Some(lt);
                                return;
                            }
                            if op == BinaryOp::Add
                                && self.types.is_integer(lt)
                                && self.types.is_ptr(rt)
                            {
                                self.check_ptr_arith(rt, loc);
                                e.ty = Some(rt);
                                return;
                            }
                            if op == BinaryOp::Sub
                                && self.types.is_ptr(lt)
                                && self.types.is_ptr(rt)
                            {
                                self.check_ptr_arith(lt, loc);
                                e.ty = Some(types::LONG); // ptrdiff_t
                                return;
                            }
                        }

                        if !self.types.is_arithmetic(lt) || !self.types.is_arithmetic(rt) {
                            self.sess
                                .error_at(loc, "invalid operands to binary expression");
                        }
                        e.ty = Some(self.types.usual_arith(lt, rt));
                    }
                    BinaryOp::Shl | BinaryOp::Shr => {
                        let lt = lhs.ty.unwrap_or(types::INT);
                        e.ty = Some(self.types.int_promote(lt));
                    }
                    BinaryOp::Lt
                    | BinaryOp::Le
                    | BinaryOp::Gt
                    | BinaryOp::Ge
                    | BinaryOp::Eq
                    | BinaryOp::Ne => {
                        self.decay_array(lhs);
                        self.decay_array(rhs);
                        e.ty = Some(types::INT);
                    }
                    BinaryOp::BitAnd | BinaryOp::BitOr | BinaryOp::BitXor => {
                        let lt = lhs.ty.unwrap_or(types::INT);
                        let rt = rhs.ty.unwrap_or(types::INT);
                        e.ty = Some(self.types.usual_arith(lt, rt));
                    }
                    BinaryOp::LogAnd | BinaryOp::LogOr => {
                        e.ty = Some(types::INT);
                    }
                }
            }

            ExprKind::Assign { target, value, .. } => {
                self.check_expr(target);
                self.check_expr(value);
                self.ensure_type(target);
                self.ensure_type(value);
                self.decay_array(value);
                let target_ty = target.ty.unwrap_or(types::INT);
                self.insert_cast(value, target_ty);
                e.ty = Some(target_ty);
            }

            ExprKind::Ternary {
                cond,
                then_branch,
                else_branch,
            } => {
                self.check_expr(cond);
                self.check_expr(then_branch);
                self.check_expr(else_branch);
                self.ensure_type(then_branch);
                self.ensure_type(else_branch);
                let tt = then_branch.ty.unwrap_or(types::INT);
                let et = else_branch.ty.unwrap_or(types::INT);
                e.ty = if self.types.is_arithmetic(tt) && self.types.is_arithmetic(et) {
                    Some(self.types.usual_arith(tt, et))
                } else {
                    Some(tt)
                };
            }

            ExprKind::Comma { lhs, rhs } => {
                self.check_expr(lhs);
                self.check_expr(rhs);
                self.ensure_type(rhs);
                e.ty = rhs.ty;
            }

            ExprKind::Call { callee, args } => {
                self.check_expr(callee);
                for arg in args.iter_mut() {
                    self.check_expr(arg);
                }
                // Recompute the return type through the callee's function or
                // function-pointer type; the parser may have defaulted to int.
                if let Some(ct) = callee.ty {
                    let f = if self.types.is_ptr(ct) {
                        self.types.base_of(ct).unwrap_or(ct)
                    } else {
                        ct
                    };
                    if let Some(ret) = self.types.return_type_of(f) {
                        e.ty = Some(ret);
                    }
                }
            }

            ExprKind::Member { base, name, arrow } => {
                let name = *name;
                let arrow = *arrow;
                self.check_expr(base);
                self.ensure_type(base);
                let base_ty = base.ty.unwrap_or(types::INT);
                let record = if arrow {
                    if self.types.is_ptr(base_ty) {
                        self.types.base_of(base_ty)
                    } else {
                        None
                    }
                } else {
                    Some(base_ty)
                };
                if let Some(record) = record.filter(|&r| self.types.is_record(r)) {
                    match self.types.find_member(record, name) {
                        Some(m) => e.ty = Some(m.ty),
                        None => {
                            let text = self.sess.interner.str(name).to_string();
                            self.sess.error_at(loc, format!("no member '{}'", text));
                        }
                    }
                }
            }

            ExprKind::Index { base, index } => {
                self.check_expr(base);
                self.check_expr(index);
                self.ensure_type(base);
                self.ensure_type(index);
                let bt = base.ty.unwrap_or(types::INT);
                let it = index.ty.unwrap_or(types::INT);
                if self.types.is_ptr(bt) || self.types.is_array(bt) {
                    e.ty = self.types.base_of(bt);
                } else if self.types.is_ptr(it) || self.types.is_array(it) {
                    e.ty = self.types.base_of(it);
                } else {
                    self.sess
                        .error_at(loc, "subscript requires array or pointer");
                }
            }

            ExprKind::Cast { target, operand } => {
                let target = *target;
                self.check_expr(operand);
                e.ty = Some(target);
            }

            ExprKind::CompoundLit { target, init } => {
                let target = *target;
                self.check_init(init);
                e.ty = Some(target);
            }

            ExprKind::SizeofExpr(operand) => {
                self.check_expr(operand);
                self.ensure_type(operand);
                e.ty = Some(types::UINT);
            }

            ExprKind::SizeofType(_) => {
                e.ty = Some(types::UINT);
            }
        }
        self.ensure_type(e);
    }

    /// Pointer arithmetic on `void *` has no element size (C99 6.5.6).
    fn check_ptr_arith(&mut self, ptr_ty: TypeId, loc: crate::compiler::diagnostics::SrcLoc) {
        if let Some(base) = self.types.base_of(ptr_ty) {
            if self.types.is_void(base) {
                self.sess
                    .error_at(loc, "arithmetic on a pointer to void");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::parser::Parser;

    struct Checked {
        program: Program,
        sess: Session,
        types: TypeTable,
    }

    fn check_source(src: &str) -> Checked {
        let mut sess = Session::new();
        let mut types = TypeTable::new();
        let mut symtab = SymbolTable::new();
        let file = sess.intern("test.c");
        let mut program = {
            let mut parser = Parser::new(src, file, &mut sess, &mut types, &mut symtab);
            parser.parse()
        };
        check(&mut program, &mut sess, &mut types, &symtab);
        Checked {
            program,
            sess,
            types,
        }
    }

    fn every_expr_typed(e: &Expr) -> bool {
        if e.ty.is_none() {
            return false;
        }
        match &e.kind {
            ExprKind::Unary { operand, .. } => every_expr_typed(operand),
            ExprKind::Binary { lhs, rhs, .. } => every_expr_typed(lhs) && every_expr_typed(rhs),
            ExprKind::Assign { target, value, .. } => {
                every_expr_typed(target) && every_expr_typed(value)
            }
            ExprKind::Ternary {
                cond,
                then_branch,
                else_branch,
            } => {
                every_expr_typed(cond)
                    && every_expr_typed(then_branch)
                    && every_expr_typed(else_branch)
            }
            ExprKind::Call { callee, args } => {
                every_expr_typed(callee) && args.iter().all(every_expr_typed)
            }
            ExprKind::Member { base, .. } => every_expr_typed(base),
            ExprKind::Index { base, index } => every_expr_typed(base) && every_expr_typed(index),
            ExprKind::Cast { operand, .. } => every_expr_typed(operand),
            ExprKind::Comma { lhs, rhs } => every_expr_typed(lhs) && every_expr_typed(rhs),
            ExprKind::SizeofExpr(operand) => every_expr_typed(operand),
            _ => true,
        }
    }

    fn stmt_exprs_typed(s: &Stmt) -> bool {
        match &s.kind {
            StmtKind::Block(stmts) => stmts.iter().all(stmt_exprs_typed),
            StmtKind::Expr(e) => every_expr_typed(e),
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                every_expr_typed(cond)
                    && stmt_exprs_typed(then_branch)
                    && else_branch.as_deref().map(stmt_exprs_typed).unwrap_or(true)
            }
            StmtKind::While { cond, body } | StmtKind::DoWhile { body, cond } => {
                every_expr_typed(cond) && stmt_exprs_typed(body)
            }
            StmtKind::Return(Some(e)) => every_expr_typed(e),
            _ => true,
        }
    }

    #[test]
    fn every_expression_has_a_type_after_checking() {
        let checked = check_source(
            "int add(int a, int b) { return a + b; }\n\
             int main(void) { int x = add(1, 2); if (x > 1) x = x * 2; return x; }",
        );
        assert_eq!(checked.sess.diags.error_count(), 0);
        for decl in &checked.program.decls {
            if let Decl::Func(f) = decl {
                assert!(stmt_exprs_typed(&f.body));
            }
        }
    }

    #[test]
    fn return_value_gets_implicit_cast() {
        let checked = check_source("double f(void) { return 1; }");
        assert_eq!(checked.sess.diags.error_count(), 0);
        let Decl::Func(f) = &checked.program.decls[0] else {
            panic!("expected function");
        };
        let StmtKind::Block(stmts) = &f.body.kind else {
            panic!("expected block");
        };
        let StmtKind::Return(Some(e)) = &stmts[0].kind else {
            panic!("expected return");
        };
        assert!(matches!(e.kind, ExprKind::Cast { .. }));
        assert_eq!(e.ty, Some(types::DOUBLE));
    }

    #[test]
    fn pointer_minus_pointer_is_signed_integer() {
        let checked = check_source("int f(int *a, int *b) { return b - a; }");
        assert_eq!(checked.sess.diags.error_count(), 0);
        let Decl::Func(f) = &checked.program.decls[0] else {
            panic!("expected function");
        };
        let StmtKind::Block(stmts) = &f.body.kind else {
            panic!("expected block");
        };
        let StmtKind::Return(Some(e)) = &stmts[0].kind else {
            panic!("expected return");
        };
        // return cast wraps the subtraction to int; the subtraction is long.
        let sub = match &e.kind {
            ExprKind::Cast { operand, .. } => operand,
            _ => panic!("expected cast around return value"),
        };
        assert_eq!(sub.ty, Some(types::LONG));
    }

    #[test]
    fn void_pointer_arithmetic_is_an_error() {
        let checked = check_source("void *f(void *p) { return p + 1; }");
        assert_eq!(checked.sess.diags.error_count(), 1);
    }

    #[test]
    fn char_pointer_arithmetic_is_fine() {
        let checked = check_source("char *f(char *p) { return p + 1; }");
        assert_eq!(checked.sess.diags.error_count(), 0);
    }

    #[test]
    fn undeclared_identifier_reports_and_falls_back() {
        let checked = check_source("int f(void) { return missing; }");
        assert_eq!(checked.sess.diags.error_count(), 1);
    }

    #[test]
    fn missing_member_reports() {
        let checked = check_source("struct P { int x; }; int f(struct P p) { return p.y; }");
        assert_eq!(checked.sess.diags.error_count(), 1);
    }

    #[test]
    fn member_access_resolves_types() {
        let checked = check_source(
            "struct P { int x; double d; }; double f(struct P *p) { return p->d; }",
        );
        assert_eq!(checked.sess.diags.error_count(), 0);
    }

    #[test]
    fn array_decays_in_arithmetic() {
        let checked = check_source("int f(void) { int a[3]; return *(a + 1); }");
        assert_eq!(checked.sess.diags.error_count(), 0);
    }

    #[test]
    fn comparisons_are_int_typed() {
        let checked = check_source("int f(double a, double b) { return a < b; }");
        assert_eq!(checked.sess.diags.error_count(), 0);
        let Decl::Func(f) = &checked.program.decls[0] else {
            panic!("expected function");
        };
        let StmtKind::Block(stmts) = &f.body.kind else {
            panic!("expected block");
        };
        let StmtKind::Return(Some(e)) = &stmts[0].kind else {
            panic!("expected return");
        };
        assert_eq!(e.ty, Some(types::INT));
    }

    #[test]
    fn assignment_inserts_cast_on_value() {
        let checked = check_source("int f(void) { double d; d = 1; return 0; }");
        assert_eq!(checked.sess.diags.error_count(), 0);
        let Decl::Func(f) = &checked.program.decls[0] else {
            panic!("expected function");
        };
        let StmtKind::Block(stmts) = &f.body.kind else {
            panic!("expected block");
        };
        let StmtKind::Expr(e) = &stmts[1].kind else {
            panic!("expected expression statement");
        };
        let ExprKind::Assign { value, .. } = &e.kind else {
            panic!("expected assignment");
        };
        assert!(matches!(value.kind, ExprKind::Cast { .. }));
    }

    #[test]
    fn string_init_of_char_array_keeps_literal() {
        let checked = check_source("int f(void) { char buf[8] = \"hi\"; return buf[0]; }");
        assert_eq!(checked.sess.diags.error_count(), 0);
        let Decl::Func(f) = &checked.program.decls[0] else {
            panic!("expected function");
        };
        let StmtKind::Block(stmts) = &f.body.kind else {
            panic!("expected block");
        };
        let StmtKind::Decl(v) = &stmts[0].kind else {
            panic!("expected declaration");
        };
        let Some(Init::Expr(e)) = &v.init else {
            panic!("expected expr init");
        };
        assert!(matches!(e.kind, ExprKind::StrLit(_)), "no cast expected");
    }
}
